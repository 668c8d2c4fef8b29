use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::JobStatus;

/// Project description submitted by the client: the detected stack and a
/// sample of its source files (file name -> content).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub stack: String,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl ProjectContext {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(name.into(), content.into());
        self
    }
}

/// The generated artifact triple. Any artifact may be missing when the
/// generator left it out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevOpsFiles {
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub compose: Option<String>,
    #[serde(default)]
    pub github_action: Option<String>,
}

/// A unit of deferred generation work, as persisted by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub context: ProjectContext,
    pub result: Option<DevOpsFiles>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh pending job with a random id.
    pub fn new(context: ProjectContext) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            context,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Field-level patch applied by a status update. `None` leaves a field as is.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFields {
    pub status: JobStatus,
    pub result: Option<DevOpsFiles>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobFields {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn apply_to(&self, job: &mut Job) {
        job.status = self.status;
        if let Some(result) = &self.result {
            job.result = Some(result.clone());
        }
        if let Some(error) = &self.error {
            job.error = Some(error.clone());
        }
        job.updated_at = self.updated_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_creation_defaults() {
        let job = Job::new(ProjectContext::new("custom").with_file("a.py", "print(1)"));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.result.is_none());
        assert!(job.error.is_none());
        assert_eq!(job.context.files["a.py"], "print(1)");
        assert_eq!(job.created_at, job.updated_at);
    }

    #[test]
    fn job_ids_are_unique() {
        let a = Job::new(ProjectContext::new("custom"));
        let b = Job::new(ProjectContext::new("custom"));
        assert_ne!(a.id, b.id);
        assert!(Uuid::parse_str(&a.id).is_ok());
    }

    #[test]
    fn devops_files_tolerate_missing_keys() {
        let files: DevOpsFiles = serde_json::from_str(r#"{"dockerfile": "FROM x"}"#).unwrap();
        assert_eq!(files.dockerfile.as_deref(), Some("FROM x"));
        assert!(files.compose.is_none());
        assert!(files.github_action.is_none());
    }

    #[test]
    fn context_files_default_to_empty() {
        let ctx: ProjectContext = serde_json::from_str(r#"{"stack": "elixir"}"#).unwrap();
        assert_eq!(ctx.stack, "elixir");
        assert!(ctx.files.is_empty());
    }

    #[test]
    fn fields_patch_keeps_untouched_values() {
        let mut job = Job::new(ProjectContext::new("custom"));
        job.status = JobStatus::Processing;

        let mut fields = JobFields::status(JobStatus::Failed);
        fields.error = Some("boom".into());
        fields.apply_to(&mut job);

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.result.is_none());
        assert_eq!(job.context.stack, "custom");
    }
}
