use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::job::{Job, JobFields, JobStatus};

use super::WriteOutcome;

struct Entry {
    job: Job,
    expires_at: Instant,
}

/// In-process job table. A single lock guards every read and every
/// read-modify-write, so no two operations interleave.
pub struct MemoryBackend {
    jobs: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl MemoryBackend {
    pub fn new(ttl: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Inserts `job` and drops every record whose TTL has run out.
    pub fn create(&self, job: &Job) {
        let now = Instant::now();
        let expires_at = now + self.ttl;
        let mut jobs = self.jobs.lock();
        jobs.retain(|_, entry| entry.expires_at > now);
        jobs.insert(
            job.id.clone(),
            Entry {
                job: job.clone(),
                expires_at,
            },
        );
    }

    pub fn get_fields(&self, id: &str) -> Option<Job> {
        let mut jobs = self.jobs.lock();
        Self::live_entry(&mut jobs, id).map(|entry| entry.job.clone())
    }

    /// Applies `fields` only if the job exists and is currently `expected`.
    pub fn set_fields(&self, id: &str, expected: JobStatus, fields: &JobFields) -> WriteOutcome {
        let mut jobs = self.jobs.lock();
        let ttl = self.ttl;
        let Some(entry) = Self::live_entry(&mut jobs, id) else {
            return WriteOutcome::Missing;
        };
        if entry.job.status != expected {
            return WriteOutcome::Conflict(entry.job.status);
        }
        fields.apply_to(&mut entry.job);
        entry.expires_at = Instant::now() + ttl;
        WriteOutcome::Written
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut jobs = self.jobs.lock();
        jobs.retain(|_, entry| entry.expires_at > now);
        jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Expired entries are dropped on access.
    fn live_entry<'a>(jobs: &'a mut HashMap<String, Entry>, id: &str) -> Option<&'a mut Entry> {
        let expired = jobs
            .get(id)
            .is_some_and(|entry| entry.expires_at <= Instant::now());
        if expired {
            jobs.remove(id);
            return None;
        }
        jobs.get_mut(id)
    }
}
