use std::sync::Arc;

use serde::Serialize;
use tracing::{Instrument, error, info, instrument};

use crate::error::SpectraError;
use crate::generation::BoundedGeneration;
use crate::job::{DevOpsFiles, JobStatus, ProjectContext};
use crate::store::{JobStore, UpdateOutcome};
use crate::templates::get_template;

/// What `dispatch` did with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// A built-in template answered the request; nothing was stored.
    Template(DevOpsFiles),
    /// A job was created and waits for a trigger.
    Queued { job_id: String, status: JobStatus },
}

/// What `trigger` did with a job.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// This call ran the generation step and stored the result.
    Processed { job_id: String },
    /// The job was not pending; nothing changed.
    Unchanged { job_id: String, status: JobStatus },
}

/// Public view of a job, as returned by `query`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub status: JobStatus,
    pub result: Option<DevOpsFiles>,
    pub error: Option<String>,
}

/// Drives jobs through PENDING → PROCESSING → COMPLETED | FAILED.
///
/// Every state change goes through the [`JobStore`].
pub struct JobOrchestrator {
    store: Arc<JobStore>,
    generation: BoundedGeneration,
}

impl JobOrchestrator {
    pub fn new(store: Arc<JobStore>, generation: BoundedGeneration) -> Self {
        Self { store, generation }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Answers from the template catalogue, or queues a job for `context`.
    #[instrument(skip_all, fields(stack = %context.stack))]
    pub async fn dispatch(&self, context: ProjectContext) -> Dispatch {
        if let Some(files) = get_template(&context.stack) {
            info!("template hit");
            return Dispatch::Template(files);
        }
        let job_id = self.store.create(context).await;
        Dispatch::Queued {
            job_id,
            status: JobStatus::Pending,
        }
    }

    /// Runs the generation step for a pending job.
    ///
    /// Claiming the job is a compare-and-set `pending -> processing`, so of
    /// several concurrent triggers exactly one runs the generation step; the
    /// others report the status they observed.
    #[instrument(skip(self))]
    pub async fn trigger(&self, job_id: &str) -> Result<TriggerOutcome, SpectraError> {
        let job = self
            .store
            .get(job_id)
            .await
            .ok_or_else(|| SpectraError::JobNotFound(job_id.to_string()))?;

        if job.status != JobStatus::Pending {
            return Ok(TriggerOutcome::Unchanged {
                job_id: job.id,
                status: job.status,
            });
        }

        match self
            .store
            .update_status(job_id, JobStatus::Processing, None, None)
            .await
        {
            UpdateOutcome::Applied => {}
            UpdateOutcome::NotFound => return Err(SpectraError::JobNotFound(job_id.to_string())),
            UpdateOutcome::Rejected { current } => {
                return Ok(TriggerOutcome::Unchanged {
                    job_id: job.id,
                    status: current.unwrap_or(JobStatus::Processing),
                });
            }
        }

        // Generation and the terminal write run on their own task: dropping
        // the caller must not leave the job claimed forever.
        let store = Arc::clone(&self.store);
        let generation = self.generation.clone();
        let id = job.id.clone();
        let context = job.context;
        let finishing = tokio::spawn(
            async move { finish(&store, &generation, &id, &context).await }.in_current_span(),
        );

        match finishing.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                error!(error = %join_err, "generation task died");
                let reason = format!("generation task aborted: {join_err}");
                self.store
                    .update_status(job_id, JobStatus::Failed, None, Some(reason.clone()))
                    .await;
                Err(SpectraError::Generation(reason))
            }
        }
    }

    pub async fn query(&self, job_id: &str) -> Result<JobView, SpectraError> {
        let job = self
            .store
            .get(job_id)
            .await
            .ok_or_else(|| SpectraError::JobNotFound(job_id.to_string()))?;
        Ok(JobView {
            job_id: job.id,
            status: job.status,
            result: job.result,
            error: job.error,
        })
    }
}

/// Runs generation for a claimed job and records the terminal status.
async fn finish(
    store: &JobStore,
    generation: &BoundedGeneration,
    job_id: &str,
    context: &ProjectContext,
) -> Result<TriggerOutcome, SpectraError> {
    match generation.run(context).await {
        Ok(files) => {
            match store
                .update_status(job_id, JobStatus::Completed, Some(files), None)
                .await
            {
                UpdateOutcome::Applied => {
                    info!("job processed");
                    Ok(TriggerOutcome::Processed {
                        job_id: job_id.to_string(),
                    })
                }
                UpdateOutcome::NotFound => {
                    error!("job vanished before its result was recorded");
                    Err(SpectraError::JobNotFound(job_id.to_string()))
                }
                UpdateOutcome::Rejected { current } => {
                    error!(?current, "result discarded, job left processing elsewhere");
                    Ok(TriggerOutcome::Unchanged {
                        job_id: job_id.to_string(),
                        status: current.unwrap_or(JobStatus::Processing),
                    })
                }
            }
        }
        Err(err) => {
            error!(%err, "generation failed");
            let outcome = store
                .update_status(job_id, JobStatus::Failed, None, Some(err.to_string()))
                .await;
            if outcome != UpdateOutcome::Applied {
                error!(?outcome, "failure was not recorded");
            }
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::anthropic::{
        AnthropicError, ContentBlock, MessageSender, MessagesRequest, MessagesResponse, Usage,
    };
    use crate::generation::GenerationSettings;
    use crate::store::StoreConfig;

    /// Counts calls and replies with a fixed text after `delay`.
    struct StubSender {
        reply: Option<String>,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageSender for StubSender {
        async fn send_message(
            &self,
            _req: &MessagesRequest,
        ) -> Result<MessagesResponse, AnthropicError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match &self.reply {
                Some(text) => Ok(MessagesResponse {
                    id: "stub".into(),
                    content: vec![ContentBlock {
                        content_type: "text".into(),
                        text: text.clone(),
                    }],
                    model: "stub".into(),
                    stop_reason: Some("end_turn".into()),
                    usage: Usage::default(),
                }),
                None => Err(AnthropicError::MissingApiKey),
            }
        }
    }

    const REPLY: &str = r#"{"dockerfile":"FROM x","compose":"","github_action":""}"#;

    fn orchestrator(
        reply: Option<&str>,
        delay: Duration,
        timeout: Duration,
    ) -> (Arc<JobOrchestrator>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let sender = StubSender {
            reply: reply.map(str::to_string),
            delay,
            calls: Arc::clone(&calls),
        };
        let generation = BoundedGeneration::new(
            Arc::new(sender),
            GenerationSettings {
                timeout,
                ..GenerationSettings::default()
            },
        );
        let orch = JobOrchestrator::new(Arc::new(JobStore::in_memory()), generation);
        (Arc::new(orch), calls)
    }

    fn quick(reply: &str) -> (Arc<JobOrchestrator>, Arc<AtomicUsize>) {
        orchestrator(Some(reply), Duration::ZERO, Duration::from_secs(5))
    }

    fn custom_context() -> ProjectContext {
        ProjectContext::new("custom").with_file("a.py", "print(1)")
    }

    fn queued_id(dispatch: Dispatch) -> String {
        match dispatch {
            Dispatch::Queued { job_id, status } => {
                assert_eq!(status, JobStatus::Pending);
                job_id
            }
            other => panic!("expected a queued job, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn template_stack_never_creates_a_job() {
        let (orch, calls) = quick(REPLY);
        let dispatch = orch
            .dispatch(ProjectContext::new("python").with_file("main.py", "print('hi')"))
            .await;

        match dispatch {
            Dispatch::Template(files) => assert!(files.dockerfile.unwrap().contains("python")),
            other => panic!("expected template, got {other:?}"),
        }
        assert!(orch.store().memory().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_stack_queues_distinct_jobs() {
        let (orch, _) = quick(REPLY);
        let first = queued_id(orch.dispatch(custom_context()).await);
        let second = queued_id(orch.dispatch(custom_context()).await);
        assert_ne!(first, second);

        let view = orch.query(&first).await.unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert!(view.result.is_none());
    }

    #[tokio::test]
    async fn trigger_unknown_id_is_not_found() {
        let (orch, calls) = quick(REPLY);
        let err = orch.trigger("missing").await.unwrap_err();
        assert!(matches!(err, SpectraError::JobNotFound(_)));
        assert!(orch.store().get("missing").await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn trigger_completes_job() {
        let (orch, calls) = quick(REPLY);
        let id = queued_id(orch.dispatch(custom_context()).await);

        let outcome = orch.trigger(&id).await.unwrap();
        assert_eq!(outcome, TriggerOutcome::Processed { job_id: id.clone() });

        let view = orch.query(&id).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        let result = view.result.unwrap();
        assert_eq!(result.dockerfile.as_deref(), Some("FROM x"));
        assert!(view.error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_trigger_after_completion_is_a_noop() {
        let (orch, calls) = quick(REPLY);
        let id = queued_id(orch.dispatch(custom_context()).await);
        orch.trigger(&id).await.unwrap();
        let before = orch.query(&id).await.unwrap();

        let outcome = orch.trigger(&id).await.unwrap();
        assert_eq!(
            outcome,
            TriggerOutcome::Unchanged {
                job_id: id.clone(),
                status: JobStatus::Completed
            }
        );
        assert_eq!(orch.query(&id).await.unwrap(), before);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_generation_is_recorded_and_returned() {
        let (orch, calls) = quick("definitely not json");
        let id = queued_id(orch.dispatch(custom_context()).await);

        let err = orch.trigger(&id).await.unwrap_err();
        assert!(matches!(err, SpectraError::Generation(_)));

        let view = orch.query(&id).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.error.unwrap().starts_with("JSON parse error"));
        assert!(view.result.is_none());

        let outcome = orch.trigger(&id).await.unwrap();
        assert!(matches!(
            outcome,
            TriggerOutcome::Unchanged {
                status: JobStatus::Failed,
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_credential_fails_the_job() {
        let (orch, _) = orchestrator(None, Duration::ZERO, Duration::from_secs(5));
        let id = queued_id(orch.dispatch(custom_context()).await);

        let err = orch.trigger(&id).await.unwrap_err();
        assert!(matches!(err, SpectraError::Config(_)));
        assert_eq!(
            orch.query(&id).await.unwrap().error.as_deref(),
            Some("API key not configured")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_generation_times_out() {
        let (orch, _) = orchestrator(
            Some(REPLY),
            Duration::from_secs(300),
            Duration::from_secs(120),
        );
        let id = queued_id(orch.dispatch(custom_context()).await);

        let started = tokio::time::Instant::now();
        let err = orch.trigger(&id).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(121));

        let view = orch.query(&id).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error.as_deref(), Some("Timeout after 120s"));
        assert!(view.result.is_none());
    }

    #[tokio::test]
    async fn concurrent_triggers_generate_once() {
        let (orch, calls) = orchestrator(
            Some(REPLY),
            Duration::from_millis(50),
            Duration::from_secs(5),
        );
        let id = queued_id(orch.dispatch(custom_context()).await);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let orch = Arc::clone(&orch);
                let id = id.clone();
                tokio::spawn(async move { orch.trigger(&id).await })
            })
            .collect();

        let mut processed = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                TriggerOutcome::Processed { .. } => processed += 1,
                TriggerOutcome::Unchanged { status, .. } => assert_ne!(status, JobStatus::Pending),
            }
        }
        assert_eq!(processed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let view = orch.query(&id).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert!(view.result.is_some());
        assert!(view.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trigger_still_finishes_the_job() {
        let (orch, calls) = orchestrator(
            Some(REPLY),
            Duration::from_secs(2),
            Duration::from_secs(120),
        );
        let id = queued_id(orch.dispatch(custom_context()).await);

        let gave_up = tokio::time::timeout(Duration::from_secs(1), orch.trigger(&id)).await;
        assert!(gave_up.is_err());

        tokio::time::sleep(Duration::from_secs(600)).await;
        let view = orch.query(&id).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.result.unwrap().dockerfile.as_deref(), Some("FROM x"));

        let outcome = orch.trigger(&id).await.unwrap();
        assert!(matches!(
            outcome,
            TriggerOutcome::Unchanged {
                status: JobStatus::Completed,
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn result_for_an_expired_job_is_not_reported_as_processed() {
        let sender = StubSender {
            reply: Some(REPLY.to_string()),
            delay: Duration::from_secs(30),
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let store = JobStore::new(StoreConfig {
            ttl: Duration::from_secs(10),
            ..StoreConfig::in_memory()
        });
        let orch = JobOrchestrator::new(
            Arc::new(store),
            BoundedGeneration::new(Arc::new(sender), GenerationSettings::default()),
        );
        let id = queued_id(orch.dispatch(custom_context()).await);

        let err = orch.trigger(&id).await.unwrap_err();
        assert!(matches!(err, SpectraError::JobNotFound(_)));
        assert!(orch.store().get(&id).await.is_none());
    }

    #[tokio::test]
    async fn query_unknown_id_is_not_found() {
        let (orch, _) = quick(REPLY);
        assert!(matches!(
            orch.query("nope").await,
            Err(SpectraError::JobNotFound(_))
        ));
    }
}
