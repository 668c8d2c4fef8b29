//! Job persistence.
//!
//! [`JobStore`] is the only writer of job state. It picks a backend lazily on
//! first use: Redis when an endpoint is configured and answers a `PING`,
//! otherwise the in-process [`MemoryBackend`]. The first Redis failure
//! abandons the network backend for the rest of the process and the failed
//! call is replayed against memory.

mod memory;
mod network;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::config::SpectraConfig;
use crate::error::StoreError;
use crate::job::{DevOpsFiles, Job, JobFields, JobStatus, ProjectContext};

pub use memory::MemoryBackend;
pub use network::RedisBackend;

/// Result of a conditional field write at the backend level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Missing,
    /// The job exists but was not in the expected status.
    Conflict(JobStatus),
}

/// What `update_status` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    NotFound,
    /// The lifecycle does not allow moving from `current` to the requested status.
    Rejected { current: Option<JobStatus> },
}

/// Storage settings, derived from [`SpectraConfig`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub redis_url: Option<String>,
    pub ttl: Duration,
    pub connect_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            ttl: Duration::from_secs(3600),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    pub fn from_config(config: &SpectraConfig) -> Self {
        Self {
            redis_url: config.redis_connection_url(),
            ttl: Duration::from_secs(config.job_ttl_secs),
            connect_timeout: Duration::from_secs(config.redis_connect_timeout_secs),
        }
    }

    /// Memory-only store, used by tests and when no endpoint is wanted.
    pub fn in_memory() -> Self {
        Self::default()
    }
}

/// The backend serving a call.
enum Backend<'a> {
    Network(&'a RedisBackend),
    Memory(&'a MemoryBackend),
}

pub struct JobStore {
    config: StoreConfig,
    network: OnceCell<Option<RedisBackend>>,
    network_abandoned: AtomicBool,
    memory: MemoryBackend,
}

impl JobStore {
    pub fn new(config: StoreConfig) -> Self {
        let memory = MemoryBackend::new(config.ttl);
        Self {
            config,
            network: OnceCell::new(),
            network_abandoned: AtomicBool::new(false),
            memory,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StoreConfig::in_memory())
    }

    /// Stores a new pending job for `context` and returns its id.
    pub async fn create(&self, context: ProjectContext) -> String {
        let job = Job::new(context);
        match self.backend().await {
            Backend::Network(redis) => {
                if let Err(err) = redis.create(&job).await {
                    self.abandon_network("create", &err);
                    self.memory.create(&job);
                }
            }
            Backend::Memory(memory) => memory.create(&job),
        }
        info!(job_id = %job.id, stack = %job.context.stack, "created job");
        job.id
    }

    /// Full current record, or `None` for unknown and expired ids.
    pub async fn get(&self, id: &str) -> Option<Job> {
        match self.backend().await {
            Backend::Network(redis) => match redis.get_fields(id).await {
                Ok(job) => job,
                Err(err) => {
                    self.abandon_network("get", &err);
                    self.memory.get_fields(id)
                }
            },
            Backend::Memory(memory) => memory.get_fields(id),
        }
    }

    /// Moves a job to `status`, storing `result` (only with `Completed`) and
    /// `error` (only with `Failed`), and refreshes the TTL.
    ///
    /// The write is a compare-and-set against the single status allowed to
    /// precede `status`; unknown ids and disallowed transitions are logged and
    /// leave the store untouched.
    pub async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        result: Option<DevOpsFiles>,
        error: Option<String>,
    ) -> UpdateOutcome {
        let Some(expected) = status.predecessor() else {
            warn!(job_id = %id, %status, "rejected transition: jobs never return to pending");
            return UpdateOutcome::Rejected { current: None };
        };

        let mut patch = JobFields::status(status);
        match status {
            JobStatus::Completed => patch.result = result,
            JobStatus::Failed => patch.error = error,
            _ => {}
        }

        let outcome = match self.backend().await {
            Backend::Network(redis) => match redis.set_fields(id, expected, &patch).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.abandon_network("update_status", &err);
                    self.memory.set_fields(id, expected, &patch)
                }
            },
            Backend::Memory(memory) => memory.set_fields(id, expected, &patch),
        };

        match outcome {
            WriteOutcome::Written => {
                info!(job_id = %id, %status, "updated job");
                UpdateOutcome::Applied
            }
            WriteOutcome::Missing => {
                error!(job_id = %id, %status, "job not found");
                UpdateOutcome::NotFound
            }
            WriteOutcome::Conflict(current) => {
                warn!(job_id = %id, %current, requested = %status, "rejected transition");
                UpdateOutcome::Rejected {
                    current: Some(current),
                }
            }
        }
    }

    /// Whether calls are currently served by Redis. Initializes the backend.
    pub async fn is_networked(&self) -> bool {
        matches!(self.backend().await, Backend::Network(_))
    }

    #[cfg(test)]
    pub(crate) fn memory(&self) -> &MemoryBackend {
        &self.memory
    }

    async fn backend(&self) -> Backend<'_> {
        if !self.network_abandoned.load(Ordering::Acquire) {
            let network = self
                .network
                .get_or_init(|| async { self.connect().await })
                .await;
            if let Some(redis) = network {
                return Backend::Network(redis);
            }
        }
        Backend::Memory(&self.memory)
    }

    async fn connect(&self) -> Option<RedisBackend> {
        let Some(url) = self.config.redis_url.as_deref() else {
            warn!("no Redis endpoint configured, using in-memory job storage (not suitable for production)");
            return None;
        };
        match RedisBackend::connect(url, self.config.ttl, self.config.connect_timeout).await {
            Ok(redis) => {
                info!("using Redis for job storage");
                Some(redis)
            }
            Err(err) => {
                error!(%err, "Redis connection test failed, using in-memory job storage");
                None
            }
        }
    }

    fn abandon_network(&self, op: &str, err: &StoreError) {
        if !self.network_abandoned.swap(true, Ordering::AcqRel) {
            error!(%err, op, "Redis operation failed, switching to in-memory job storage");
        } else {
            warn!(%err, op, "Redis operation failed, falling back to memory");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn custom_context() -> ProjectContext {
        ProjectContext::new("custom").with_file("a.py", "print(1)")
    }

    fn files(dockerfile: &str) -> DevOpsFiles {
        DevOpsFiles {
            dockerfile: Some(dockerfile.into()),
            compose: Some(String::new()),
            github_action: Some(String::new()),
        }
    }

    #[tokio::test]
    async fn create_then_get_is_pending() {
        let store = JobStore::in_memory();
        let id = store.create(custom_context()).await;

        let job = store.get(&id).await.unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.context, custom_context());
        assert!(job.result.is_none());
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn get_unknown_id_is_none() {
        let store = JobStore::in_memory();
        assert!(store.get("does-not-exist").await.is_none());
    }

    #[tokio::test]
    async fn completed_round_trip() {
        let store = JobStore::in_memory();
        let id = store.create(custom_context()).await;
        let result = files("FROM x");

        assert_eq!(
            store
                .update_status(&id, JobStatus::Processing, None, None)
                .await,
            UpdateOutcome::Applied
        );
        assert_eq!(
            store
                .update_status(&id, JobStatus::Completed, Some(result.clone()), None)
                .await,
            UpdateOutcome::Applied
        );

        let job = store.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(result));
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn update_unknown_id_is_silent_noop() {
        let store = JobStore::in_memory();
        let outcome = store
            .update_status("ghost", JobStatus::Processing, None, None)
            .await;
        assert_eq!(outcome, UpdateOutcome::NotFound);
        assert!(store.get("ghost").await.is_none());
        assert!(store.memory.is_empty());
    }

    #[tokio::test]
    async fn disallowed_transitions_are_rejected() {
        let store = JobStore::in_memory();
        let id = store.create(custom_context()).await;

        let outcome = store
            .update_status(&id, JobStatus::Completed, Some(files("FROM x")), None)
            .await;
        assert_eq!(
            outcome,
            UpdateOutcome::Rejected {
                current: Some(JobStatus::Pending)
            }
        );

        let outcome = store.update_status(&id, JobStatus::Pending, None, None).await;
        assert_eq!(outcome, UpdateOutcome::Rejected { current: None });

        let job = store.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn terminal_state_is_never_overwritten() {
        let store = JobStore::in_memory();
        let id = store.create(custom_context()).await;
        store
            .update_status(&id, JobStatus::Processing, None, None)
            .await;
        store
            .update_status(&id, JobStatus::Failed, None, Some("boom".into()))
            .await;

        let outcome = store
            .update_status(&id, JobStatus::Completed, Some(files("FROM x")), None)
            .await;
        assert_eq!(
            outcome,
            UpdateOutcome::Rejected {
                current: Some(JobStatus::Failed)
            }
        );

        let job = store.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn mismatched_payloads_are_dropped() {
        let store = JobStore::in_memory();
        let id = store.create(custom_context()).await;
        store
            .update_status(&id, JobStatus::Processing, Some(files("FROM x")), Some("x".into()))
            .await;

        let job = store.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.result.is_none());
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(JobStore::in_memory());
        let id = store.create(custom_context()).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_status(&id, JobStatus::Processing, None, None)
                    .await
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap() == UpdateOutcome::Applied {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn unreachable_redis_falls_back_to_memory() {
        let store = JobStore::new(StoreConfig {
            redis_url: Some("redis://127.0.0.1:1".into()),
            connect_timeout: Duration::from_secs(2),
            ..StoreConfig::default()
        });

        let id = store.create(custom_context()).await;
        assert!(!store.is_networked().await);
        assert_eq!(store.get(&id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn malformed_redis_url_falls_back_to_memory() {
        let store = JobStore::new(StoreConfig {
            redis_url: Some("not a url".into()),
            ..StoreConfig::default()
        });
        let id = store.create(custom_context()).await;
        assert!(store.get(&id).await.is_some());
    }

    #[tokio::test]
    async fn backend_is_selected_once() {
        let store = Arc::new(JobStore::new(StoreConfig {
            redis_url: Some("redis://127.0.0.1:1".into()),
            connect_timeout: Duration::from_secs(2),
            ..StoreConfig::default()
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.create(custom_context()).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(store.network.initialized());
        assert_eq!(store.memory.len(), 8);
    }

    fn resp_line(buf: &[u8], from: usize) -> Option<(&str, usize)> {
        let end = from + buf.get(from..)?.windows(2).position(|w| w == b"\r\n")?;
        Some((std::str::from_utf8(&buf[from..end]).ok()?, end + 2))
    }

    /// Name and encoded length of the first complete RESP command in `buf`.
    fn next_command(buf: &[u8]) -> Option<(String, usize)> {
        let (header, mut pos) = resp_line(buf, 0)?;
        let argc: usize = header.strip_prefix('*')?.parse().ok()?;
        let mut name = None;
        for _ in 0..argc {
            let (len_line, start) = resp_line(buf, pos)?;
            let len: usize = len_line.strip_prefix('$')?.parse().ok()?;
            let end = start + len;
            if buf.len() < end + 2 {
                return None;
            }
            name.get_or_insert_with(|| String::from_utf8_lossy(&buf[start..end]).into_owned());
            pos = end + 2;
        }
        Some((name?, pos))
    }

    /// A Redis stand-in that answers the connection handshake and `PING`,
    /// then hangs up. Returns its URL and the number of accepted connections.
    async fn redis_that_hangs_up_after_ping() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("redis://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                'session: loop {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    while let Some((name, used)) = next_command(&buf) {
                        buf.drain(..used);
                        if name.eq_ignore_ascii_case("PING") {
                            let _ = socket.write_all(b"+PONG\r\n").await;
                            break 'session;
                        }
                        let _ = socket.write_all(b"+OK\r\n").await;
                    }
                }
            }
        });
        (url, accepted)
    }

    #[tokio::test]
    async fn redis_failure_after_connect_switches_to_memory_for_good() {
        let (url, accepted) = redis_that_hangs_up_after_ping().await;
        let store = JobStore::new(StoreConfig {
            redis_url: Some(url),
            connect_timeout: Duration::from_secs(2),
            ..StoreConfig::default()
        });

        assert!(store.is_networked().await);
        assert!(!store.network_abandoned.load(Ordering::Acquire));

        let id = store.create(custom_context()).await;
        assert!(store.network_abandoned.load(Ordering::Acquire));
        assert!(!store.is_networked().await);
        assert!(store.memory.get_fields(&id).is_some());

        assert_eq!(
            store
                .update_status(&id, JobStatus::Processing, None, None)
                .await,
            UpdateOutcome::Applied
        );
        assert_eq!(store.get(&id).await.unwrap().status, JobStatus::Processing);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }
}
