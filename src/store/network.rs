//! Redis-backed job records.
//!
//! Each job is a hash under `job:<id>` with the fields `status`, `context`,
//! `result`, `error`, `created_at` and `updated_at`. `context`, `result` and
//! `error` hold JSON text (`null` when unset). Every write carries the TTL
//! refresh in the same atomic unit.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::job::{Job, JobFields, JobStatus, ProjectContext};

use super::WriteOutcome;

const KEY_PREFIX: &str = "job:";

/// Conditional field write. Returns `missing`, the current status on a
/// mismatch, or `ok` once the fields and the TTL have been written.
///
/// KEYS[1] = job key
/// ARGV[1] = expected status, ARGV[2] = ttl seconds, ARGV[3..] = field/value pairs
const SET_FIELDS_LUA: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then
  return 'missing'
end
if current ~= ARGV[1] then
  return current
end
for i = 3, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('EXPIRE', KEYS[1], ARGV[2])
return 'ok'
"#;

pub struct RedisBackend {
    conn: MultiplexedConnection,
    set_fields_script: Script,
    ttl: Duration,
}

impl RedisBackend {
    /// Opens a multiplexed connection and verifies it with a `PING`.
    pub async fn connect(
        url: &str,
        ttl: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let mut conn = tokio::time::timeout(
            connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StoreError::ConnectTimeout(connect_timeout))??;

        let pong: String = tokio::time::timeout(
            connect_timeout,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await
        .map_err(|_| StoreError::ConnectTimeout(connect_timeout))??;
        debug!(%pong, "redis ping");

        Ok(Self {
            conn,
            set_fields_script: Script::new(SET_FIELDS_LUA),
            ttl,
        })
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    pub async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let key = job_key(&job.id);
        let fields = [
            ("status", job.status.as_str().to_string()),
            ("context", to_json(&key, &job.context)?),
            ("result", to_json(&key, &job.result)?),
            ("error", to_json(&key, &job.error)?),
            ("created_at", job.created_at.to_rfc3339()),
            ("updated_at", job.updated_at.to_rfc3339()),
        ];

        let mut conn = self.conn.clone();
        let () = redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields[..])
            .ignore()
            .expire(&key, self.ttl_secs())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn get_fields(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let key = job_key(id);
        let mut conn = self.conn.clone();
        let data: HashMap<String, String> =
            redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await?;
        if data.is_empty() {
            return Ok(None);
        }
        decode(id, &key, &data).map(Some)
    }

    #[instrument(skip(self, patch), fields(status = %patch.status), err)]
    pub async fn set_fields(
        &self,
        id: &str,
        expected: JobStatus,
        patch: &JobFields,
    ) -> Result<WriteOutcome, StoreError> {
        let key = job_key(id);
        let mut invocation = self.set_fields_script.prepare_invoke();
        invocation
            .key(&key)
            .arg(expected.as_str())
            .arg(self.ttl_secs())
            .arg("status")
            .arg(patch.status.as_str())
            .arg("updated_at")
            .arg(patch.updated_at.to_rfc3339());
        if let Some(result) = &patch.result {
            invocation.arg("result").arg(to_json(&key, result)?);
        }
        if let Some(error) = &patch.error {
            invocation.arg("error").arg(to_json(&key, error)?);
        }

        let mut conn = self.conn.clone();
        let reply: String = invocation.invoke_async(&mut conn).await?;
        match reply.as_str() {
            "ok" => Ok(WriteOutcome::Written),
            "missing" => Ok(WriteOutcome::Missing),
            current => current
                .parse()
                .map(WriteOutcome::Conflict)
                .map_err(|e| corrupt(&key, e)),
        }
    }

    fn ttl_secs(&self) -> i64 {
        i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX)
    }
}

fn job_key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

fn to_json<T: serde::Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| corrupt(key, e))
}

fn corrupt(key: &str, reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

// Missing or empty optional fields read back as `None`.
fn decode(id: &str, key: &str, data: &HashMap<String, String>) -> Result<Job, StoreError> {
    let status = field(data, "status")
        .unwrap_or("pending")
        .parse::<JobStatus>()
        .map_err(|e| corrupt(key, e))?;
    let context = match field(data, "context") {
        Some(raw) => serde_json::from_str(raw).map_err(|e| corrupt(key, e))?,
        None => ProjectContext::default(),
    };
    let result = match field(data, "result") {
        Some(raw) => serde_json::from_str(raw).map_err(|e| corrupt(key, e))?,
        None => None,
    };
    let error = match field(data, "error") {
        Some(raw) => serde_json::from_str(raw).map_err(|e| corrupt(key, e))?,
        None => None,
    };
    let created_at = timestamp(key, field(data, "created_at"))?;
    let updated_at = match field(data, "updated_at") {
        Some(_) => timestamp(key, field(data, "updated_at"))?,
        None => created_at,
    };

    Ok(Job {
        id: id.to_string(),
        status,
        context,
        result,
        error,
        created_at,
        updated_at,
    })
}

fn field<'a>(data: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    data.get(name).map(String::as_str).filter(|v| !v.is_empty())
}

fn timestamp(key: &str, raw: Option<&str>) -> Result<DateTime<Utc>, StoreError> {
    match raw {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| corrupt(key, e)),
        None => Ok(Utc::now()),
    }
}
