//! Durable job queue persisted in the same Postgres database as the rest of
//! the store. Named queues with independent worker pools, unique-by-state
//! insertion, periodic scheduling, retry with backoff, and graceful
//! shutdown. The API server process only inserts ([`client::JobClient`]);
//! one worker process owns the [`server::QueueServer`].

pub mod client;
pub mod server;

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, Row};

use octotriage::JobId;

pub use client::JobClient;
pub use server::{PeriodicJob, QueueConfig, QueueServer};

macro_attr! {
    #[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy, Eq, EnumFromStr!, EnumDisplay!)]
    pub enum JobState {
        Available,
        Pending,
        Running,
        Retryable,
        Scheduled,
        Completed,
        Discarded,
        Cancelled,
    }
}

/// Every state a job can be in while it still might run. The periodic
/// forward-sync descriptor dedupes across all of these so at most one
/// instance is in flight or queued regardless of timer skew.
pub const NON_TERMINAL_STATES: [JobState; 5] = [
    JobState::Available,
    JobState::Pending,
    JobState::Running,
    JobState::Retryable,
    JobState::Scheduled,
];

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobErrorEntry {
    pub attempt: i32,
    pub at: DateTime<Utc>,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: JobId,
    pub kind: String,
    pub queue: String,
    pub args: serde_json::Value,
    pub state: JobState,
    pub attempt: i32,
    pub max_attempts: i32,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub errors: Vec<JobErrorEntry>,
    pub unique_key: Option<String>,
}

pub(crate) const JOB_COLUMNS: &str = "id, kind, queue, args, state, attempt, max_attempts, scheduled_at, attempted_at, finalized_at, errors, unique_key";

impl FromRow<'_, PgRow> for JobRow {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        let state: String = row.try_get("state")?;
        let state = state
            .parse()
            .map_err(|err| sqlx::Error::ColumnDecode {
                index: "state".to_string(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{err:?}"),
                )),
            })?;
        let errors: serde_json::Value = row.try_get("errors")?;
        let errors = serde_json::from_value(errors).unwrap_or_default();
        Ok(JobRow {
            id: JobId(row.try_get("id")?),
            kind: row.try_get("kind")?,
            queue: row.try_get("queue")?,
            args: row.try_get("args")?,
            state,
            attempt: row.try_get("attempt")?,
            max_attempts: row.try_get("max_attempts")?,
            scheduled_at: row.try_get("scheduled_at")?,
            attempted_at: row.try_get("attempted_at")?,
            finalized_at: row.try_get("finalized_at")?,
            errors,
            unique_key: row.try_get("unique_key")?,
        })
    }
}

/// A fully-resolved insertion request: kind, target queue, serialized args,
/// and the optional unique-by-state constraint.
#[derive(Debug, Clone)]
pub struct JobInsert {
    pub kind: String,
    pub queue: String,
    pub args: serde_json::Value,
    pub max_attempts: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Insertion is a no-op if a job with the same `(kind, args)` hash is in
    /// any of these states.
    pub unique_states: Option<Vec<JobState>>,
}

pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Deduplication key: hash of kind and canonical args JSON.
pub fn unique_key(kind: &str, args: &serde_json::Value) -> String {
    let mut input = Vec::with_capacity(64);
    input.extend_from_slice(kind.as_bytes());
    input.push(0);
    input.extend_from_slice(args.to_string().as_bytes());
    let digest = ring::digest::digest(&ring::digest::SHA256, &input);
    hex::encode(digest.as_ref())
}

const RETRY_BASE_SECS: u64 = 15;
const RETRY_CAP_SECS: u64 = 3600;

/// Exponential backoff with full jitter, capped at an hour.
pub fn retry_backoff(attempt: i32) -> Duration {
    let attempt = attempt.clamp(0, 16) as u32;
    let ceiling = RETRY_CAP_SECS.min(RETRY_BASE_SECS.saturating_mul(1u64 << attempt));
    let jittered = rand::thread_rng().gen_range(1..=ceiling.max(1));
    Duration::from_secs(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use serde_json::json;

    #[test]
    fn test_job_state_round_trip() {
        for state in NON_TERMINAL_STATES {
            let parsed: JobState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("Nonsense".parse::<JobState>().is_err());
    }

    #[test]
    fn test_unique_key_is_stable_and_discriminating() {
        let args = json!({"rule_id": 7});
        assert_eq!(unique_key("ApplyRule", &args), unique_key("ApplyRule", &args));
        assert_ne!(
            unique_key("ApplyRule", &args),
            unique_key("ApplyRule", &json!({"rule_id": 8}))
        );
        assert_ne!(unique_key("SyncNew", &args), unique_key("ApplyRule", &args));
    }

    #[rstest]
    #[case(1, 30)]
    #[case(2, 60)]
    #[case(5, 480)]
    #[case(12, 3600)]
    fn test_retry_backoff_bounds(#[case] attempt: i32, #[case] ceiling_secs: u64) {
        for _ in 0..50 {
            let backoff = retry_backoff(attempt);
            assert!(backoff >= Duration::from_secs(1));
            assert!(
                backoff <= Duration::from_secs(ceiling_secs),
                "attempt {attempt} produced {backoff:?}"
            );
        }
    }

    #[test]
    fn test_retry_backoff_never_overflows() {
        assert!(retry_backoff(10_000) <= Duration::from_secs(RETRY_CAP_SECS));
    }
}
