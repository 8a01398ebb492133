use std::sync::Arc;

use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::{
    octotriage::OctotriageError,
    queue::{unique_key, JobInsert, DEFAULT_MAX_ATTEMPTS},
};

/// Enqueue-only handle to the job table, shared by the API server and the
/// workers themselves (fan-out).
#[derive(Debug, Clone)]
pub struct JobClient {
    pool: Arc<PgPool>,
}

impl JobClient {
    pub fn new(pool: Arc<PgPool>) -> Self {
        JobClient { pool }
    }

    /// Insert a job. Returns `false` when a unique-by-state constraint made
    /// the insertion a no-op.
    #[tracing::instrument(level = "debug", skip_all, fields(kind = insert.kind, queue = insert.queue), err)]
    pub async fn insert(&self, insert: &JobInsert) -> Result<bool, OctotriageError> {
        let key = insert
            .unique_states
            .as_ref()
            .map(|_| unique_key(&insert.kind, &insert.args));

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO job (kind, queue, args, state, attempt, max_attempts, scheduled_at, errors, unique_key) SELECT ",
        );
        let mut separated = builder.separated(", ");
        separated.push_bind(insert.kind.clone());
        separated.push_bind(insert.queue.clone());
        separated.push_bind(insert.args.clone());
        separated.push("'Available'");
        separated.push("0");
        separated.push_bind(if insert.max_attempts > 0 {
            insert.max_attempts
        } else {
            DEFAULT_MAX_ATTEMPTS
        });
        if let Some(scheduled_at) = insert.scheduled_at {
            separated.push_bind(scheduled_at);
        } else {
            separated.push("now()");
        }
        separated.push("'[]'::jsonb");
        separated.push_bind(key.clone());

        if let Some(states) = &insert.unique_states {
            let states: Vec<String> = states.iter().map(|s| s.to_string()).collect();
            builder.push(" WHERE NOT EXISTS (SELECT 1 FROM job WHERE unique_key = ");
            builder.push_bind(key);
            builder.push(" AND state = ANY(");
            builder.push_bind(states);
            builder.push("))");
        }

        let result = builder
            .build()
            .execute(self.pool.as_ref())
            .await
            .map_err(|err| {
                // The queue being unreachable is a transient condition for
                // callers (503, or retry within a worker).
                OctotriageError::Recoverable(anyhow::anyhow!(
                    "Failed to enqueue {} job: {err}",
                    insert.kind
                ))
            })?;

        let inserted = result.rows_affected() > 0;
        if !inserted {
            debug!(
                "Skipped enqueueing {} job: an equivalent job is already queued or running",
                insert.kind
            );
        }
        Ok(inserted)
    }
}
