use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tokio::{sync::watch, task::JoinSet, time};
use tracing::{debug, error, info, warn};

use crate::{
    octotriage::OctotriageError,
    queue::{retry_backoff, JobClient, JobErrorEntry, JobInsert, JobRow, JOB_COLUMNS},
};

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &JobRow) -> Result<(), OctotriageError>;
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub max_workers: usize,
}

/// A job the server re-enqueues on a wall-clock interval. Enqueueing goes
/// through the regular unique-by-state path, so a descriptor whose previous
/// run is still in flight is a no-op.
pub struct PeriodicJob {
    pub interval: Duration,
    pub make_insert: Arc<dyn Fn() -> JobInsert + Send + Sync>,
    pub run_on_start: bool,
}

pub struct QueueServer<H> {
    pool: Arc<PgPool>,
    handler: Arc<H>,
    queues: Vec<QueueConfig>,
    periodic: Vec<PeriodicJob>,
    lease_timeout: Duration,
    poll_interval: Duration,
    janitor_interval: Duration,
    stop_grace: Duration,
}

impl<H: JobHandler> QueueServer<H> {
    pub fn new(pool: Arc<PgPool>, handler: Arc<H>) -> Self {
        QueueServer {
            pool,
            handler,
            queues: vec![],
            periodic: vec![],
            lease_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
            janitor_interval: Duration::from_secs(5),
            stop_grace: Duration::from_secs(30),
        }
    }

    pub fn register_queue(mut self, name: &str, max_workers: usize) -> Self {
        self.queues.push(QueueConfig {
            name: name.to_string(),
            max_workers,
        });
        self
    }

    pub fn register_periodic(mut self, periodic: PeriodicJob) -> Self {
        self.periodic.push(periodic);
        self
    }

    /// Run every queue loop, the janitor, and the periodic schedulers until
    /// `shutdown` resolves, then drain within the stop grace period. Workers
    /// still running at the deadline are dropped; the janitor of the next
    /// run rescues their jobs once the lease expires.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), OctotriageError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: JoinSet<()> = JoinSet::new();

        for queue in &self.queues {
            info!(
                "Starting queue `{}` with {} workers",
                queue.name, queue.max_workers
            );
            tasks.spawn(queue_loop(
                self.pool.clone(),
                self.handler.clone(),
                queue.clone(),
                self.poll_interval,
                shutdown_rx.clone(),
            ));
        }

        tasks.spawn(janitor_loop(
            self.pool.clone(),
            self.lease_timeout,
            self.janitor_interval,
            shutdown_rx.clone(),
        ));

        let client = JobClient::new(self.pool.clone());
        for periodic in self.periodic {
            tasks.spawn(periodic_loop(client.clone(), periodic, shutdown_rx.clone()));
        }
        drop(shutdown_rx);

        shutdown.await;
        info!("Stopping queue server");
        let _ = shutdown_tx.send(true);

        if time::timeout(self.stop_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!(
                "Queue workers still running after {:?}, abandoning them",
                self.stop_grace
            );
            tasks.abort_all();
        }

        Ok(())
    }
}

async fn queue_loop<H: JobHandler>(
    pool: Arc<PgPool>,
    handler: Arc<H>,
    queue: QueueConfig,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut workers: JoinSet<(JobRow, Result<(), OctotriageError>)> = JoinSet::new();
    let mut ticker = time::interval(poll_interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => break,

            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                match joined {
                    Ok((job, result)) => finalize_job(&pool, &job, result).await,
                    Err(join_error) => {
                        error!("Worker task for queue `{}` panicked: {join_error}", queue.name);
                    }
                }
            }

            _ = ticker.tick() => {
                let free_slots = queue.max_workers.saturating_sub(workers.len());
                if free_slots == 0 {
                    continue;
                }
                match claim_batch(&pool, &queue.name, free_slots).await {
                    Ok(jobs) => {
                        for job in jobs {
                            debug!(
                                "Claimed {} job {} (attempt {}/{})",
                                job.kind, job.id, job.attempt, job.max_attempts
                            );
                            let handler = handler.clone();
                            workers.spawn(async move {
                                let result = handler.handle(&job).await;
                                (job, result)
                            });
                        }
                    }
                    Err(err) => {
                        error!("Failed to claim jobs for queue `{}`: {err:?}", queue.name);
                    }
                }
            }
        }
    }

    // Stop accepting new work but let in-flight workers finish; the caller
    // bounds this drain with the stop grace period.
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((job, result)) => finalize_job(&pool, &job, result).await,
            Err(join_error) => {
                error!("Worker task for queue `{}` panicked: {join_error}", queue.name);
            }
        }
    }
}

/// Atomically transition a batch of due `Available` rows to `Running`.
async fn claim_batch(
    pool: &PgPool,
    queue: &str,
    limit: usize,
) -> Result<Vec<JobRow>, OctotriageError> {
    let mut builder = QueryBuilder::<Postgres>::new(
        r#"
            UPDATE job SET state = 'Running', attempted_at = now(), attempt = attempt + 1
            WHERE id IN (
              SELECT id FROM job
              WHERE queue =
        "#,
    );
    builder.push_bind(queue);
    builder.push(" AND state = 'Available' AND scheduled_at <= now() ORDER BY scheduled_at, id LIMIT ");
    builder.push_bind(limit as i64);
    builder.push(" FOR UPDATE SKIP LOCKED)");
    builder.push(format!(" RETURNING {JOB_COLUMNS}"));

    builder
        .build_query_as::<JobRow>()
        .fetch_all(pool)
        .await
        .map_err(|err| {
            OctotriageError::Recoverable(anyhow::anyhow!(
                "Failed to claim jobs from queue `{queue}`: {err}"
            ))
        })
}

async fn finalize_job(pool: &PgPool, job: &JobRow, result: Result<(), OctotriageError>) {
    let outcome = match result {
        Ok(()) => complete_job(pool, job).await,
        Err(err) => {
            warn!(
                "{} job {} failed on attempt {}/{}: {err:?}",
                job.kind, job.id, job.attempt, job.max_attempts
            );
            fail_job(pool, job, &err).await
        }
    };
    if let Err(err) = outcome {
        // The row stays Running and will be rescued by the janitor after the
        // lease expires.
        error!("Failed to finalize {} job {}: {err:?}", job.kind, job.id);
    }
}

async fn complete_job(pool: &PgPool, job: &JobRow) -> Result<(), OctotriageError> {
    QueryBuilder::<Postgres>::new(
        "UPDATE job SET state = 'Completed', finalized_at = now() WHERE id = ",
    )
    .push_bind(job.id.0)
    .build()
    .execute(pool)
    .await
    .map_err(|err| {
        OctotriageError::Recoverable(anyhow::anyhow!("Failed to mark job completed: {err}"))
    })?;
    debug!("Completed {} job {}", job.kind, job.id);
    Ok(())
}

/// Schedule a retry with backoff, or discard once attempts are exhausted.
/// The error trail is preserved on the row either way.
async fn fail_job(pool: &PgPool, job: &JobRow, error: &OctotriageError) -> Result<(), OctotriageError> {
    let entry = JobErrorEntry {
        attempt: job.attempt,
        at: Utc::now(),
        error: format!("{error:?}"),
    };
    let entry_json = serde_json::to_value(vec![entry])
        .unwrap_or_else(|_| serde_json::Value::Array(vec![]));

    let mut builder = if job.attempt >= job.max_attempts {
        let mut builder = QueryBuilder::<Postgres>::new(
            "UPDATE job SET state = 'Discarded', finalized_at = now(), errors = errors || ",
        );
        builder.push_bind(entry_json);
        builder
    } else {
        let next_attempt_at = Utc::now()
            + chrono::Duration::from_std(retry_backoff(job.attempt))
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut builder = QueryBuilder::<Postgres>::new("UPDATE job SET state = 'Retryable', scheduled_at = ");
        builder.push_bind(next_attempt_at);
        builder.push(", errors = errors || ");
        builder.push_bind(entry_json);
        builder
    };
    builder.push(" WHERE id = ").push_bind(job.id.0);

    builder.build().execute(pool).await.map_err(|err| {
        OctotriageError::Recoverable(anyhow::anyhow!("Failed to mark job for retry: {err}"))
    })?;
    Ok(())
}

/// Promote due `Retryable`/`Scheduled` rows and return `Running` rows whose
/// lease expired (a worker died or was abandoned at shutdown) to
/// `Available`.
async fn janitor_loop(
    pool: Arc<PgPool>,
    lease_timeout: Duration,
    janitor_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(janitor_interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {}
        }

        if let Err(err) = sqlx::query(
            "UPDATE job SET state = 'Available' WHERE state IN ('Retryable', 'Scheduled') AND scheduled_at <= now()",
        )
        .execute(pool.as_ref())
        .await
        {
            error!("Janitor failed to promote scheduled jobs: {err}");
        }

        let lease_cutoff = Utc::now()
            - chrono::Duration::from_std(lease_timeout).unwrap_or_else(|_| chrono::Duration::seconds(120));
        let rescue = QueryBuilder::<Postgres>::new(
            "UPDATE job SET state = 'Available' WHERE state = 'Running' AND attempted_at < ",
        )
        .push_bind(lease_cutoff)
        .build()
        .execute(pool.as_ref())
        .await;
        match rescue {
            Ok(result) if result.rows_affected() > 0 => {
                warn!("Janitor rescued {} expired job leases", result.rows_affected());
            }
            Ok(_) => {}
            Err(err) => error!("Janitor failed to rescue expired leases: {err}"),
        }
    }
}

async fn periodic_loop(
    client: JobClient,
    periodic: PeriodicJob,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if periodic.run_on_start {
        enqueue_periodic(&client, &periodic).await;
    }
    let mut ticker = time::interval(periodic.interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; consume it so
    // run_on_start stays the only immediate trigger.
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => enqueue_periodic(&client, &periodic).await,
        }
    }
}

async fn enqueue_periodic(client: &JobClient, periodic: &PeriodicJob) {
    let insert = (periodic.make_insert)();
    if let Err(err) = client.insert(&insert).await {
        error!("Failed to enqueue periodic {} job: {err:?}", insert.kind);
    }
}
