use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, Postgres, QueryBuilder, Row, Transaction};

use octotriage::sync::SyncState;

use crate::{octotriage::OctotriageError, repository::Repository};

/// Fields of the singleton checkpoint row that a sync run wants to update;
/// `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct SyncStatePatch {
    pub last_successful_poll: Option<DateTime<Utc>>,
    pub latest_notification_at: Option<DateTime<Utc>>,
    pub oldest_notification_synced_at: Option<DateTime<Utc>>,
    pub initial_sync_completed_at: Option<DateTime<Utc>>,
    pub last_notification_etag: Option<String>,
}

#[async_trait]
pub trait SyncStateRepository {
    /// `None` when no sync has ever run.
    async fn get_sync_state(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<Option<SyncState>, OctotriageError>;
    async fn upsert_sync_state(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        patch: &SyncStatePatch,
    ) -> Result<SyncState, OctotriageError>;
}

#[async_trait]
impl SyncStateRepository for Repository {
    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn get_sync_state(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<Option<SyncState>, OctotriageError> {
        let row = QueryBuilder::new(
            "SELECT last_successful_poll, latest_notification_at, oldest_notification_synced_at, initial_sync_completed_at, last_notification_etag FROM sync_state WHERE singleton",
        )
        .build_query_as::<SyncStateRow>()
        .fetch_optional(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to fetch sync state from storage: {err}");
            OctotriageError::DatabaseError { source: err, message }
        })?;

        Ok(row.map(SyncState::from))
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn upsert_sync_state(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        patch: &SyncStatePatch,
    ) -> Result<SyncState, OctotriageError> {
        // `singleton BOOLEAN PRIMARY KEY CHECK (singleton)` keeps this a
        // one-row table; COALESCE keeps unpatched fields at their stored
        // value.
        let mut builder = QueryBuilder::new(
            r#"
                INSERT INTO sync_state
                  (singleton, last_successful_poll, latest_notification_at, oldest_notification_synced_at, initial_sync_completed_at, last_notification_etag)
                VALUES (TRUE,
            "#,
        );
        let mut separated = builder.separated(", ");
        separated.push_bind(patch.last_successful_poll);
        separated.push_bind(patch.latest_notification_at);
        separated.push_bind(patch.oldest_notification_synced_at);
        separated.push_bind(patch.initial_sync_completed_at);
        separated.push_bind(patch.last_notification_etag.clone());
        builder.push(
            r#")
                ON CONFLICT (singleton) DO UPDATE SET
                  last_successful_poll = COALESCE(excluded.last_successful_poll, sync_state.last_successful_poll),
                  latest_notification_at = COALESCE(excluded.latest_notification_at, sync_state.latest_notification_at),
                  oldest_notification_synced_at = COALESCE(excluded.oldest_notification_synced_at, sync_state.oldest_notification_synced_at),
                  initial_sync_completed_at = COALESCE(excluded.initial_sync_completed_at, sync_state.initial_sync_completed_at),
                  last_notification_etag = COALESCE(excluded.last_notification_etag, sync_state.last_notification_etag)
                RETURNING last_successful_poll, latest_notification_at, oldest_notification_synced_at, initial_sync_completed_at, last_notification_etag
            "#,
        );

        let row = builder
            .build_query_as::<SyncStateRow>()
            .fetch_one(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to upsert sync state into storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        Ok(row.into())
    }
}

#[derive(Debug)]
struct SyncStateRow {
    last_successful_poll: Option<DateTime<Utc>>,
    latest_notification_at: Option<DateTime<Utc>>,
    oldest_notification_synced_at: Option<DateTime<Utc>>,
    initial_sync_completed_at: Option<DateTime<Utc>>,
    last_notification_etag: Option<String>,
}

impl FromRow<'_, PgRow> for SyncStateRow {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(SyncStateRow {
            last_successful_poll: row.try_get("last_successful_poll")?,
            latest_notification_at: row.try_get("latest_notification_at")?,
            oldest_notification_synced_at: row.try_get("oldest_notification_synced_at")?,
            initial_sync_completed_at: row.try_get("initial_sync_completed_at")?,
            last_notification_etag: row.try_get("last_notification_etag")?,
        })
    }
}

impl From<SyncStateRow> for SyncState {
    fn from(row: SyncStateRow) -> Self {
        SyncState {
            last_successful_poll: row.last_successful_poll,
            latest_notification_at: row.latest_notification_at,
            oldest_notification_synced_at: row.oldest_notification_synced_at,
            initial_sync_completed_at: row.initial_sync_completed_at,
            last_notification_etag: row.last_notification_etag,
        }
    }
}
