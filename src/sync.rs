use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Singleton checkpoint row, written only by the sync workers.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq, Default)]
pub struct SyncState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_poll: Option<DateTime<Utc>>,
    /// `max(updated_at)` across every thread ever enqueued by a forward sync;
    /// the `since` bound of the next poll.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_notification_at: Option<DateTime<Utc>>,
    /// Lower bound of synced history, pushed back by backfill syncs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_notification_synced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_sync_completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_notification_etag: Option<String>,
}

/// Snapshot computed once per forward sync run and used as the single source
/// of truth for the rest of that run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncContext {
    pub is_sync_configured: bool,
    pub is_initial_sync: bool,
    pub oldest_notification_synced_at: Option<DateTime<Utc>>,
    pub latest_notification_at: Option<DateTime<Utc>>,
    pub initial_sync_settings: InitialSyncSettings,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq, Default)]
pub struct InitialSyncSettings {
    /// `None` means all accessible history.
    #[serde(default)]
    pub days: Option<i64>,
    #[serde(default)]
    pub max_count: Option<i64>,
    #[serde(default)]
    pub unread_only: bool,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SyncOlderParameters {
    #[validate(range(min = 1, max = 3650))]
    pub days: i64,
    #[validate(range(min = 1, max = 100_000))]
    #[serde(default)]
    pub max_count: Option<i64>,
    #[serde(default)]
    pub unread_only: bool,
}
