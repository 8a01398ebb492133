use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::octotriage::{sync::service::SyncService, OctotriageError};

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncNewJob {}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncOlderJob {
    pub days: i64,
    pub until_time: DateTime<Utc>,
    pub max_count: Option<i64>,
    pub unread_only: bool,
}

pub async fn handle_sync_new(
    _event: SyncNewJob,
    sync_service: &SyncService,
) -> Result<(), OctotriageError> {
    sync_service.sync_new().await
}

pub async fn handle_sync_older(
    event: SyncOlderJob,
    sync_service: &SyncService,
) -> Result<(), OctotriageError> {
    sync_service
        .sync_older(
            event.days,
            event.until_time,
            event.max_count,
            event.unread_only,
        )
        .await
}
