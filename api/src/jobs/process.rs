use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use octotriage::integrations::github::GithubNotificationThread;

use crate::octotriage::{
    rule::service::RuleService, sync::service::SyncService, OctotriageError,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessNotificationJob {
    pub thread: GithubNotificationThread,
}

/// Upsert the thread and, only when a brand-new row was inserted, run
/// forward rule matching. Re-delivered threads (overlapping syncs, queue
/// retries) are idempotent and fire no rules.
pub async fn handle_process_notification(
    event: ProcessNotificationJob,
    sync_service: &SyncService,
    rule_service: &RuleService,
) -> Result<(), OctotriageError> {
    let mut transaction = sync_service.begin().await?;
    let upserted = sync_service
        .process_notification(&mut transaction, &event.thread)
        .await?;

    let was_new_insert = upserted.is_created();
    let github_id = upserted.value_ref().github_id.clone();
    if was_new_insert {
        let matched = rule_service
            .match_and_apply_rules(&mut transaction, &github_id)
            .await?;
        debug!(
            "Notification {github_id} is new, rule matching reported matched={matched}"
        );
    }

    transaction
        .commit()
        .await
        .context("Failed to commit notification processing")?;
    Ok(())
}
