use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use octotriage::{integrations::github::GithubNotificationThread, RuleId};

use crate::{
    octotriage::{rule::service::RuleService, sync::service::SyncService, OctotriageError},
    queue::{server::JobHandler, JobInsert, JobRow, JobState, NON_TERMINAL_STATES},
};

pub mod process;
pub mod rules;
pub mod sync;

pub const SYNC_QUEUE: &str = "sync_notifications";
pub const PROCESS_QUEUE: &str = "process_notification";
pub const APPLY_RULE_QUEUE: &str = "apply_rule";

pub const SYNC_QUEUE_WORKERS: usize = 1;
pub const PROCESS_QUEUE_WORKERS: usize = 10;
pub const APPLY_RULE_QUEUE_WORKERS: usize = 10;

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Serialize, Deserialize)]
pub enum TriageJob {
    SyncNew(sync::SyncNewJob),
    SyncOlder(sync::SyncOlderJob),
    ProcessNotification(process::ProcessNotificationJob),
    ApplyRule(rules::ApplyRuleJob),
}

impl TriageJob {
    pub fn sync_new() -> Self {
        TriageJob::SyncNew(sync::SyncNewJob {})
    }

    pub fn sync_older(
        days: i64,
        until_time: DateTime<Utc>,
        max_count: Option<i64>,
        unread_only: bool,
    ) -> Self {
        TriageJob::SyncOlder(sync::SyncOlderJob {
            days,
            until_time,
            max_count,
            unread_only,
        })
    }

    pub fn process_notification(thread: GithubNotificationThread) -> Self {
        TriageJob::ProcessNotification(process::ProcessNotificationJob { thread })
    }

    pub fn apply_rule(rule_id: RuleId) -> Self {
        TriageJob::ApplyRule(rules::ApplyRuleJob { rule_id })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncNew(_) => "SyncNew",
            Self::SyncOlder(_) => "SyncOlder",
            Self::ProcessNotification(_) => "ProcessNotification",
            Self::ApplyRule(_) => "ApplyRule",
        }
    }

    pub fn queue(&self) -> &'static str {
        match self {
            Self::SyncNew(_) | Self::SyncOlder(_) => SYNC_QUEUE,
            Self::ProcessNotification(_) => PROCESS_QUEUE,
            Self::ApplyRule(_) => APPLY_RULE_QUEUE,
        }
    }

    /// The periodic `SyncNew` dedupes across every non-terminal state: the
    /// timer interval is shorter than a worst-case sync run, and overlapping
    /// runs would race on the sync checkpoint.
    fn unique_states(&self) -> Option<Vec<JobState>> {
        match self {
            Self::SyncNew(_) => Some(NON_TERMINAL_STATES.to_vec()),
            _ => None,
        }
    }

    pub fn to_insert(&self) -> Result<JobInsert, OctotriageError> {
        let args = serde_json::to_value(self)
            .with_context(|| format!("Failed to serialize {} job args", self.kind()))?;
        Ok(JobInsert {
            kind: self.kind().to_string(),
            queue: self.queue().to_string(),
            args,
            max_attempts: 0,
            scheduled_at: None,
            unique_states: self.unique_states(),
        })
    }

    pub fn from_row(row: &JobRow) -> Result<Self, OctotriageError> {
        serde_json::from_value(row.args.clone()).map_err(|err| {
            OctotriageError::from_json_serde_error(err, row.args.to_string())
        })
    }
}

/// The single worker entry point: decode the job row and dispatch to the
/// matching handler.
pub struct TriageJobHandler {
    sync_service: Arc<SyncService>,
    rule_service: Arc<RuleService>,
}

impl TriageJobHandler {
    pub fn new(sync_service: Arc<SyncService>, rule_service: Arc<RuleService>) -> Self {
        TriageJobHandler {
            sync_service,
            rule_service,
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for TriageJobHandler {
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(job.id = %job.id, job.kind = %job.kind),
        err
    )]
    async fn handle(&self, job: &JobRow) -> Result<(), OctotriageError> {
        info!(job_id = job.id.to_string(), "Processing {} job", job.kind);
        let result = match TriageJob::from_row(job)? {
            TriageJob::SyncNew(event) => sync::handle_sync_new(event, &self.sync_service).await,
            TriageJob::SyncOlder(event) => {
                sync::handle_sync_older(event, &self.sync_service).await
            }
            TriageJob::ProcessNotification(event) => {
                process::handle_process_notification(event, &self.sync_service, &self.rule_service)
                    .await
            }
            TriageJob::ApplyRule(event) => {
                rules::handle_apply_rule(event, &self.rule_service).await
            }
        };

        match result {
            Ok(()) => {
                info!(job_id = job.id.to_string(), "Successfully executed job");
                Ok(())
            }
            Err(err) => {
                error!(job_id = job.id.to_string(), "Failed to execute job: {err:?}");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_job_args_round_trip() {
        let job = TriageJob::sync_older(
            30,
            "2024-02-01T00:00:00Z".parse().unwrap(),
            Some(500),
            true,
        );
        let insert = job.to_insert().unwrap();
        assert_eq!(insert.kind, "SyncOlder");
        assert_eq!(insert.queue, SYNC_QUEUE);

        let decoded: TriageJob = serde_json::from_value(insert.args).unwrap();
        match decoded {
            TriageJob::SyncOlder(decoded) => {
                assert_eq!(decoded.days, 30);
                assert_eq!(decoded.max_count, Some(500));
                assert!(decoded.unread_only);
            }
            other => panic!("Unexpected job: {other:?}"),
        }
    }

    #[test]
    fn test_only_sync_new_is_unique_by_state() {
        assert!(TriageJob::sync_new().to_insert().unwrap().unique_states.is_some());
        assert!(TriageJob::apply_rule(RuleId(1))
            .to_insert()
            .unwrap()
            .unique_states
            .is_none());
    }
}
