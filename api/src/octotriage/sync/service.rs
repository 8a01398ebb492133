use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::{Postgres, Transaction};
use tracing::{info, warn};

use octotriage::{
    integrations::github::{extract_author, GithubNotificationThread},
    notification::{Notification, SubjectType},
    repo::Repo,
    sync::{InitialSyncSettings, SyncContext, SyncOlderParameters, SyncState},
};

use crate::{
    integrations::github::GithubService,
    jobs::TriageJob,
    octotriage::{notification::service::subject_number, OctotriageError, UpsertStatus},
    queue::JobClient,
    repository::{
        notification::{NotificationRepository, NotificationUpsert},
        pull_request::{PullRequestRepository, PullRequestUpsert},
        repo::RepoRepository,
        sync_state::{SyncStatePatch, SyncStateRepository},
        user::UserRepository,
        Repository,
    },
};

/// Drives forward polling, on-demand backfill, and per-thread processing.
/// The sync checkpoint row is written only from here, and only the
/// single-worker sync queue executes the two sync entry points, so runs
/// never race on it.
pub struct SyncService {
    repository: Arc<Repository>,
    github_service: Arc<GithubService>,
    job_client: JobClient,
}

impl SyncService {
    pub fn new(
        repository: Arc<Repository>,
        github_service: Arc<GithubService>,
        job_client: JobClient,
    ) -> Self {
        SyncService {
            repository,
            github_service,
            job_client,
        }
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, OctotriageError> {
        self.repository.begin().await
    }

    /// Snapshot of the sync configuration and checkpoint, computed once per
    /// run and used as the single source of truth for the rest of that run.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn get_sync_context(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<SyncContext, OctotriageError> {
        let user = self
            .repository
            .get_user(executor)
            .await?
            .ok_or_else(|| OctotriageError::ItemNotFound("user".to_string()))?;
        let sync_state = self
            .repository
            .get_sync_state(executor)
            .await?
            .unwrap_or_default();

        Ok(SyncContext {
            is_sync_configured: user.sync_settings.setup_completed
                && self.github_service.has_token().await,
            is_initial_sync: sync_state.initial_sync_completed_at.is_none(),
            oldest_notification_synced_at: sync_state.oldest_notification_synced_at,
            latest_notification_at: sync_state.latest_notification_at,
            initial_sync_settings: user.sync_settings.initial_sync(),
        })
    }

    pub async fn get_sync_state(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<SyncState, OctotriageError> {
        Ok(self
            .repository
            .get_sync_state(executor)
            .await?
            .unwrap_or_default())
    }

    /// Forward sync: poll the upstream for updates newer than the
    /// checkpoint and fan each returned thread out as a
    /// `ProcessNotification` job.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn sync_new(&self) -> Result<(), OctotriageError> {
        let mut transaction = self.begin().await?;
        let context = self.get_sync_context(&mut transaction).await?;
        drop(transaction);

        if !context.is_sync_configured {
            info!("Skipping sync: setup is not completed or no upstream token is configured");
            return Ok(());
        }

        let now = Utc::now();
        let since = compute_forward_since(&context, now);
        let mut threads = self.github_service.list_notifications(since).await?;
        if context.is_initial_sync {
            threads = apply_initial_sync_filters(threads, &context.initial_sync_settings);
        }

        if threads.is_empty() {
            // Zero threads on the initial sync still means setup is
            // complete; otherwise the UI would show "syncing..." forever.
            let patch = SyncStatePatch {
                last_successful_poll: Some(now),
                initial_sync_completed_at: context.is_initial_sync.then_some(now),
                ..Default::default()
            };
            self.persist_sync_state(&patch).await;
            return Ok(());
        }

        let mut latest: Option<DateTime<Utc>> = None;
        let mut oldest: Option<DateTime<Utc>> = None;
        let count = threads.len();
        for thread in threads {
            let updated_at = thread.updated_at;
            let insert = TriageJob::process_notification(thread).to_insert()?;
            self.job_client.insert(&insert).await?;
            latest = Some(latest.map_or(updated_at, |l| l.max(updated_at)));
            if context.is_initial_sync {
                oldest = Some(oldest.map_or(updated_at, |o| o.min(updated_at)));
            }
        }
        info!("Enqueued {count} notification threads for processing");

        // The queued processing jobs are the real progress; a failed
        // checkpoint write is logged and swallowed, never undone.
        let patch = SyncStatePatch {
            last_successful_poll: Some(now),
            latest_notification_at: latest,
            initial_sync_completed_at: context.is_initial_sync.then_some(now),
            oldest_notification_synced_at: if context.is_initial_sync { oldest } else { None },
            ..Default::default()
        };
        self.persist_sync_state(&patch).await;

        Ok(())
    }

    /// Backfill sync: fetch threads older than `until_time`, bounded by
    /// `days` back and optionally by count/unread, and push the oldest
    /// checkpoint back.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn sync_older(
        &self,
        days: i64,
        until_time: DateTime<Utc>,
        max_count: Option<i64>,
        unread_only: bool,
    ) -> Result<(), OctotriageError> {
        if days < 1 || until_time.timestamp() == 0 {
            return Err(OctotriageError::InvalidInputData {
                source: None,
                user_error: "Backfill requires a day span and a non-zero upper bound".to_string(),
            });
        }

        let since = until_time - Duration::days(days);
        let threads = self.github_service.list_notifications(Some(since)).await?;
        let threads = filter_older_threads(threads, until_time, unread_only, max_count);

        let mut oldest: Option<DateTime<Utc>> = None;
        let count = threads.len();
        for thread in threads {
            let updated_at = thread.updated_at;
            let insert = TriageJob::process_notification(thread).to_insert()?;
            self.job_client.insert(&insert).await?;
            oldest = Some(oldest.map_or(updated_at, |o| o.min(updated_at)));
        }
        info!("Enqueued {count} older notification threads for processing");

        if oldest.is_some() {
            let patch = SyncStatePatch {
                oldest_notification_synced_at: oldest,
                ..Default::default()
            };
            self.persist_sync_state(&patch).await;
        }

        Ok(())
    }

    /// Validate and enqueue an on-demand backfill, bounded by the current
    /// oldest checkpoint. Fails with a caller error when no backfill bound
    /// exists yet.
    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn request_older_sync(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        parameters: &SyncOlderParameters,
    ) -> Result<(), OctotriageError> {
        validator::Validate::validate(parameters)
            .map_err(OctotriageError::InvalidParameters)?;

        let sync_state = self
            .repository
            .get_sync_state(executor)
            .await?
            .unwrap_or_default();
        let until_time = sync_state.oldest_notification_synced_at.ok_or_else(|| {
            OctotriageError::InvalidInputData {
                source: None,
                user_error: "No synced history yet: run an initial sync before backfilling"
                    .to_string(),
            }
        })?;

        let insert = TriageJob::sync_older(
            parameters.days,
            until_time,
            parameters.max_count,
            parameters.unread_only,
        )
        .to_insert()?;
        self.job_client.insert(&insert).await?;
        Ok(())
    }

    /// Upsert the thread's repository, its pull-request snapshot when the
    /// subject is one, and the notification itself. `Created` tells the
    /// worker to run rule matching; a re-delivered thread reports `Updated`
    /// and rules stay quiet.
    #[tracing::instrument(level = "debug", skip_all, fields(github_id = thread.id), err)]
    pub async fn process_notification(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        thread: &GithubNotificationThread,
    ) -> Result<UpsertStatus<Box<Notification>>, OctotriageError> {
        let repo = Repo::from(&thread.repository);
        self.repository.upsert_repo(executor, &repo).await?;

        let subject_type = thread.subject_type();
        let mut pull_request_id = None;
        let mut subject_raw = None;
        if subject_type == SubjectType::PullRequest {
            if let Some(url) = &thread.subject.url {
                let raw = self.github_service.fetch_subject_raw(url.as_str()).await?;
                let number = raw
                    .get("number")
                    .and_then(|n| n.as_i64())
                    .or_else(|| subject_number(url));
                if let Some(number) = number {
                    let snapshot = pull_request_from_subject(
                        repo.id.into(),
                        number,
                        &raw,
                        thread.updated_at,
                    );
                    let stored = self
                        .repository
                        .upsert_pull_request(executor, &snapshot)
                        .await?;
                    pull_request_id = Some(stored.id);
                }
                subject_raw = Some(raw);
            }
        }

        let (author_login, author_id) = subject_raw
            .as_ref()
            .map(extract_author)
            .unwrap_or((None, None));

        self.repository
            .create_or_update_notification(
                executor,
                Box::new(NotificationUpsert {
                    github_id: thread.id.clone(),
                    repository_id: repo.id,
                    pull_request_id,
                    title: thread.subject.title.clone(),
                    subject_type,
                    subject_url: thread.subject.url.clone(),
                    subject_raw,
                    reason: thread.reason.clone(),
                    author_login,
                    author_id,
                    updated_at: thread.updated_at,
                    last_read_at: thread.last_read_at,
                    unread: thread.unread,
                }),
            )
            .await
    }

    /// Re-fetch the subject payload of an already-stored notification and
    /// refresh the derived columns.
    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn refresh_subject_data(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_id: &str,
    ) -> Result<Notification, OctotriageError> {
        let notification = self
            .repository
            .get_notification_for_github_id(executor, github_id)
            .await?
            .ok_or_else(|| OctotriageError::ItemNotFound(format!("notification {github_id}")))?;
        let subject_url = notification.subject_url.clone().ok_or_else(|| {
            OctotriageError::InvalidInputData {
                source: None,
                user_error: format!("Notification {github_id} has no subject URL to refresh"),
            }
        })?;

        let raw = self
            .github_service
            .fetch_subject_raw(subject_url.as_str())
            .await?;

        let mut pull_request_id = notification.pull_request_id;
        if notification.subject_type == SubjectType::PullRequest {
            let number = raw
                .get("number")
                .and_then(|n| n.as_i64())
                .or_else(|| subject_number(&subject_url));
            if let Some(number) = number {
                let snapshot = pull_request_from_subject(
                    notification.repository_id.into(),
                    number,
                    &raw,
                    notification.updated_at,
                );
                let stored = self
                    .repository
                    .upsert_pull_request(executor, &snapshot)
                    .await?;
                pull_request_id = Some(stored.id);
            }
        }

        let (author_login, author_id) = extract_author(&raw);
        let upserted = self
            .repository
            .create_or_update_notification(
                executor,
                Box::new(NotificationUpsert {
                    github_id: notification.github_id.clone(),
                    repository_id: notification.repository_id,
                    pull_request_id,
                    title: notification.title.clone(),
                    subject_type: notification.subject_type,
                    subject_url: Some(subject_url),
                    subject_raw: Some(raw),
                    reason: notification.reason.clone(),
                    author_login,
                    author_id,
                    updated_at: notification.updated_at,
                    last_read_at: notification.last_read_at,
                    unread: notification.unread,
                }),
            )
            .await?;

        Ok(*upserted.value())
    }

    async fn persist_sync_state(&self, patch: &SyncStatePatch) {
        let result = async {
            let mut transaction = self.begin().await?;
            self.repository
                .upsert_sync_state(&mut transaction, patch)
                .await?;
            transaction
                .commit()
                .await
                .map_err(|err| OctotriageError::Recoverable(anyhow::anyhow!(
                    "Failed to commit sync state update: {err}"
                )))?;
            Ok::<(), OctotriageError>(())
        }
        .await;

        if let Err(err) = result {
            warn!("Failed to persist sync checkpoint, continuing: {err:?}");
        }
    }
}

/// `since` bound of a forward sync: the previous checkpoint when one
/// exists, otherwise the initial-sync window (`None` means all history).
pub fn compute_forward_since(
    context: &SyncContext,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if let Some(latest) = context.latest_notification_at {
        return Some(latest);
    }
    context
        .initial_sync_settings
        .days
        .map(|days| now - Duration::days(days))
}

/// Client-side bounds of the initial sync: optional unread filter, then
/// truncation to the configured count (newest first, the upstream order).
pub fn apply_initial_sync_filters(
    threads: Vec<GithubNotificationThread>,
    settings: &InitialSyncSettings,
) -> Vec<GithubNotificationThread> {
    let mut threads: Vec<GithubNotificationThread> = threads
        .into_iter()
        .filter(|thread| !settings.unread_only || thread.unread)
        .collect();
    if let Some(max_count) = settings.max_count {
        threads.truncate(max_count.max(0) as usize);
    }
    threads
}

/// Client-side bounds of a backfill batch: strictly older than `until`,
/// optional unread filter, truncation to `max_count`.
pub fn filter_older_threads(
    threads: Vec<GithubNotificationThread>,
    until: DateTime<Utc>,
    unread_only: bool,
    max_count: Option<i64>,
) -> Vec<GithubNotificationThread> {
    let mut threads: Vec<GithubNotificationThread> = threads
        .into_iter()
        .filter(|thread| thread.updated_at < until)
        .filter(|thread| !unread_only || thread.unread)
        .collect();
    if let Some(max_count) = max_count {
        threads.truncate(max_count.max(0) as usize);
    }
    threads
}

fn pull_request_from_subject(
    repository_id: i64,
    number: i64,
    raw: &serde_json::Value,
    updated_at: DateTime<Utc>,
) -> PullRequestUpsert {
    PullRequestUpsert {
        repository_id: repository_id.into(),
        number,
        state: raw
            .get("state")
            .and_then(|s| s.as_str())
            .unwrap_or("open")
            .to_string(),
        merged: raw.get("merged").and_then(|m| m.as_bool()).unwrap_or(false),
        mergeable: raw.get("mergeable").and_then(|m| m.as_bool()),
        draft: raw.get("draft").and_then(|d| d.as_bool()).unwrap_or(false),
        raw_data: raw.clone(),
        updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use octotriage::integrations::github::{GithubNotificationSubject, GithubRepository, GithubUser};
    use pretty_assertions::assert_eq;
    use rstest::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 15, 12, 0, 0).unwrap()
    }

    fn context(
        latest: Option<DateTime<Utc>>,
        days: Option<i64>,
    ) -> SyncContext {
        SyncContext {
            is_sync_configured: true,
            is_initial_sync: latest.is_none(),
            oldest_notification_synced_at: None,
            latest_notification_at: latest,
            initial_sync_settings: InitialSyncSettings {
                days,
                max_count: None,
                unread_only: false,
            },
        }
    }

    fn thread(id: &str, updated_at: DateTime<Utc>, unread: bool) -> GithubNotificationThread {
        GithubNotificationThread {
            id: id.to_string(),
            repository: GithubRepository {
                id: 1,
                name: "widgets".to_string(),
                full_name: "acme/widgets".to_string(),
                owner: GithubUser {
                    login: "acme".to_string(),
                    id: 10,
                    avatar_url: None,
                },
                private: false,
                description: None,
            },
            subject: GithubNotificationSubject {
                title: "A title".to_string(),
                url: None,
                latest_comment_url: None,
                r#type: "Issue".to_string(),
            },
            reason: "subscribed".to_string(),
            unread,
            updated_at,
            last_read_at: None,
            url: None,
        }
    }

    #[test]
    fn test_forward_since_uses_existing_checkpoint() {
        let latest = Utc.with_ymd_and_hms(2024, 2, 10, 0, 0, 0).unwrap();
        assert_eq!(
            compute_forward_since(&context(Some(latest), Some(30)), now()),
            Some(latest)
        );
    }

    #[test]
    fn test_initial_sync_of_one_day_starts_exactly_24_hours_ago() {
        assert_eq!(
            compute_forward_since(&context(None, Some(1)), now()),
            Some(now() - Duration::days(1))
        );
    }

    #[test]
    fn test_initial_sync_of_all_history_passes_no_since() {
        assert_eq!(compute_forward_since(&context(None, None), now()), None);
    }

    #[rstest]
    #[case(false, None, 3)]
    #[case(true, None, 2)]
    #[case(false, Some(1), 1)]
    fn test_filter_older_threads(
        #[case] unread_only: bool,
        #[case] max_count: Option<i64>,
        #[case] expected: usize,
    ) {
        let until = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let threads = vec![
            thread("1", until - Duration::hours(1), true),
            thread("2", until - Duration::hours(2), false),
            thread("3", until - Duration::hours(3), true),
            // At or past the bound: excluded.
            thread("4", until, true),
            thread("5", until + Duration::hours(1), true),
        ];
        let filtered = filter_older_threads(threads, until, unread_only, max_count);
        assert_eq!(filtered.len(), expected);
        assert!(filtered.iter().all(|t| t.updated_at < until));
    }

    #[test]
    fn test_initial_sync_filters_apply_unread_and_count() {
        let threads = vec![
            thread("1", now(), true),
            thread("2", now(), false),
            thread("3", now(), true),
        ];
        let settings = InitialSyncSettings {
            days: Some(30),
            max_count: Some(1),
            unread_only: true,
        };
        let filtered = apply_initial_sync_filters(threads, &settings);
        assert_eq!(
            filtered.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["1"]
        );
    }
}
