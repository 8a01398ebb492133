use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::{Postgres, Transaction};

use octotriage::{
    notification::{Notification, NotificationPollItem, NotificationStateChange},
    Page, DEFAULT_PAGE_SIZE,
};

use crate::{
    integrations::github::GithubService,
    octotriage::OctotriageError,
    repository::{notification::NotificationRepository, repo::RepoRepository, Repository},
    search,
};

/// Ceiling on a single listing page; larger requests are clamped.
pub const MAX_PAGE_SIZE: usize = 200;
/// The browser poll loop only needs the newest slice of the inbox.
const POLL_LIMIT: usize = 100;

/// Which notifications a bulk mutation targets: an explicit list of upstream
/// ids, or every match of a query.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum BulkSelector {
    #[serde(rename_all = "camelCase")]
    GithubIds { github_ids: Vec<String> },
    Query { query: String },
}

#[derive(Debug, Clone, Copy)]
pub enum BulkAction {
    State(NotificationStateChange),
    Snooze(DateTime<Utc>),
}

/// High-level notification operations consumed by the HTTP handlers and the
/// rule engine's action executor.
pub struct NotificationService {
    repository: Arc<Repository>,
    github_service: Arc<GithubService>,
}

impl NotificationService {
    pub fn new(repository: Arc<Repository>, github_service: Arc<GithubService>) -> Self {
        NotificationService {
            repository,
            github_service,
        }
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, OctotriageError> {
        self.repository.begin().await
    }

    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn list_notifications(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        query_text: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Page<Notification>, OctotriageError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let query = search::build_query(query_text, limit, offset.unwrap_or(0))?;
        self.repository
            .list_notifications_from_query(executor, &query)
            .await
    }

    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn get_notification(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_id: &str,
    ) -> Result<Option<Notification>, OctotriageError> {
        self.repository
            .get_notification_for_github_id(executor, github_id)
            .await
    }

    /// Upstream ids and effective sort dates of the current inbox, consumed
    /// by the browser's desktop-notification cache.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn poll_notifications(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<Vec<NotificationPollItem>, OctotriageError> {
        let query = search::build_query("", POLL_LIMIT, 0)?;
        self.repository
            .list_notifications_for_poll(executor, &query)
            .await
    }

    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn apply_state_change(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_id: &str,
        change: NotificationStateChange,
    ) -> Result<Notification, OctotriageError> {
        self.repository
            .set_notification_state(executor, github_id, change)
            .await
    }

    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn snooze_notification(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_id: &str,
        snoozed_until: DateTime<Utc>,
    ) -> Result<Notification, OctotriageError> {
        self.repository
            .snooze_notification(executor, github_id, snoozed_until)
            .await
    }

    /// Apply one action to a batch, as a single statement per bulk. Returns
    /// the number of affected rows.
    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn bulk_update(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        selector: &BulkSelector,
        action: BulkAction,
    ) -> Result<u64, OctotriageError> {
        match (selector, action) {
            (BulkSelector::GithubIds { github_ids }, BulkAction::State(change)) => {
                self.repository
                    .set_notifications_state_by_github_ids(executor, github_ids, change)
                    .await
            }
            (BulkSelector::GithubIds { github_ids }, BulkAction::Snooze(until)) => {
                self.repository
                    .snooze_notifications_by_github_ids(executor, github_ids, until)
                    .await
            }
            (BulkSelector::Query { query }, BulkAction::State(change)) => {
                let compiled = search::build_query(query, DEFAULT_PAGE_SIZE, 0)?;
                self.repository
                    .set_notifications_state_from_query(executor, &compiled, change)
                    .await
            }
            (BulkSelector::Query { query }, BulkAction::Snooze(until)) => {
                let compiled = search::build_query(query, DEFAULT_PAGE_SIZE, 0)?;
                self.repository
                    .snooze_notifications_from_query(executor, &compiled, until)
                    .await
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn fetch_timeline(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_id: &str,
        per_page: usize,
        page: u32,
    ) -> Result<serde_json::Value, OctotriageError> {
        let (owner, repo, number) = self.subject_coordinates(executor, github_id).await?;
        self.github_service
            .fetch_timeline(&owner, &repo, number, per_page, page)
            .await
    }

    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn fetch_issue_comments(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_id: &str,
        per_page: usize,
        page: u32,
    ) -> Result<serde_json::Value, OctotriageError> {
        let (owner, repo, number) = self.subject_coordinates(executor, github_id).await?;
        self.github_service
            .fetch_issue_comments(&owner, &repo, number, per_page, page)
            .await
    }

    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn fetch_pull_request_reviews(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_id: &str,
        per_page: usize,
        page: u32,
    ) -> Result<serde_json::Value, OctotriageError> {
        let (owner, repo, number) = self.subject_coordinates(executor, github_id).await?;
        self.github_service
            .fetch_pull_request_reviews(&owner, &repo, number, per_page, page)
            .await
    }

    /// `(owner, repo, subject number)` for detail-view lazy loads.
    async fn subject_coordinates(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_id: &str,
    ) -> Result<(String, String, i64), OctotriageError> {
        let notification = self
            .repository
            .get_notification_for_github_id(executor, github_id)
            .await?
            .ok_or_else(|| OctotriageError::ItemNotFound(format!("notification {github_id}")))?;
        let repo = self
            .repository
            .get_repo(executor, notification.repository_id)
            .await?
            .ok_or_else(|| {
                OctotriageError::ItemNotFound(format!(
                    "repository {}",
                    notification.repository_id
                ))
            })?;
        let number = notification
            .subject_url
            .as_ref()
            .and_then(subject_number)
            .ok_or_else(|| OctotriageError::InvalidInputData {
                source: None,
                user_error: format!("Notification {github_id} has no numbered subject"),
            })?;
        let (owner, name) = repo
            .full_name
            .split_once('/')
            .map(|(owner, name)| (owner.to_string(), name.to_string()))
            .ok_or_else(|| OctotriageError::InvalidInputData {
                source: None,
                user_error: format!("Repository `{}` has no owner part", repo.full_name),
            })?;
        Ok((owner, name, number))
    }
}

/// The trailing path segment of a subject URL, when it is a number
/// (`.../pulls/42`, `.../issues/17`).
pub fn subject_number(url: &url::Url) -> Option<i64> {
    url.path_segments()?.next_back()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[rstest]
    #[case("https://api.github.com/repos/acme/widgets/pulls/42", Some(42))]
    #[case("https://api.github.com/repos/acme/widgets/issues/17", Some(17))]
    #[case("https://api.github.com/repos/acme/widgets/releases/tags/v1", None)]
    fn test_subject_number(#[case] url: &str, #[case] expected: Option<i64>) {
        assert_eq!(subject_number(&url.parse().unwrap()), expected);
    }

    #[test]
    fn test_bulk_selector_deserializes_both_shapes() {
        let by_ids: BulkSelector =
            serde_json::from_str(r#"{"githubIds": ["1", "2"]}"#).unwrap();
        assert!(matches!(by_ids, BulkSelector::GithubIds { github_ids } if github_ids.len() == 2));

        let by_query: BulkSelector = serde_json::from_str(r#"{"query": "is:read"}"#).unwrap();
        assert!(matches!(by_query, BulkSelector::Query { query } if query == "is:read"));
    }
}
