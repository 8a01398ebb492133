use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{NotificationId, PullRequestId, RepoId, TagId};

/// Canonical copy of an upstream notification thread, enriched with the
/// triage state the user (or a rule) has applied to it.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq)]
pub struct Notification {
    pub id: NotificationId,
    /// Upstream thread identifier, unique across the account.
    pub github_id: String,
    pub repository_id: RepoId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_id: Option<PullRequestId>,
    pub title: String,
    pub subject_type: SubjectType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_raw: Option<serde_json::Value>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snoozed_until: Option<DateTime<Utc>>,
    pub effective_sort_date: DateTime<Utc>,
    pub unread: bool,
    pub archived: bool,
    pub muted: bool,
    pub starred: bool,
    /// Suppressed from default-scope views by a rule action. Distinct from
    /// `archived`: a filtered notification stays findable in custom views.
    pub filtered: bool,
    pub tag_ids: Vec<TagId>,
}

impl Notification {
    /// A snooze that has already elapsed counts as no snooze.
    pub fn is_snoozed(&self, now: DateTime<Utc>) -> bool {
        self.snoozed_until.map(|until| until > now).unwrap_or(false)
    }

    /// Whether the notification shows up in default-scope views.
    pub fn is_in_inbox(&self, now: DateTime<Utc>) -> bool {
        !self.archived && !self.muted && !self.filtered && !self.is_snoozed(now)
    }
}

macro_attr! {
    #[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy, Eq, EnumFromStr!, EnumDisplay!)]
    pub enum SubjectType {
        PullRequest,
        Issue,
        Release,
        Discussion,
        RepositoryVulnerabilityAlert,
        CheckSuite,
        WorkflowRun,
        Commit,
        Unknown,
    }
}

impl SubjectType {
    /// Upstream subject types we have not modeled map to `Unknown` rather
    /// than failing ingestion.
    pub fn from_upstream(raw: &str) -> Self {
        raw.parse().unwrap_or(SubjectType::Unknown)
    }
}

/// Single-column state flips exposed by the store and the bulk mutators.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStateChange {
    MarkRead,
    MarkUnread,
    Archive,
    Unarchive,
    Mute,
    Unmute,
    Star,
    Unstar,
    MarkFiltered,
    MarkUnfiltered,
    Unsnooze,
}

/// Lightweight row used by the browser poll loop for unseen detection.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq)]
pub struct NotificationPollItem {
    pub github_id: String,
    pub effective_sort_date: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use rstest::*;

    fn notification_with_snooze(snoozed_until: Option<DateTime<Utc>>) -> Notification {
        Notification {
            id: NotificationId(1),
            github_id: "123".to_string(),
            repository_id: RepoId(1),
            pull_request_id: None,
            title: "A title".to_string(),
            subject_type: SubjectType::Issue,
            subject_url: None,
            subject_raw: None,
            reason: "mention".to_string(),
            author_login: None,
            author_id: None,
            updated_at: Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap(),
            last_read_at: None,
            snoozed_until,
            effective_sort_date: Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap(),
            unread: true,
            archived: false,
            muted: false,
            starred: false,
            filtered: false,
            tag_ids: vec![],
        }
    }

    #[rstest]
    #[case(None, false)]
    #[case(Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()), false)]
    #[case(Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()), true)]
    fn test_elapsed_snooze_is_equivalent_to_unset(
        #[case] snoozed_until: Option<DateTime<Utc>>,
        #[case] expected: bool,
    ) {
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap();
        let notification = notification_with_snooze(snoozed_until);
        assert_eq!(notification.is_snoozed(now), expected);
        assert_eq!(notification.is_in_inbox(now), !expected);
    }

    #[rstest]
    #[case("PullRequest", SubjectType::PullRequest)]
    #[case("RepositoryVulnerabilityAlert", SubjectType::RepositoryVulnerabilityAlert)]
    #[case("SomeFutureSubject", SubjectType::Unknown)]
    fn test_subject_type_from_upstream(#[case] raw: &str, #[case] expected: SubjectType) {
        assert_eq!(SubjectType::from_upstream(raw), expected);
    }
}
