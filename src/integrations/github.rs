use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    notification::SubjectType,
    repo::Repo,
    RepoId,
};

/// A notification thread as returned by the upstream list endpoint.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone)]
pub struct GithubNotificationThread {
    pub id: String,
    pub repository: GithubRepository,
    pub subject: GithubNotificationSubject,
    pub reason: String,
    pub unread: bool,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
}

impl GithubNotificationThread {
    pub fn subject_type(&self) -> SubjectType {
        SubjectType::from_upstream(&self.subject.r#type)
    }
}

#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone)]
pub struct GithubNotificationSubject {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_comment_url: Option<Url>,
    pub r#type: String,
}

/// Repository snapshot carried by every thread; only the fields the triage
/// pipeline consumes, the rest of the payload is not retained.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone)]
pub struct GithubRepository {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    pub owner: GithubUser,
    pub private: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<&GithubRepository> for Repo {
    fn from(repository: &GithubRepository) -> Self {
        Repo {
            id: RepoId(repository.id),
            full_name: repository.full_name.clone(),
            name: repository.name.clone(),
            private: repository.private,
            description: repository.description.clone(),
            owner_avatar_url: repository.owner.avatar_url.clone(),
        }
    }
}

#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone)]
pub struct GithubUser {
    pub login: String,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<Url>,
}

/// Author identity extracted from a raw subject payload: issues and pull
/// requests carry a `user`, most event payloads a `sender`.
pub fn extract_author(subject_raw: &serde_json::Value) -> (Option<String>, Option<i64>) {
    let author = subject_raw
        .get("user")
        .or_else(|| subject_raw.get("sender"));
    let login = author
        .and_then(|user| user.get("login"))
        .and_then(|login| login.as_str())
        .map(String::from);
    let id = author
        .and_then(|user| user.get("id"))
        .and_then(|id| id.as_i64());
    (login, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use serde_json::json;

    #[rstest]
    #[case(json!({"user": {"login": "octocat", "id": 583231}}), Some("octocat".to_string()), Some(583231))]
    #[case(json!({"sender": {"login": "dependabot", "id": 27856297}}), Some("dependabot".to_string()), Some(27856297))]
    #[case(json!({"title": "no author here"}), None, None)]
    fn test_extract_author(
        #[case] subject_raw: serde_json::Value,
        #[case] login: Option<String>,
        #[case] id: Option<i64>,
    ) {
        assert_eq!(extract_author(&subject_raw), (login, id));
    }

    #[test]
    fn test_thread_deserializes_from_upstream_payload() {
        let thread: GithubNotificationThread = serde_json::from_value(json!({
            "id": "12345",
            "unread": true,
            "reason": "review_requested",
            "updated_at": "2024-02-01T10:00:00Z",
            "subject": {
                "title": "Fix flaky retry test",
                "url": "https://api.github.com/repos/acme/widgets/pulls/42",
                "type": "PullRequest"
            },
            "repository": {
                "id": 99,
                "name": "widgets",
                "full_name": "acme/widgets",
                "private": false,
                "owner": {"login": "acme", "id": 1}
            }
        }))
        .unwrap();

        assert_eq!(thread.subject_type(), SubjectType::PullRequest);
        assert_eq!(Repo::from(&thread.repository).full_name, "acme/widgets");
    }
}
