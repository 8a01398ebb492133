use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{PullRequestId, RepoId};

/// Last-seen state of a pull request subject, refreshed whenever the owning
/// notification is processed.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq)]
pub struct PullRequest {
    pub id: PullRequestId,
    pub repository_id: RepoId,
    pub number: i64,
    pub state: String,
    pub merged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mergeable: Option<bool>,
    pub draft: bool,
    /// Opaque subject payload as fetched from the upstream detail endpoint.
    pub raw_data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}
