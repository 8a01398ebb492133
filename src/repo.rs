use serde::{Deserialize, Serialize};
use url::Url;

use crate::RepoId;

/// Snapshot of the repository a notification belongs to, upserted on every
/// notification that references it.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq)]
pub struct Repo {
    /// Upstream-assigned identifier.
    pub id: RepoId,
    /// `owner/name`, unique.
    pub full_name: String,
    pub name: String,
    pub private: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_avatar_url: Option<Url>,
}

impl Repo {
    /// The `owner` part of `full_name`.
    pub fn owner(&self) -> &str {
        self.full_name
            .split_once('/')
            .map(|(owner, _)| owner)
            .unwrap_or(&self.full_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_owner_extraction() {
        let repo = Repo {
            id: RepoId(1),
            full_name: "acme/widgets".to_string(),
            name: "widgets".to_string(),
            private: false,
            description: None,
            owner_avatar_url: None,
        };
        assert_eq!(repo.owner(), "acme");
    }
}
