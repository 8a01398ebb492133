use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{RuleId, TagId, ViewId};

/// An ordered pairing of a query (direct or via a saved view) with a set of
/// declarative triage actions. Rules are evaluated in ascending
/// `display_order` and never short-circuit.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq)]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    pub enabled: bool,
    pub display_order: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_id: Option<ViewId>,
    pub actions: RuleActions,
}

impl Rule {
    /// `view_id` wins when both a query and a view reference are present.
    pub fn references_view(&self) -> bool {
        self.view_id.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq, Default)]
pub struct RuleActions {
    #[serde(default)]
    pub skip_inbox: bool,
    #[serde(default)]
    pub mark_read: bool,
    #[serde(default)]
    pub archive: bool,
    #[serde(default)]
    pub star: bool,
    #[serde(default)]
    pub mute: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assign_tags: Vec<TagId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_tags: Vec<TagId>,
}

impl RuleActions {
    pub fn is_empty(&self) -> bool {
        !self.skip_inbox
            && !self.mark_read
            && !self.archive
            && !self.star
            && !self.mute
            && self.assign_tags.is_empty()
            && self.remove_tags.is_empty()
    }
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateRuleParameters {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub view_id: Option<ViewId>,
    pub actions: RuleActions,
    /// When set, the server enqueues a retroactive application job right
    /// after the rule is created.
    #[serde(default)]
    pub apply_to_existing: bool,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRuleParameters {
    #[validate(length(min = 1, max = 100))]
    pub name: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    /// An empty string clears the query.
    #[serde(default)]
    pub query: Option<String>,
    /// Absent leaves the view reference alone; an explicit `null` clears it.
    #[serde(default, with = "serde_with::rust::double_option")]
    pub view_id: Option<Option<ViewId>>,
    #[serde(default)]
    pub actions: Option<RuleActions>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_actions_deserialize_with_defaults() {
        let actions: RuleActions = serde_json::from_str(r#"{"skip_inbox": true}"#).unwrap();
        assert_eq!(
            actions,
            RuleActions {
                skip_inbox: true,
                ..Default::default()
            }
        );
        assert!(!actions.is_empty());
        assert!(RuleActions::default().is_empty());
    }
}
