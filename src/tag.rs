use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::TagId;

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    /// Derived from `name`, unique; this is what `tags:` queries match on.
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub display_order: i32,
}

macro_attr! {
    #[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy, Eq, EnumFromStr!, EnumDisplay!)]
    pub enum TaggableEntity {
        Notification,
    }
}

impl TaggableEntity {
    /// Short string stored in the `entity_type` column.
    pub fn as_entity_type(&self) -> &'static str {
        match self {
            TaggableEntity::Notification => "notification",
        }
    }
}

/// A row of the authoritative tag join table. The owning notification's
/// denormalized `tag_ids` must be recomputed after every assign/remove.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq)]
pub struct TagAssignment {
    pub tag_id: TagId,
    pub entity_type: String,
    pub entity_id: i64,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct CreateTagParameters {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct UpdateTagParameters {
    #[validate(length(min = 1, max = 100))]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Derive a URL- and query-safe slug from a display name: lowercase
/// alphanumerics with single dashes, no leading or trailing dash.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[rstest]
    #[case("Urgent", "urgent")]
    #[case("Needs Review", "needs-review")]
    #[case("  CI / Nightly builds  ", "ci-nightly-builds")]
    #[case("déjà vu", "d-j-vu")]
    #[case("---", "")]
    fn test_slugify(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(slugify(name), expected);
    }

    #[test]
    fn test_slugify_is_idempotent() {
        let once = slugify("Needs Review!");
        assert_eq!(slugify(&once), once);
    }
}
