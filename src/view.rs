use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::ViewId;

/// A named saved query. System views are seeded by migration and cannot be
/// deleted.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq)]
pub struct View {
    pub id: ViewId,
    pub name: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub display_order: i32,
    pub system_view: bool,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct CreateViewParameters {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct UpdateViewParameters {
    #[validate(length(min = 1, max = 100))]
    pub name: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
}
