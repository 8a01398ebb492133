#[macro_use]
extern crate macro_attr;

#[macro_use]
extern crate enum_derive;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub mod notification;
pub mod pull_request;
pub mod repo;
pub mod rule;
pub mod sync;
pub mod tag;
pub mod user;
pub mod view;

pub mod integrations;

pub const DEFAULT_PAGE_SIZE: usize = 50;

macro_rules! entity_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(
            Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

entity_id!(NotificationId);
entity_id!(
    /// Upstream-assigned repository identifier.
    RepoId
);
entity_id!(PullRequestId);
entity_id!(TagId);
entity_id!(ViewId);
entity_id!(RuleId);
entity_id!(UserId);
entity_id!(JobId);

/// Offset-paginated list envelope returned by every listing endpoint.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq)]
pub struct Page<T> {
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub content: Vec<T>,
}

impl<T> Page<T> {
    pub fn empty(limit: usize, offset: usize) -> Self {
        Page {
            total: 0,
            limit,
            offset,
            content: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_entity_id_round_trip() {
        let id: NotificationId = "42".parse().unwrap();
        assert_eq!(id, NotificationId(42));
        assert_eq!(id.to_string(), "42");
        assert_eq!(i64::from(id), 42);
    }

    #[test]
    fn test_entity_id_serializes_transparently() {
        assert_eq!(serde_json::to_string(&TagId(7)).unwrap(), "7");
        assert_eq!(serde_json::from_str::<TagId>("7").unwrap(), TagId(7));
    }
}
