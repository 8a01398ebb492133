use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use secrecy::{CloneableSecret, DebugSecret, Secret, SerializableSecret, Zeroize};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{sync::InitialSyncSettings, UserId};

/// The single principal this instance serves. Created with default
/// credentials on first server start; never deleted while the process runs.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: Secret<PasswordHash>,
    pub sync_settings: SyncSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq, Default)]
pub struct SyncSettings {
    #[serde(default)]
    pub initial_sync_days: Option<i64>,
    #[serde(default)]
    pub initial_sync_max_count: Option<i64>,
    #[serde(default)]
    pub initial_sync_unread_only: bool,
    #[serde(default)]
    pub setup_completed: bool,
}

impl SyncSettings {
    pub fn initial_sync(&self) -> InitialSyncSettings {
        InitialSyncSettings {
            days: self.initial_sync_days,
            max_count: self.initial_sync_max_count,
            unread_only: self.initial_sync_unread_only,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct UpdateSyncSettingsParameters {
    #[validate(range(min = 1, max = 3650))]
    #[serde(default)]
    pub initial_sync_days: Option<i64>,
    #[validate(range(min = 1, max = 100_000))]
    #[serde(default)]
    pub initial_sync_max_count: Option<i64>,
    #[serde(default)]
    pub initial_sync_unread_only: bool,
    #[serde(default)]
    pub setup_completed: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(transparent)]
pub struct PasswordHash(pub String);

impl Zeroize for PasswordHash {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}
impl CloneableSecret for PasswordHash {}
impl DebugSecret for PasswordHash {}
impl SerializableSecret for PasswordHash {}

#[derive(Deserialize, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: Secret<Password>,
}

#[derive(Deserialize, Serialize)]
pub struct UpdateCredentialsParameters {
    pub current_password: Secret<Password>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub new_password: Option<Secret<Password>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(transparent)]
pub struct Password(pub String);

impl Zeroize for Password {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}
impl CloneableSecret for Password {}
impl DebugSecret for Password {}
impl SerializableSecret for Password {}

impl FromStr for Password {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() < 8 {
            return Err(anyhow!("Password must be at least 8 characters long"));
        }

        Ok(Self(s.to_string()))
    }
}

/// Usernames are lowercase alphanumerics, dots, dashes and underscores,
/// 3 to 39 characters.
pub fn validate_username(username: &str) -> Result<(), anyhow::Error> {
    let valid_length = (3..=39).contains(&username.len());
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'));
    if !valid_length || !valid_chars {
        return Err(anyhow!(
            "Username must be 3-39 characters of lowercase letters, digits, '.', '-' or '_'"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case("octocat", true)]
    #[case("a.b-c_d4", true)]
    #[case("ab", false)]
    #[case("Has-Uppercase", false)]
    #[case("white space", false)]
    fn test_validate_username(#[case] username: &str, #[case] valid: bool) {
        assert_eq!(validate_username(username).is_ok(), valid);
    }

    #[test]
    fn test_password_minimum_length() {
        assert!("short".parse::<Password>().is_err());
        assert!("long enough".parse::<Password>().is_ok());
    }
}
