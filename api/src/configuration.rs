use std::time::Duration;

use anyhow::anyhow;
use config::{Config, ConfigError, Environment};
use secrecy::{ExposeSecret, Secret};
use serde::{de, Deserialize, Deserializer};
use url::Url;

/// Environment-driven settings. Every key is read verbatim from the process
/// environment (`DATABASE_URL`, `ADDR`, ...); only `DATABASE_URL` and
/// `JWT_SECRET` are required.
#[derive(Deserialize, Clone)]
pub struct Settings {
    pub database_url: Secret<String>,
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default)]
    pub upstream_token: Option<Secret<String>>,
    pub jwt_secret: Secret<String>,
    #[serde(default = "default_jwt_expiry", deserialize_with = "deserialize_duration")]
    pub jwt_expiry: Duration,
    #[serde(default = "default_sync_interval", deserialize_with = "deserialize_duration")]
    pub sync_interval: Duration,
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,
    #[serde(default)]
    pub secure_cookies: Option<bool>,
    #[serde(default = "default_log_directive")]
    pub log_directive: String,
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,
}

fn default_addr() -> String {
    ":8080".to_string()
}

fn default_jwt_expiry() -> Duration {
    Duration::from_secs(168 * 3600)
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_log_directive() -> String {
    "info".to_string()
}

fn default_max_connections() -> u32 {
    10
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::default())
            .build()?
            .try_deserialize()
    }

    /// Connection string with the password masked, for log lines.
    pub fn safe_database_url(&self) -> String {
        match Url::parse(self.database_url.expose_secret()) {
            Ok(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("********"));
                }
                url.to_string()
            }
            Err(_) => "<unparseable database URL>".to_string(),
        }
    }

    /// `ADDR` accepts both `host:port` and the shorthand `:port`.
    pub fn listen_address(&self) -> String {
        if let Some(port) = self.addr.strip_prefix(':') {
            format!("0.0.0.0:{port}")
        } else {
            self.addr.clone()
        }
    }

    pub fn allowed_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(String::from)
            .collect()
    }
}

/// Parse `"20s"`, `"5m"`, `"168h"`, `"7d"` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, anyhow::Error> {
    let raw = raw.trim();
    let (value, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split_at) => raw.split_at(split_at),
        None => (raw, "s"),
    };
    let value: u64 = value
        .parse()
        .map_err(|_| anyhow!("Invalid duration value `{raw}`"))?;
    let seconds = match unit.trim() {
        "s" | "" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        other => return Err(anyhow!("Unknown duration unit `{other}` in `{raw}`")),
    };
    Ok(Duration::from_secs(seconds))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(seconds) => Ok(Duration::from_secs(seconds)),
        RawDuration::Text(text) => parse_duration(&text).map_err(de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[rstest]
    #[case("20s", 20)]
    #[case("5m", 300)]
    #[case("168h", 604_800)]
    #[case("7d", 604_800)]
    #[case("45", 45)]
    fn test_parse_duration(#[case] raw: &str, #[case] expected_secs: u64) {
        assert_eq!(parse_duration(raw).unwrap(), Duration::from_secs(expected_secs));
    }

    #[rstest]
    #[case("")]
    #[case("h")]
    #[case("20x")]
    fn test_parse_duration_rejects_garbage(#[case] raw: &str) {
        assert!(parse_duration(raw).is_err());
    }

    #[test]
    fn test_listen_address_shorthand() {
        let settings = settings_with_addr(":8080");
        assert_eq!(settings.listen_address(), "0.0.0.0:8080");
        let settings = settings_with_addr("127.0.0.1:3000");
        assert_eq!(settings.listen_address(), "127.0.0.1:3000");
    }

    #[test]
    fn test_allowed_origins_splits_and_trims() {
        let mut settings = settings_with_addr(":8080");
        settings.cors_allowed_origins =
            Some("https://a.example, https://b.example ,".to_string());
        assert_eq!(
            settings.allowed_origins(),
            vec![
                "https://a.example".to_string(),
                "https://b.example".to_string()
            ]
        );
    }

    #[test]
    fn test_safe_database_url_masks_password() {
        let settings = Settings {
            database_url: Secret::new("postgres://triage:hunter2@db:5432/octotriage".to_string()),
            ..settings_with_addr(":8080")
        };
        assert!(!settings.safe_database_url().contains("hunter2"));
        assert!(settings.safe_database_url().contains("triage"));
    }

    fn settings_with_addr(addr: &str) -> Settings {
        Settings {
            database_url: Secret::new("postgres://localhost/octotriage".to_string()),
            addr: addr.to_string(),
            upstream_token: None,
            jwt_secret: Secret::new("secret".to_string()),
            jwt_expiry: default_jwt_expiry(),
            sync_interval: default_sync_interval(),
            cors_allowed_origins: None,
            secure_cookies: None,
            log_directive: default_log_directive(),
            database_max_connections: 10,
        }
    }
}
