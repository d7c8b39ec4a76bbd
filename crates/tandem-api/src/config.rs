use std::collections::HashMap;
use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use tandem_core::db::DatabaseTarget;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database: DatabaseTarget,
    pub jwt_secret: String,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: String,
    pub auth_clock_skew: Duration,
    pub pull_page_size: usize,
    pub conflict_ttl: Duration,
    pub rate_limit_window: Duration,
    pub sync_rate_limit_per_window: u32,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database", &self.database)
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("jwt_audience", &self.jwt_audience)
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field("pull_page_size", &self.pull_page_size)
            .field("conflict_ttl", &self.conflict_ttl)
            .field("rate_limit_window", &self.rate_limit_window)
            .field(
                "sync_rate_limit_per_window",
                &self.sync_rate_limit_per_window,
            )
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "TANDEM_API_BIND_ADDR", "127.0.0.1:8080");
        let database = parse_database_target(&lookup)?;

        let jwt_secret = required_trimmed(&lookup, "TANDEM_JWT_SECRET")?;
        if jwt_secret.len() < 32 {
            return Err(ConfigError::Invalid(
                "TANDEM_JWT_SECRET must be at least 32 characters".to_string(),
            ));
        }
        let jwt_issuer = optional_trimmed(&lookup, "TANDEM_JWT_ISSUER");
        let jwt_audience = value_or_default(&lookup, "TANDEM_JWT_AUDIENCE", "authenticated");

        let auth_clock_skew_secs = bounded(&lookup, "AUTH_CLOCK_SKEW_SECS", 60, 0..=300)?;
        let pull_page_size = bounded(&lookup, "SYNC_PULL_PAGE_SIZE", 100, 1..=1_000)?;
        let conflict_ttl_secs = bounded(&lookup, "SYNC_CONFLICT_TTL_SECS", 300, 60..=604_800)?;
        let rate_limit_window_secs = bounded(&lookup, "RATE_LIMIT_WINDOW_SECS", 60, 10..=3_600)?;
        let sync_rate_limit_per_window =
            bounded(&lookup, "SYNC_RATE_LIMIT_PER_WINDOW", 120, 1..=10_000)?;

        Ok(Self {
            bind_addr,
            database,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            auth_clock_skew: Duration::from_secs(auth_clock_skew_secs),
            pull_page_size: usize::try_from(pull_page_size)
                .map_err(|_| ConfigError::Invalid("SYNC_PULL_PAGE_SIZE is too large".to_string()))?,
            conflict_ttl: Duration::from_secs(conflict_ttl_secs),
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            sync_rate_limit_per_window: u32::try_from(sync_rate_limit_per_window).map_err(|_| {
                ConfigError::Invalid("SYNC_RATE_LIMIT_PER_WINDOW is too large".to_string())
            })?,
        })
    }
}

fn parse_database_target(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<DatabaseTarget, ConfigError> {
    let path = optional_trimmed(&lookup, "TANDEM_DATABASE_PATH");
    let url = optional_trimmed(&lookup, "TANDEM_DATABASE_URL");

    match (path, url) {
        (Some(_), Some(_)) => Err(ConfigError::Invalid(
            "Set only one of TANDEM_DATABASE_PATH and TANDEM_DATABASE_URL".to_string(),
        )),
        (None, Some(url)) => {
            if !(url.starts_with("libsql://")
                || url.starts_with("https://")
                || url.starts_with("http://"))
            {
                return Err(ConfigError::Invalid(
                    "TANDEM_DATABASE_URL must start with libsql://, https:// or http://"
                        .to_string(),
                ));
            }
            let auth_token = required_trimmed(&lookup, "TANDEM_DATABASE_AUTH_TOKEN")?;
            Ok(DatabaseTarget::Remote { url, auth_token })
        }
        (Some(path), None) => Ok(DatabaseTarget::Local(path)),
        (None, None) => Ok(DatabaseTarget::Local("tandem.db".to_string())),
    }
}

fn bounded(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let value = value_or_default(lookup, name, &default.to_string())
        .parse::<u64>()
        .map_err(|_| {
            ConfigError::Invalid(format!(
                "{name} must be an integer in [{}, {}]",
                range.start(),
                range.end()
            ))
        })?;
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{}, {}]",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SECRET: &str = "a-very-long-test-secret-with-32-plus-chars";

    fn config_from(map: &HashMap<&str, &str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_jwt_secret() {
        let map = HashMap::new();
        let err = config_from(&map).unwrap_err();
        assert!(err.to_string().contains("TANDEM_JWT_SECRET"));

        let map = HashMap::from([("TANDEM_JWT_SECRET", "short")]);
        assert!(config_from(&map).is_err());
    }

    #[test]
    fn config_applies_defaults() {
        let map = HashMap::from([("TANDEM_JWT_SECRET", SECRET)]);
        let config = config_from(&map).unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.database, DatabaseTarget::Local("tandem.db".to_string()));
        assert_eq!(config.jwt_audience, "authenticated");
        assert_eq!(config.pull_page_size, 100);
        assert_eq!(config.conflict_ttl, Duration::from_secs(300));
        assert_eq!(config.sync_rate_limit_per_window, 120);
    }

    #[test]
    fn config_rejects_out_of_range_values() {
        let map = HashMap::from([
            ("TANDEM_JWT_SECRET", SECRET),
            ("SYNC_PULL_PAGE_SIZE", "0"),
        ]);
        let err = config_from(&map).unwrap_err();
        assert!(err.to_string().contains("SYNC_PULL_PAGE_SIZE"));

        let map = HashMap::from([
            ("TANDEM_JWT_SECRET", SECRET),
            ("AUTH_CLOCK_SKEW_SECS", "soon"),
        ]);
        assert!(config_from(&map).is_err());
    }

    #[test]
    fn remote_database_requires_token() {
        let map = HashMap::from([
            ("TANDEM_JWT_SECRET", SECRET),
            ("TANDEM_DATABASE_URL", "libsql://records.example.io"),
        ]);
        let err = config_from(&map).unwrap_err();
        assert!(err.to_string().contains("TANDEM_DATABASE_AUTH_TOKEN"));

        let map = HashMap::from([
            ("TANDEM_JWT_SECRET", SECRET),
            ("TANDEM_DATABASE_URL", "libsql://records.example.io"),
            ("TANDEM_DATABASE_PATH", "local.db"),
        ]);
        assert!(config_from(&map).is_err());
    }

    #[test]
    fn config_redacts_sensitive_debug_fields() {
        let map = HashMap::from([
            ("TANDEM_JWT_SECRET", SECRET),
            ("TANDEM_DATABASE_URL", "libsql://records.example.io"),
            ("TANDEM_DATABASE_AUTH_TOKEN", "sensitive-db-token"),
        ]);
        let config = config_from(&map).unwrap();

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains(SECRET));
        assert!(!debug_output.contains("sensitive-db-token"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
