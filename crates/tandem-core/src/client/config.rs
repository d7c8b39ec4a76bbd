//! Sync client configuration

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use thiserror::Error;

use crate::models::Platform;
use crate::protocol::DeviceIdentity;
use crate::util::{is_http_url, normalize_text_option};

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_MAX_PULL_PAGES: usize = 20;

#[derive(Debug, Error)]
pub enum ClientConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL of the sync API, without trailing slash
    pub api_url: String,
    pub auth_token: Option<String>,
    pub identity: DeviceIdentity,
    pub sync_interval: Duration,
    /// Quiet period after the latest queued change before a sync starts
    pub debounce: Duration,
    pub batch_size: usize,
    /// Attempts per request for transient failures, including the first
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub request_timeout: Duration,
    /// Upper bound on pull pages fetched in one cycle
    pub max_pull_pages: usize,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ClientConfig")
            .field("api_url", &self.api_url)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("identity", &self.identity)
            .field("sync_interval", &self.sync_interval)
            .field("debounce", &self.debounce)
            .field("batch_size", &self.batch_size)
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("request_timeout", &self.request_timeout)
            .field("max_pull_pages", &self.max_pull_pages)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>, identity: DeviceIdentity) -> Self {
        Self {
            api_url: api_url.into().trim().trim_end_matches('/').to_string(),
            auth_token: None,
            identity,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
            batch_size: DEFAULT_BATCH_SIZE,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_base_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
            max_pull_pages: DEFAULT_MAX_PULL_PAGES,
        }
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = normalize_text_option(Some(token.into()));
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, attempts: u32, base_delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_base_delay = base_delay;
        self
    }

    #[must_use]
    pub fn with_max_pull_pages(mut self, pages: usize) -> Self {
        self.max_pull_pages = pages.max(1);
        self
    }

    /// Read `TANDEM_*` variables from the process environment
    pub fn from_env(default_device_id: Option<String>) -> Result<Self, ClientConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned(), default_device_id)
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        default_device_id: Option<String>,
    ) -> Result<Self, ClientConfigError> {
        let api_url = optional_trimmed(&lookup, "TANDEM_API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        if !is_http_url(&api_url) {
            return Err(ClientConfigError::Invalid(
                "TANDEM_API_URL must start with http:// or https://".to_string(),
            ));
        }

        let user_id = optional_trimmed(&lookup, "TANDEM_USER_ID")
            .ok_or(ClientConfigError::MissingVar("TANDEM_USER_ID"))?;
        let device_id = optional_trimmed(&lookup, "TANDEM_DEVICE_ID")
            .or_else(|| normalize_text_option(default_device_id))
            .ok_or(ClientConfigError::MissingVar("TANDEM_DEVICE_ID"))?;

        let platform = match optional_trimmed(&lookup, "TANDEM_PLATFORM") {
            Some(value) => value
                .parse::<Platform>()
                .ok()
                .filter(|platform| platform.is_client())
                .ok_or_else(|| {
                    ClientConfigError::Invalid(
                        "TANDEM_PLATFORM must be one of mobile, web, extension".to_string(),
                    )
                })?,
            None => Platform::Web,
        };

        let interval_secs = bounded(&lookup, "TANDEM_SYNC_INTERVAL_SECS", 30, 1..=86_400)?;
        let batch_size = bounded(&lookup, "TANDEM_BATCH_SIZE", 50, 1..=500)?;
        let retry_attempts = bounded(&lookup, "TANDEM_RETRY_ATTEMPTS", 3, 1..=10)?;
        let timeout_secs = bounded(&lookup, "TANDEM_REQUEST_TIMEOUT_SECS", 30, 1..=300)?;

        let mut config = Self::new(api_url, DeviceIdentity::new(user_id, device_id, platform))
            .with_sync_interval(Duration::from_secs(interval_secs))
            .with_batch_size(usize::try_from(batch_size).unwrap_or(DEFAULT_BATCH_SIZE));
        config.auth_token = optional_trimmed(&lookup, "TANDEM_AUTH_TOKEN");
        config.retry_attempts = u32::try_from(retry_attempts).unwrap_or(DEFAULT_RETRY_ATTEMPTS);
        config.request_timeout = Duration::from_secs(timeout_secs);
        Ok(config)
    }
}

fn bounded(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: RangeInclusive<u64>,
) -> Result<u64, ClientConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    raw.parse::<u64>()
        .ok()
        .filter(|value| range.contains(value))
        .ok_or_else(|| {
            ClientConfigError::Invalid(format!(
                "{name} must be an integer in [{}, {}]",
                range.start(),
                range.end()
            ))
        })
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup<'a>(
        map: &'a HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| map.get(key).map(|value| (*value).to_string())
    }

    #[test]
    fn config_requires_user_id() {
        let map = HashMap::new();
        let err = ClientConfig::from_lookup(lookup(&map), Some("device".to_string())).unwrap_err();
        assert!(err.to_string().contains("TANDEM_USER_ID"));
    }

    #[test]
    fn config_applies_defaults() {
        let map = HashMap::from([("TANDEM_USER_ID", "user-1")]);
        let config =
            ClientConfig::from_lookup(lookup(&map), Some("device-a".to_string())).unwrap();

        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.identity.device_id, "device-a");
        assert_eq!(config.identity.platform, Platform::Web);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.sync_interval, Duration::from_secs(30));
        assert_eq!(config.retry_attempts, 3);
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn config_rejects_out_of_range_values() {
        let map = HashMap::from([("TANDEM_USER_ID", "user-1"), ("TANDEM_BATCH_SIZE", "0")]);
        let err = ClientConfig::from_lookup(lookup(&map), Some("d".to_string())).unwrap_err();
        assert!(err.to_string().contains("TANDEM_BATCH_SIZE"));

        let map = HashMap::from([("TANDEM_USER_ID", "user-1"), ("TANDEM_PLATFORM", "resolved")]);
        assert!(ClientConfig::from_lookup(lookup(&map), Some("d".to_string())).is_err());

        let map = HashMap::from([("TANDEM_USER_ID", "user-1"), ("TANDEM_API_URL", "ftp://x")]);
        assert!(ClientConfig::from_lookup(lookup(&map), Some("d".to_string())).is_err());
    }

    #[test]
    fn config_redacts_token_in_debug() {
        let map = HashMap::from([
            ("TANDEM_USER_ID", "user-1"),
            ("TANDEM_DEVICE_ID", "phone"),
            ("TANDEM_PLATFORM", "mobile"),
            ("TANDEM_API_URL", "https://sync.example.com/"),
            ("TANDEM_AUTH_TOKEN", "sensitive-jwt"),
        ]);
        let config = ClientConfig::from_lookup(lookup(&map), None).unwrap();
        assert_eq!(config.api_url, "https://sync.example.com");
        assert_eq!(config.identity.platform, Platform::Mobile);

        let debug = format!("{config:?}");
        assert!(!debug.contains("sensitive-jwt"));
        assert!(debug.contains("[REDACTED]"));
    }
}
