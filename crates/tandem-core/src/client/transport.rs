//! Transport seam between the sync driver and the sync API

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use super::config::ClientConfig;
use crate::protocol::{ApiEnvelope, ErrorCode, PullResult, PushResult, ResolutionResult, SyncRequest};
use crate::util::{compact_text, is_http_url, normalize_text_option};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Invalid transport configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Authentication failed: {0}")]
    Unauthorized(String),
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("Invalid response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Worth retrying with backoff
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout | Self::Server { .. }
        )
    }

    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Carries sync requests to a coordinator
pub trait SyncTransport: Send + Sync + 'static {
    fn pull(&self, request: SyncRequest)
        -> impl Future<Output = TransportResult<PullResult>> + Send;

    fn push(&self, request: SyncRequest)
        -> impl Future<Output = TransportResult<PushResult>> + Send;

    fn resolve(
        &self,
        request: SyncRequest,
    ) -> impl Future<Output = TransportResult<ResolutionResult>> + Send;
}

/// `POST {api_url}/v1/sync` over HTTPS with bearer authentication
#[derive(Clone)]
pub struct HttpTransport {
    endpoint: String,
    auth_token: Option<String>,
    client: reqwest::Client,
    retry_attempts: u32,
    retry_base_delay: Duration,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("retry_attempts", &self.retry_attempts)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> TransportResult<Self> {
        let base = normalize_endpoint(config.api_url.clone())?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|error| TransportError::InvalidConfiguration(error.to_string()))?;

        Ok(Self {
            endpoint: format!("{base}/v1/sync"),
            auth_token: config.auth_token.clone(),
            client,
            retry_attempts: config.retry_attempts.max(1),
            retry_base_delay: config.retry_base_delay,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send<T: DeserializeOwned>(&self, request: &SyncRequest) -> TransportResult<T> {
        let mut attempt = 1;
        loop {
            match self.send_once(request).await {
                Err(error) if error.is_transient() && attempt < self.retry_attempts => {
                    let delay = self.retry_base_delay * 2_u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        operation = request.operation.as_str(),
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        %error,
                        "Sync request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn send_once<T: DeserializeOwned>(&self, request: &SyncRequest) -> TransportResult<T> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json")
            .json(request);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let envelope = response
            .json::<ApiEnvelope<T>>()
            .await
            .map_err(|error| TransportError::Decode(error.to_string()))?;
        unwrap_envelope(envelope)
    }
}

impl SyncTransport for HttpTransport {
    async fn pull(&self, request: SyncRequest) -> TransportResult<PullResult> {
        self.send(&request).await
    }

    async fn push(&self, request: SyncRequest) -> TransportResult<PushResult> {
        self.send(&request).await
    }

    async fn resolve(&self, request: SyncRequest) -> TransportResult<ResolutionResult> {
        self.send(&request).await
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(error.to_string())
    }
}

fn unwrap_envelope<T>(envelope: ApiEnvelope<T>) -> TransportResult<T> {
    if envelope.success {
        return envelope
            .result
            .ok_or_else(|| TransportError::Decode("response did not include result".to_string()));
    }

    let message = envelope
        .error
        .unwrap_or_else(|| "request failed".to_string());
    Err(match envelope.code {
        Some(ErrorCode::AuthFailed) => TransportError::Unauthorized(message),
        Some(ErrorCode::RateLimited) => TransportError::Server {
            status: 429,
            message,
        },
        Some(ErrorCode::SyncError) => TransportError::Server {
            status: 500,
            message,
        },
        _ => TransportError::Rejected(message),
    })
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.error.or(payload.message) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn status_error(status: StatusCode, body: &str) -> TransportError {
    let message = parse_api_error(status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Unauthorized(message),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => TransportError::Server {
            status: status.as_u16(),
            message,
        },
        status if status.is_server_error() => TransportError::Server {
            status: status.as_u16(),
            message,
        },
        _ => TransportError::Rejected(message),
    }
}

fn normalize_endpoint(raw: String) -> TransportResult<String> {
    let endpoint = normalize_text_option(Some(raw)).ok_or_else(|| {
        TransportError::InvalidConfiguration("endpoint must not be empty".to_string())
    })?;
    if is_http_url(&endpoint) {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(TransportError::InvalidConfiguration(
            "endpoint must include http:// or https://".to_string(),
        ))
    }
}
