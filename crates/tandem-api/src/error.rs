use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tandem_core::protocol::{ApiEnvelope, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    InvalidOperation(String),
    #[error("Authentication failed: {0}")]
    Unauthorized(String),
    #[error("{0}")]
    TooManyRequests(String, u64),
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Internal sync error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn too_many_requests(message: impl Into<String>, retry_after_secs: u64) -> Self {
        Self::TooManyRequests(message.into(), retry_after_secs)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::BadRequest(_) => ErrorCode::InvalidRequest,
            Self::InvalidOperation(_) => ErrorCode::InvalidOperation,
            Self::Unauthorized(_) => ErrorCode::AuthFailed,
            Self::TooManyRequests(..) => ErrorCode::RateLimited,
            Self::MethodNotAllowed => ErrorCode::MethodNotAllowed,
            Self::Internal(_) => ErrorCode::SyncError,
        }
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::InvalidOperation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::TooManyRequests(..) => StatusCode::TOO_MANY_REQUESTS,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<tandem_core::Error> for AppError {
    fn from(error: tandem_core::Error) -> Self {
        match error {
            tandem_core::Error::InvalidInput(message) => Self::BadRequest(message),
            other => Self::internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Store details stay in the server log
            Self::Internal(_) => {
                tracing::error!(error = %self, "Sync request failed");
                "Internal sync error".to_string()
            }
            _ => self.to_string(),
        };
        let body = ApiEnvelope::<()>::failure(message, self.code());

        let mut response = (status, Json(body)).into_response();
        if let Self::TooManyRequests(_, retry_after_secs) = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
