//! Typed errors callers can recognise with `anyhow::Error::downcast_ref`.

use reqwest::StatusCode;

use super::client::Response;

/// Control-flow errors raised by the transport itself.
#[derive(Debug)]
pub enum TransportError {
    /// The cancellation token fired. Carries the last response obtained, if any.
    Cancelled { last_response: Option<Response> },
    /// The response status is in the policy's retryable set.
    RetryableStatus(StatusCode),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Cancelled { .. } => write!(f, "Request cancelled"),
            TransportError::RetryableStatus(status) => {
                write!(f, "Server returned retryable status {}", status)
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// A final non-success response, phrased for the person at the terminal.
#[derive(Debug)]
pub enum ApiError {
    /// HTTP 401
    Unauthorized(String),
    /// HTTP 403
    Forbidden(String),
    /// HTTP 404
    NotFound(String),
    /// HTTP 429 that survived every retry
    RateLimited(String),
    /// Other 4xx responses
    Client { status: StatusCode, message: String },
    /// 5xx responses that survived every retry
    Server { status: StatusCode, message: String },
}

impl ApiError {
    /// Builds the error for `status`, using the response body as detail when present.
    pub fn from_status(status: StatusCode, body: &[u8]) -> Self {
        let detail = String::from_utf8_lossy(body).trim().to_string();
        let message = if detail.is_empty() {
            status
                .canonical_reason()
                .unwrap_or("no details provided")
                .to_string()
        } else {
            detail
        };

        match status {
            StatusCode::UNAUTHORIZED => ApiError::Unauthorized(message),
            StatusCode::FORBIDDEN => ApiError::Forbidden(message),
            StatusCode::NOT_FOUND => ApiError::NotFound(message),
            StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited(message),
            s if s.is_server_error() => ApiError::Server { status: s, message },
            s => ApiError::Client { status: s, message },
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Client { status, .. } | ApiError::Server { status, .. } => *status,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized(msg) => {
                write!(f, "Authentication failed: {}. Check NBCTL_TOKEN.", msg)
            }
            ApiError::Forbidden(msg) => {
                write!(f, "Access forbidden: {}", msg)
            }
            ApiError::NotFound(msg) => {
                write!(f, "Not found: {}", msg)
            }
            ApiError::RateLimited(msg) => {
                write!(f, "Rate limit exceeded: {}. Try again later.", msg)
            }
            ApiError::Client { status, message } => {
                write!(f, "Request error (HTTP {}): {}", status.as_u16(), message)
            }
            ApiError::Server { status, message } => {
                write!(f, "Server error (HTTP {}): {}", status.as_u16(), message)
            }
        }
    }
}

impl std::error::Error for ApiError {}
