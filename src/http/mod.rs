//! HTTP transport: pooled client, retry policy and executor, error classification.

mod auth;
mod classify;
mod client;
mod error;
mod policy;
mod pool;
mod retry;

pub use auth::{Anonymous, CredentialProvider, StaticToken};
pub use classify::{ErrorKind, classify, classify_anyhow, is_retryable, is_retryable_status};
pub use client::{DEFAULT_REQUEST_TIMEOUT, HttpClient, Response};
pub use error::{ApiError, TransportError};
pub use policy::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRYABLE_ERROR_SUBSTRINGS, DEFAULT_RETRYABLE_STATUS_CODES, JITTER_FRACTION,
    RetryPolicy,
};
pub use pool::{ConnectionPoolSettings, HostLimiter, Transport, build_transport};
pub use retry::{execute, is_cancelled};

