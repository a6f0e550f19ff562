//! Error classification shared by the retry executor and the degradation evaluator.
//!
//! Classification is a pure function of the error's message chain and its
//! structural type: the same error always yields the same [`ErrorKind`].

use std::error::Error as StdError;
use std::fmt;
use std::io;

use super::error::{ApiError, TransportError};
use super::policy::RetryPolicy;

/// High-level classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Nothing recognisable; usually not retried.
    Unknown,
    /// The peer actively refused the connection.
    ConnectionRefused,
    /// A connect, read or overall deadline elapsed.
    Timeout,
    /// The host name could not be resolved.
    DnsResolution,
    /// No route to the network or host.
    NetworkUnreachable,
    /// An established connection was torn down (reset, broken pipe, EOF).
    ConnectionReset,
    /// Some other low-level network or URL failure.
    TemporaryFailure,
    /// The server answered with an HTTP error status.
    HttpError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Unknown => "unknown",
            ErrorKind::ConnectionRefused => "connection refused",
            ErrorKind::Timeout => "timeout",
            ErrorKind::DnsResolution => "dns resolution",
            ErrorKind::NetworkUnreachable => "network unreachable",
            ErrorKind::ConnectionReset => "connection reset",
            ErrorKind::TemporaryFailure => "temporary failure",
            ErrorKind::HttpError => "http error",
        };
        f.write_str(name)
    }
}

/// Ordered substring rules; the first match wins.
const MESSAGE_RULES: &[(&[&str], ErrorKind)] = &[
    (&["connection refused"], ErrorKind::ConnectionRefused),
    (&["timeout", "deadline exceeded"], ErrorKind::Timeout),
    (&["no such host", "name resolution"], ErrorKind::DnsResolution),
    (
        &["network unreachable", "no route to host"],
        ErrorKind::NetworkUnreachable,
    ),
    (
        &["connection reset", "broken pipe", "eof"],
        ErrorKind::ConnectionReset,
    ),
];

/// Classifies an error by walking its whole `source()` chain.
///
/// Message substrings are checked first (case-insensitive) so that wording
/// coming from opaque third-party errors keeps working. Structured causes
/// (reqwest timeouts, `std::io::ErrorKind`) are consulted next, then the
/// structural "is this a network/URL error at all" test.
pub fn classify(err: &(dyn StdError + 'static)) -> ErrorKind {
    let message = chain_message(err);

    for (needles, kind) in MESSAGE_RULES {
        if needles.iter().any(|needle| message.contains(needle)) {
            return *kind;
        }
    }

    let mut structural = false;
    for cause in chain(err) {
        if let Some(e) = cause.downcast_ref::<TransportError>() {
            return match e {
                TransportError::Cancelled { .. } => ErrorKind::Unknown,
                TransportError::RetryableStatus(_) => ErrorKind::HttpError,
            };
        }
        if cause.is::<ApiError>() {
            return ErrorKind::HttpError;
        }
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            if e.is_timeout() {
                return ErrorKind::Timeout;
            }
            structural |= e.is_connect() || e.is_request() || e.is_builder() || e.is_body();
        }
        if let Some(e) = cause.downcast_ref::<io::Error>() {
            if let Some(kind) = classify_io_kind(e.kind()) {
                return kind;
            }
            structural = true;
        }
        if cause.is::<url::ParseError>() {
            structural = true;
        }
    }

    if structural {
        ErrorKind::TemporaryFailure
    } else {
        ErrorKind::Unknown
    }
}

/// Convenience wrapper for `anyhow` errors.
pub fn classify_anyhow(err: &anyhow::Error) -> ErrorKind {
    classify(err.as_ref())
}

fn classify_io_kind(kind: io::ErrorKind) -> Option<ErrorKind> {
    match kind {
        io::ErrorKind::ConnectionRefused => Some(ErrorKind::ConnectionRefused),
        io::ErrorKind::TimedOut => Some(ErrorKind::Timeout),
        io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => {
            Some(ErrorKind::NetworkUnreachable)
        }
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Some(ErrorKind::ConnectionReset),
        _ => None,
    }
}

/// Decides whether an error is worth another attempt under `policy`.
pub fn is_retryable(err: &(dyn StdError + 'static), policy: &RetryPolicy) -> bool {
    let message = chain_message(err);
    match classify(err) {
        ErrorKind::ConnectionRefused
        | ErrorKind::Timeout
        | ErrorKind::NetworkUnreachable
        | ErrorKind::ConnectionReset
        | ErrorKind::TemporaryFailure => true,
        ErrorKind::DnsResolution => message.contains("temporary"),
        ErrorKind::Unknown | ErrorKind::HttpError => policy
            .retryable_error_substrings()
            .iter()
            .any(|needle| message.contains(&needle.to_lowercase())),
    }
}

/// Set membership against the policy's retryable status codes.
pub fn is_retryable_status(code: u16, policy: &RetryPolicy) -> bool {
    policy.retryable_status_codes().contains(&code)
}

fn chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

/// Lowercased messages of every error in the chain, joined.
fn chain_message(err: &(dyn StdError + 'static)) -> String {
    chain(err)
        .map(|e| e.to_string().to_lowercase())
        .collect::<Vec<_>>()
        .join(": ")
}
