//! Graceful degradation: turns a classified failure into an operating-mode hint.
//!
//! The evaluator is advisory. It never alters control flow and keeps no
//! memory between calls; callers decide what reduced functionality to offer.

use std::fmt;

use crate::http::{ErrorKind, classify_anyhow};

/// Reduced-functionality mode suggested by a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FallbackMode {
    /// Nothing to degrade; report the error as-is.
    #[default]
    None,
    /// The service cannot be reached at all.
    Offline,
    /// The service is reachable but slow.
    Limited,
    /// Connections are flaky; previously fetched data is the safe choice.
    Cached,
}

impl fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FallbackMode::None => "none",
            FallbackMode::Offline => "offline",
            FallbackMode::Limited => "limited",
            FallbackMode::Cached => "cached",
        };
        f.write_str(name)
    }
}

pub fn evaluate(kind: ErrorKind) -> FallbackMode {
    match kind {
        ErrorKind::ConnectionRefused | ErrorKind::NetworkUnreachable | ErrorKind::DnsResolution => {
            FallbackMode::Offline
        }
        ErrorKind::Timeout => FallbackMode::Limited,
        ErrorKind::ConnectionReset | ErrorKind::TemporaryFailure => FallbackMode::Cached,
        ErrorKind::Unknown | ErrorKind::HttpError => FallbackMode::None,
    }
}

/// Classifies `err` and maps the result.
pub fn evaluate_error(err: &anyhow::Error) -> FallbackMode {
    evaluate(classify_anyhow(err))
}

/// Fixed explanation of `mode` for the person at the terminal.
pub fn message(mode: FallbackMode) -> &'static str {
    match mode {
        FallbackMode::None => "The API server is working normally. No degradation needed.",
        FallbackMode::Offline => {
            "The API server is unreachable. Working offline: only local data is available."
        }
        FallbackMode::Limited => {
            "The API server is responding slowly. Some features may be unavailable."
        }
        FallbackMode::Cached => {
            "The connection to the API server is unstable. Showing cached data where possible."
        }
    }
}
