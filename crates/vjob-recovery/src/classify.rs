//! Failure classification.
//!
//! Maps a raw failure (message plus optional HTTP status) to exactly one
//! [`ErrorKind`]. Predicates run in a fixed order:
//!
//! 1. network indicators in the message
//! 2. the HTTP status code, when one is known
//! 3. message indicators for timeout, rate limit, quota, auth, validation,
//!    server error
//!
//! Anything left over is `Unknown`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Network,
    RateLimit,
    Auth,
    Validation,
    ServerError,
    Timeout,
    QuotaExceeded,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::Network,
        ErrorKind::RateLimit,
        ErrorKind::Auth,
        ErrorKind::Validation,
        ErrorKind::ServerError,
        ErrorKind::Timeout,
        ErrorKind::QuotaExceeded,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::RateLimit => "rateLimit",
            ErrorKind::Auth => "auth",
            ErrorKind::Validation => "validation",
            ErrorKind::ServerError => "serverError",
            ErrorKind::Timeout => "timeout",
            ErrorKind::QuotaExceeded => "quotaExceeded",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Auth and validation failures never succeed on retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::Auth | ErrorKind::Validation)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const NETWORK_PATTERNS: &[&str] = &[
    "econnrefused",
    "econnreset",
    "enotfound",
    "ehostunreach",
    "enetunreach",
    "connection refused",
    "connection reset",
    "connection closed",
    "connection aborted",
    "broken pipe",
    "socket hang up",
    "dns error",
    "fetch failed",
    "network",
];

const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout", "etimedout", "deadline exceeded"];

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "ratelimit",
    "rate_limit",
    "too many requests",
    "resource_exhausted",
];

const QUOTA_PATTERNS: &[&str] = &[
    "quota",
    "insufficient credits",
    "insufficient_quota",
    "billing",
];

const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "forbidden",
    "permission denied",
    "invalid api key",
    "api key not valid",
    "authentication",
];

const VALIDATION_PATTERNS: &[&str] = &[
    "invalid",
    "validation",
    "bad request",
    "malformed",
    "unprocessable",
    "missing required",
];

const SERVER_PATTERNS: &[&str] = &[
    "internal server error",
    "service unavailable",
    "bad gateway",
    "server error",
    "overloaded",
    "upstream error",
];

fn kind_for_status(status: u16) -> Option<ErrorKind> {
    match status {
        408 | 504 => Some(ErrorKind::Timeout),
        429 => Some(ErrorKind::RateLimit),
        402 => Some(ErrorKind::QuotaExceeded),
        401 | 403 => Some(ErrorKind::Auth),
        400 | 404 | 422 => Some(ErrorKind::Validation),
        500..=599 => Some(ErrorKind::ServerError),
        _ => None,
    }
}

fn contains_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

/// Classify a failure message with an optional HTTP status code.
pub fn classify(message: &str, status: Option<u16>) -> ErrorKind {
    let msg = message.to_lowercase();

    if contains_any(&msg, NETWORK_PATTERNS) {
        return ErrorKind::Network;
    }

    if let Some(kind) = status.and_then(kind_for_status) {
        return kind;
    }

    let ordered: [(ErrorKind, &[&str]); 6] = [
        (ErrorKind::Timeout, TIMEOUT_PATTERNS),
        (ErrorKind::RateLimit, RATE_LIMIT_PATTERNS),
        (ErrorKind::QuotaExceeded, QUOTA_PATTERNS),
        (ErrorKind::Auth, AUTH_PATTERNS),
        (ErrorKind::Validation, VALIDATION_PATTERNS),
        (ErrorKind::ServerError, SERVER_PATTERNS),
    ];

    ordered
        .iter()
        .find(|(_, patterns)| contains_any(&msg, patterns))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

/// Classify any error by its message and the messages of its source chain.
pub fn classify_error(err: &(dyn std::error::Error + 'static)) -> ErrorKind {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    classify(&message, None)
}
