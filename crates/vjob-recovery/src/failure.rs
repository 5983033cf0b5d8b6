//! Raw failure returned by job handlers and upstream calls.

use std::time::Duration;

use thiserror::Error;

use crate::classify::{classify, ErrorKind};

/// A handler or upstream failure.
///
/// An explicit `kind` wins over heuristics; otherwise the classifier runs on
/// the status code and message.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct JobFailure {
    pub message: String,
    pub status: Option<u16>,
    pub kind: Option<ErrorKind>,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            kind: None,
        }
    }

    /// Failure with a known classification.
    pub fn classified(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            kind: Some(kind),
        }
    }

    /// Failure derived from an HTTP response status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
            kind: None,
        }
    }

    /// The execution did not finish within `limit`.
    pub fn timeout(limit: Duration) -> Self {
        Self::classified(
            ErrorKind::Timeout,
            format!("handler timed out after {:?}", limit),
        )
    }

    /// Resolved classification.
    pub fn kind(&self) -> ErrorKind {
        self.kind
            .unwrap_or_else(|| classify(&self.message, self.status))
    }
}

impl From<String> for JobFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for JobFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
