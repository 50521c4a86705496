//! Error taxonomy shared by server and clients

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable error kinds surfaced to callers.
///
/// The kind alone tells a caller whether to retry: only [`ErrorKind::Conflict`]
/// is transient. [`ErrorKind::AlreadyUsed`] is terminal but success-equivalent
/// for idempotent callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or malformed fields; fix and resubmit
    Validation,
    /// Unknown user, group or envelope
    NotFound,
    /// The target user never published a pre-key bundle
    NoBundle,
    /// Caller lacks the role or membership the operation requires
    Permission,
    /// The record was already consumed
    AlreadyUsed,
    /// A concurrent mutation won the race; safe to retry
    Conflict,
    /// Server-side fault that is none of the above
    Internal,
}

impl ErrorKind {
    /// Stable string form used in logs and over the wire
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::NoBundle => "no_bundle",
            ErrorKind::Permission => "permission",
            ErrorKind::AlreadyUsed => "already_used",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether repeating the same request may succeed
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Conflict)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure as delivered to a client
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct WireError {
    /// Machine-readable kind
    pub kind: ErrorKind,
    /// Human-readable detail
    pub detail: String,
}

impl WireError {
    /// Build an error of the given kind
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}
