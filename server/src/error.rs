//! Core error type
//!
//! Every storage-backed operation returns [`CoreError`]. The transport maps it
//! onto the wire taxonomy through [`CoreError::kind`].

use cipherpost_shared::{ErrorKind, GroupId, UserId, WireError};
use thiserror::Error;

/// SQLite primary and extended result codes that mean "someone else holds the lock".
const SQLITE_CONTENTION_CODES: &[&str] = &["5", "6", "261", "262", "517"];

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("user {0} has not published a pre-key bundle")]
    NoBundle(UserId),

    #[error("not an active member of group {0}")]
    NotAMember(GroupId),

    #[error("only admins may post in group {0}")]
    PostingRestricted(GroupId),

    #[error("{0}")]
    Permission(String),

    #[error("{0}")]
    AlreadyUsed(String),

    #[error("{0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(#[source] sqlx::Error),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn validation(detail: impl Into<String>) -> Self {
        CoreError::Validation(detail.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CoreError::NotFound(what.into())
    }

    pub fn permission(detail: impl Into<String>) -> Self {
        CoreError::Permission(detail.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::NoBundle(_) => ErrorKind::NoBundle,
            CoreError::NotAMember(_)
            | CoreError::PostingRestricted(_)
            | CoreError::Permission(_) => ErrorKind::Permission,
            CoreError::AlreadyUsed(_) => ErrorKind::AlreadyUsed,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::Storage(_) => ErrorKind::Internal,
        }
    }

    /// Wire form. Storage faults get a generic detail so SQL never leaks to
    /// clients; the full error is logged by the transport.
    pub fn to_wire(&self) -> WireError {
        match self {
            CoreError::Storage(_) => WireError::new(ErrorKind::Internal, "Request failed"),
            other => WireError::new(other.kind(), other.to_string()),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if let Some(code) = db_err.code() {
                if SQLITE_CONTENTION_CODES.contains(&code.as_ref()) {
                    return CoreError::Conflict(format!(
                        "concurrent update in progress, retry: {}",
                        db_err.message()
                    ));
                }
            }
        }
        CoreError::Storage(err)
    }
}
