//! Identifier newtypes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Envelope identifiers are allocated by the store and strictly increase.
pub type EnvelopeId = i64;

/// A user, identified by the hex form of their authenticated Ed25519 key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Derive the user id for an Ed25519 public key
    pub fn from_pubkey(pubkey: &[u8]) -> Self {
        Self(hex::encode(pubkey))
    }

    /// Borrow the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines: at most the first 16 characters
    pub fn short(&self) -> &str {
        short(&self.0)
    }
}

/// A group, identified by a client-chosen string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    /// Borrow the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines: at most the first 16 characters
    pub fn short(&self) -> &str {
        short(&self.0)
    }
}

fn short(s: &str) -> &str {
    match s.char_indices().nth(16) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

macro_rules! impl_id {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $ty {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

impl_id!(UserId);
impl_id!(GroupId);
