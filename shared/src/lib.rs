//! Cipherpost wire protocol
//!
//! This crate holds everything a Cipherpost server and its clients must agree
//! on: typed request/response frames, the envelope and roster data model as it
//! travels over the wire, and the stable error taxonomy.
//!
//! Payload fields (`ciphertext`, `encrypted_key`, pre-key material) are opaque
//! byte strings. Nothing in this crate interprets them.

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod error;
pub mod ids;
pub mod model;
pub mod protocol;

pub use error::{ErrorKind, WireError};
pub use ids::{EnvelopeId, GroupId, UserId};
pub use model::{
    BundleHealth, Envelope, EnvelopeKind, EnvelopeStatus, GroupInfo, MemberInfo, OneTimePreKey,
    PendingEnvelope, PreKeyBundle, RosterEvent, SenderKeyRecord, SignedPreKey,
};
pub use protocol::{ClientFrame, Notice, Outcome, Request, Response, ServerFrame};

use subtle::ConstantTimeEq;

/// Version of the wire protocol
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on the batch size of a single pending-delivery poll
pub const MAX_POLL_BATCH: u32 = 50;

/// Constant-time comparison of byte arrays
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
