//! Data model as it travels over the wire
//!
//! The server persists these entities relationally; clients receive them in
//! this shape. Key material and ciphertext are opaque byte strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ids::{EnvelopeId, GroupId, UserId};

// ---------------------------------------------------------------------------
// Key directory
// ---------------------------------------------------------------------------

/// Medium-lived pre-key, signed by the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// Client-chosen key id
    pub key_id: u32,
    /// Public key bytes
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    /// Signature over `public_key` by the identity key
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Single-use pre-key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    /// Client-chosen key id, unique within one upload
    pub key_id: u32,
    /// Public key bytes
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
}

/// Bundle handed to a session initiator.
///
/// `pre_key` is `None` once the owner's one-time pool is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Owner of the bundle
    pub user_id: UserId,
    /// Owner's registration id
    pub registration_id: u32,
    /// Long-term identity public key
    #[serde(with = "serde_bytes")]
    pub identity_key: Vec<u8>,
    /// Current signed pre-key
    pub signed_pre_key: SignedPreKey,
    /// One consumed one-time pre-key, if any were left
    pub pre_key: Option<OneTimePreKey>,
}

/// Read-only replenishment report for a bundle owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleHealth {
    /// Whether a bundle has ever been uploaded
    pub has_bundle: bool,
    /// One-time pre-keys still in the pool
    pub remaining_one_time_keys: u32,
    /// Threshold below which the owner should upload more
    pub low_water_mark: u32,
    /// `remaining_one_time_keys < low_water_mark`
    pub needs_replenish: bool,
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Lifecycle status of an envelope.
///
/// `Sent -> Delivered -> Read`, or `Expired` from any state. `Expired` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    /// Stored, not yet handed to the recipient's transport
    Sent,
    /// Handed to the recipient's transport
    Delivered,
    /// Acknowledged as read by the recipient
    Read,
    /// Ciphertext destroyed
    Expired,
}

impl EnvelopeStatus {
    /// Stable string form, as persisted
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeStatus::Sent => "sent",
            EnvelopeStatus::Delivered => "delivered",
            EnvelopeStatus::Read => "read",
            EnvelopeStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(EnvelopeStatus::Sent),
            "delivered" => Ok(EnvelopeStatus::Delivered),
            "read" => Ok(EnvelopeStatus::Read),
            "expired" => Ok(EnvelopeStatus::Expired),
            other => Err(format!("unknown envelope status '{other}'")),
        }
    }
}

/// Variant-specific part of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// 1:1 message
    Direct {
        /// The single recipient
        recipient_id: UserId,
    },
    /// Group broadcast encrypted under the sender's sender key
    Group {
        /// Target group
        group_id: GroupId,
        /// Group epoch at the time of sending
        epoch: u32,
        /// Sender key id used for encryption
        sender_key_id: u32,
        /// Chain iteration of the sender key
        iteration: u32,
        /// Initialisation vector
        #[serde(with = "serde_bytes")]
        iv: Vec<u8>,
    },
    /// Server-authored roster change in a group stream
    System {
        /// Group whose roster changed
        group_id: GroupId,
        /// Epoch after the change
        epoch: u32,
        /// What happened
        event: RosterEvent,
    },
}

impl EnvelopeKind {
    /// Stable string form, as persisted
    pub fn tag(&self) -> &'static str {
        match self {
            EnvelopeKind::Direct { .. } => "direct",
            EnvelopeKind::Group { .. } => "group",
            EnvelopeKind::System { .. } => "system",
        }
    }

    /// Group the envelope belongs to, if any
    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            EnvelopeKind::Direct { .. } => None,
            EnvelopeKind::Group { group_id, .. } | EnvelopeKind::System { group_id, .. } => {
                Some(group_id)
            }
        }
    }
}

/// A stored message envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Store-allocated id; also the position in a group stream
    pub id: EnvelopeId,
    /// Author (for system envelopes: the member who caused the change)
    pub sender_id: UserId,
    /// Variant-specific fields
    pub kind: EnvelopeKind,
    /// Opaque ciphertext; `None` after destruction and for system envelopes
    #[serde(with = "serde_bytes")]
    pub ciphertext: Option<Vec<u8>>,
    /// Caller-defined content-type tag
    pub content_type: String,
    /// Optional client session identifier
    pub session_id: Option<String>,
    /// Ephemeral timer in seconds; 0 means none
    pub ephemeral_timer: u32,
    /// Absolute expiry (unix seconds)
    pub expires_at: Option<i64>,
    /// Envelope this one replies to
    pub reply_to: Option<EnvelopeId>,
    /// Lifecycle status
    pub status: EnvelopeStatus,
    /// Submission time (unix seconds)
    pub sent_at: i64,
    /// Hand-off time to the recipient's transport
    pub delivered_at: Option<i64>,
    /// Read acknowledgement time
    pub read_at: Option<i64>,
    /// Destruction time
    pub destroyed_at: Option<i64>,
}

impl Envelope {
    /// An envelope carrying a timer or an expiry may be destroyed.
    pub fn is_destructible(&self) -> bool {
        self.ephemeral_timer > 0 || self.expires_at.is_some()
    }

    /// Earliest time at which a sweeper should destroy this envelope.
    ///
    /// An explicit expiry wins. Otherwise the timer runs from the read
    /// acknowledgement for direct envelopes and from submission for group
    /// envelopes. `None` if not destructible, already expired, or a direct
    /// envelope that has not been read yet.
    pub fn destroy_due_at(&self) -> Option<i64> {
        if self.status == EnvelopeStatus::Expired {
            return None;
        }
        if let Some(at) = self.expires_at {
            return Some(at);
        }
        if self.ephemeral_timer == 0 {
            return None;
        }
        let timer = i64::from(self.ephemeral_timer);
        match self.kind {
            EnvelopeKind::Direct { .. } => self.read_at.map(|read| read + timer),
            _ => Some(self.sent_at + timer),
        }
    }
}

/// One entry returned by a pending-delivery drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEnvelope {
    /// Envelope id
    pub envelope_id: EnvelopeId,
    /// Author
    pub sender_id: UserId,
    /// Opaque ciphertext; `None` if destroyed before hand-off
    #[serde(with = "serde_bytes")]
    pub ciphertext: Option<Vec<u8>>,
    /// Content-type tag
    pub content_type: String,
    /// Optional client session identifier
    pub session_id: Option<String>,
    /// Ephemeral timer in seconds; 0 means none
    pub ephemeral_timer: u32,
    /// Absolute expiry
    pub expires_at: Option<i64>,
    /// Envelope this one replies to
    pub reply_to: Option<EnvelopeId>,
    /// Submission time
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// Roster change recorded in a group stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RosterEvent {
    /// Group created with its initial roster
    GroupCreated {
        /// Creator, always the first admin
        creator_id: UserId,
        /// Every initial member including the creator
        members: Vec<UserId>,
    },
    /// A member was added by an admin
    MemberAdded {
        /// New member
        member_id: UserId,
        /// Admin who added them
        added_by: UserId,
        /// Whether the member joined as admin
        admin: bool,
    },
    /// A member was removed by an admin
    MemberRemoved {
        /// Removed member
        member_id: UserId,
        /// Admin who removed them
        removed_by: UserId,
    },
    /// A member left on their own
    MemberLeft {
        /// Departed member
        member_id: UserId,
    },
    /// Admin flag changed
    AdminChanged {
        /// Affected member
        member_id: UserId,
        /// New admin flag
        admin: bool,
        /// Admin who made the change
        changed_by: UserId,
    },
    /// Posting policy changed
    PostingPolicyChanged {
        /// New policy
        only_admins_post: bool,
        /// Admin who made the change
        changed_by: UserId,
    },
}

impl RosterEvent {
    /// Membership changes rotate the group epoch; metadata changes do not.
    pub fn changes_membership(&self) -> bool {
        matches!(
            self,
            RosterEvent::GroupCreated { .. }
                | RosterEvent::MemberAdded { .. }
                | RosterEvent::MemberRemoved { .. }
                | RosterEvent::MemberLeft { .. }
        )
    }
}

/// Group metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Group id
    pub group_id: GroupId,
    /// Display name
    pub name: String,
    /// Optional description
    pub description: Option<String>,
    /// Creator
    pub creator_id: UserId,
    /// Current sender-key epoch
    pub epoch: u32,
    /// Posting policy
    pub only_admins_post: bool,
    /// Creation time
    pub created_at: i64,
}

/// Active member of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Member
    pub user_id: UserId,
    /// Admin flag
    pub is_admin: bool,
    /// Who added them (`None` for the creator)
    pub invited_by: Option<UserId>,
    /// Join time
    pub joined_at: i64,
}

/// Sender key encrypted pairwise for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    /// Group
    pub group_id: GroupId,
    /// Owner of the sender key
    pub sender_id: UserId,
    /// Member the blob is encrypted for
    pub recipient_id: UserId,
    /// Epoch the key belongs to
    pub epoch: u32,
    /// Opaque pairwise-encrypted key blob
    #[serde(with = "serde_bytes")]
    pub encrypted_key: Vec<u8>,
    /// Pairwise message type of the blob
    pub message_type: u8,
    /// Last (re)send time
    pub updated_at: i64,
}
