//! Request/response frames
//!
//! Frames are MessagePack-encoded (`rmp_serde::to_vec_named`). A client sends
//! [`ClientFrame`]s; the server answers each with a [`ServerFrame::Reply`]
//! carrying the same `id`. The caller's identity is never part of a request:
//! it is fixed by the authentication handshake of the connection.

use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::ids::{EnvelopeId, GroupId, UserId};
use crate::model::{
    BundleHealth, Envelope, GroupInfo, MemberInfo, OneTimePreKey, PendingEnvelope, PreKeyBundle,
    SenderKeyRecord, SignedPreKey,
};

/// Client to server frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Correlation id echoed in the reply
    pub id: u64,
    /// The request
    pub request: Request,
}

/// Every operation a client can invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Answer the connection's authentication challenge
    Auth {
        /// Ed25519 public key
        #[serde(with = "serde_bytes")]
        pubkey: Vec<u8>,
        /// Signature over the challenge
        #[serde(with = "serde_bytes")]
        signature: Vec<u8>,
    },
    /// Liveness check
    Ping,

    // -- Key directory ------------------------------------------------------
    /// Replace the caller's pre-key bundle
    UploadBundle {
        /// Long-term identity public key
        #[serde(with = "serde_bytes")]
        identity_key: Vec<u8>,
        /// Signed pre-key
        signed_pre_key: SignedPreKey,
        /// Fresh one-time pre-key pool
        one_time_pre_keys: Vec<OneTimePreKey>,
        /// Registration id
        registration_id: u32,
    },
    /// Fetch another user's bundle, consuming one one-time pre-key
    FetchBundle {
        /// Bundle owner
        user_id: UserId,
    },
    /// Report the caller's own bundle health
    CheckBundleHealth,

    // -- Envelopes and delivery ---------------------------------------------
    /// Submit a 1:1 envelope
    SendDirect {
        /// Recipient
        recipient_id: UserId,
        /// Opaque ciphertext
        #[serde(with = "serde_bytes")]
        ciphertext: Vec<u8>,
        /// Content-type tag
        content_type: String,
        /// Optional client session id
        #[serde(default)]
        session_id: Option<String>,
        /// Ephemeral timer in seconds
        #[serde(default)]
        ephemeral_timer: Option<u32>,
        /// Absolute expiry
        #[serde(default)]
        expires_at: Option<i64>,
        /// Envelope being replied to
        #[serde(default)]
        reply_to: Option<EnvelopeId>,
    },
    /// Drain the caller's pending deliveries
    PollPending {
        /// Batch size, at most [`crate::MAX_POLL_BATCH`]
        limit: u32,
    },
    /// Acknowledge a direct envelope as read
    MarkRead {
        /// Envelope
        envelope_id: EnvelopeId,
    },
    /// Destroy an ephemeral envelope
    Destroy {
        /// Envelope
        envelope_id: EnvelopeId,
    },
    /// View an envelope the caller can see
    GetEnvelope {
        /// Envelope
        envelope_id: EnvelopeId,
    },

    // -- Groups -------------------------------------------------------------
    /// Create a group with the caller as creator and first admin
    CreateGroup {
        /// Client-chosen group id
        group_id: GroupId,
        /// Display name
        name: String,
        /// Initial members besides the caller
        member_ids: Vec<UserId>,
        /// Optional description
        #[serde(default)]
        description: Option<String>,
        /// Posting policy
        #[serde(default)]
        only_admins_post: bool,
    },
    /// Add a member (admin only)
    AddMember {
        /// Group
        group_id: GroupId,
        /// New member
        user_id: UserId,
        /// Join as admin
        #[serde(default)]
        admin: bool,
    },
    /// Remove a member (admin only, never the creator)
    RemoveMember {
        /// Group
        group_id: GroupId,
        /// Member to remove
        user_id: UserId,
    },
    /// Leave a group
    LeaveGroup {
        /// Group
        group_id: GroupId,
    },
    /// Grant or revoke admin (admin only)
    SetAdmin {
        /// Group
        group_id: GroupId,
        /// Member
        user_id: UserId,
        /// New admin flag
        admin: bool,
    },
    /// Change the posting policy (admin only)
    SetPostingPolicy {
        /// Group
        group_id: GroupId,
        /// New policy
        only_admins_post: bool,
    },
    /// Read group metadata (members only)
    GetGroup {
        /// Group
        group_id: GroupId,
    },
    /// List active members
    ListMembers {
        /// Group
        group_id: GroupId,
    },
    /// Store the caller's sender key encrypted for one recipient
    DistributeSenderKey {
        /// Group
        group_id: GroupId,
        /// Recipient member
        recipient_id: UserId,
        /// Opaque pairwise-encrypted key
        #[serde(with = "serde_bytes")]
        encrypted_key: Vec<u8>,
        /// Pairwise message type
        message_type: u8,
        /// Epoch the key belongs to
        epoch: u32,
    },
    /// Fetch current-epoch sender keys addressed to the caller
    FetchSenderKeys {
        /// Group
        group_id: GroupId,
    },
    /// Members still missing the caller's current-epoch sender key
    DesynchronizedMembers {
        /// Group
        group_id: GroupId,
    },
    /// Post to a group stream
    SendGroupMessage {
        /// Group
        group_id: GroupId,
        /// Opaque ciphertext
        #[serde(with = "serde_bytes")]
        ciphertext: Vec<u8>,
        /// Sender key id
        sender_key_id: u32,
        /// Chain iteration
        iteration: u32,
        /// Initialisation vector
        #[serde(with = "serde_bytes")]
        iv: Vec<u8>,
        /// Content-type tag
        content_type: String,
        /// Ephemeral timer in seconds
        #[serde(default)]
        ephemeral_timer: Option<u32>,
        /// Absolute expiry
        #[serde(default)]
        expires_at: Option<i64>,
        /// Envelope being replied to
        #[serde(default)]
        reply_to: Option<EnvelopeId>,
    },
    /// Page through a group stream
    ReadGroupStream {
        /// Group
        group_id: GroupId,
        /// Return envelopes with id greater than this
        #[serde(default)]
        after_id: EnvelopeId,
        /// Page size
        limit: u32,
    },

    // -- Device linking -----------------------------------------------------
    /// Issue a one-time device link code
    IssueDeviceCode,
    /// Redeem a device link code
    RedeemDeviceCode {
        /// Code as issued
        code: String,
    },
}

impl Request {
    /// Stable request name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Request::Auth { .. } => "auth",
            Request::Ping => "ping",
            Request::UploadBundle { .. } => "upload_bundle",
            Request::FetchBundle { .. } => "fetch_bundle",
            Request::CheckBundleHealth => "check_bundle_health",
            Request::SendDirect { .. } => "send_direct",
            Request::PollPending { .. } => "poll_pending",
            Request::MarkRead { .. } => "mark_read",
            Request::Destroy { .. } => "destroy",
            Request::GetEnvelope { .. } => "get_envelope",
            Request::CreateGroup { .. } => "create_group",
            Request::AddMember { .. } => "add_member",
            Request::RemoveMember { .. } => "remove_member",
            Request::LeaveGroup { .. } => "leave_group",
            Request::SetAdmin { .. } => "set_admin",
            Request::SetPostingPolicy { .. } => "set_posting_policy",
            Request::GetGroup { .. } => "get_group",
            Request::ListMembers { .. } => "list_members",
            Request::DistributeSenderKey { .. } => "distribute_sender_key",
            Request::FetchSenderKeys { .. } => "fetch_sender_keys",
            Request::DesynchronizedMembers { .. } => "desynchronized_members",
            Request::SendGroupMessage { .. } => "send_group_message",
            Request::ReadGroupStream { .. } => "read_group_stream",
            Request::IssueDeviceCode => "issue_device_code",
            Request::RedeemDeviceCode { .. } => "redeem_device_code",
        }
    }
}

/// Successful results, one per request type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Handshake accepted
    AuthSuccess {
        /// Caller identity for the rest of the connection
        user_id: UserId,
        /// Deliveries waiting in the queue
        pending: i64,
    },
    /// Reply to [`Request::Ping`]
    Pong,
    /// Bundle replaced
    BundleStored {
        /// One-time keys now in the pool
        stored_count: u32,
    },
    /// Fetched bundle
    Bundle {
        /// The bundle
        bundle: PreKeyBundle,
    },
    /// Bundle health report
    BundleHealth {
        /// The report
        health: BundleHealth,
    },
    /// Direct envelope accepted
    Sent {
        /// New envelope id
        envelope_id: EnvelopeId,
        /// Submission time
        sent_at: i64,
    },
    /// Drained deliveries, oldest first
    Pending {
        /// Envelopes now marked delivered
        envelopes: Vec<PendingEnvelope>,
    },
    /// Read acknowledgement result
    ReadMarked {
        /// `false` if the envelope was already read
        changed: bool,
    },
    /// Destroy result
    Destroyed {
        /// `false` if it was already destroyed
        destroyed: bool,
    },
    /// Envelope view
    Envelope {
        /// The envelope
        envelope: Envelope,
    },
    /// Group created
    GroupCreated {
        /// Group id
        group_id: GroupId,
    },
    /// Roster or policy change committed
    GroupUpdated {
        /// Group id
        group_id: GroupId,
        /// Epoch after the change
        epoch: u32,
    },
    /// Group metadata
    Group {
        /// The group
        group: GroupInfo,
    },
    /// Active members
    Members {
        /// Group id
        group_id: GroupId,
        /// Members
        members: Vec<MemberInfo>,
    },
    /// Sender key stored
    SenderKeyStored {
        /// Always `true`
        ok: bool,
    },
    /// Current-epoch sender keys for the caller
    SenderKeys {
        /// Records
        records: Vec<SenderKeyRecord>,
    },
    /// Members lacking the caller's current-epoch key
    Desynchronized {
        /// Group id
        group_id: GroupId,
        /// Current epoch
        epoch: u32,
        /// Members needing a (re)distribution
        members: Vec<UserId>,
    },
    /// Group message accepted
    GroupMessageSent {
        /// Stream position
        message_id: EnvelopeId,
        /// Submission time
        sent_at: i64,
    },
    /// Page of a group stream
    GroupStream {
        /// Group id
        group_id: GroupId,
        /// Envelopes in stream order
        messages: Vec<Envelope>,
    },
    /// Device code issued
    DeviceCode {
        /// The code
        code: String,
        /// Expiry time
        expires_at: i64,
    },
    /// Device code redeemed
    DeviceLinked {
        /// User who issued the code
        user_id: UserId,
    },
}

/// Result carried by a reply frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Success
    Ok(Response),
    /// Failure
    Err(WireError),
}

/// Unsolicited, payload-free hints to an online client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum Notice {
    /// New deliveries are waiting; poll to receive them
    PendingDeliveries,
    /// A group roster changed; re-read the stream and redistribute keys
    RosterChanged {
        /// Group
        group_id: GroupId,
        /// New epoch
        epoch: u32,
    },
}

/// Server to client frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Sent once per connection before anything else
    AuthChallenge {
        /// Random nonce to sign
        #[serde(with = "serde_bytes")]
        nonce: Vec<u8>,
    },
    /// Answer to a [`ClientFrame`]
    Reply {
        /// Correlation id
        id: u64,
        /// Result
        outcome: Outcome,
    },
    /// Unsolicited hint
    Notice {
        /// The hint
        notice: Notice,
    },
}
