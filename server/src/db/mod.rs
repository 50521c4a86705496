//! Storage abstraction
//!
//! `DatabaseBackend` is the seam between the transport and the store. Every
//! method is one atomic operation; implementations must not cache mutable
//! key or queue state in memory.

pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use cipherpost_shared::{
    BundleHealth, Envelope, EnvelopeId, GroupId, GroupInfo, MemberInfo, OneTimePreKey,
    PendingEnvelope, PreKeyBundle, SenderKeyRecord, SignedPreKey, UserId,
};

use crate::database::BrokerStats;
use crate::envelopes::{GroupCipher, Payload};
use crate::error::CoreResult;
use crate::groups::RosterUpdate;

#[async_trait]
pub trait DatabaseBackend: Send + Sync + 'static {
    // ── Housekeeping ─────────────────────────────────────────────────────
    async fn run_migrations(&self) -> Result<()>;
    async fn checkpoint(&self) -> Result<()>;

    async fn broker_stats(&self) -> CoreResult<BrokerStats>;

    // ── Users ────────────────────────────────────────────────────────────
    async fn store_user(&self, user: &UserId, identity_pubkey: Option<&[u8]>) -> CoreResult<()>;

    // ── Key directory ────────────────────────────────────────────────────
    async fn upload_bundle(
        &self, user: &UserId, identity_key: &[u8], signed_pre_key: &SignedPreKey,
        one_time_pre_keys: &[OneTimePreKey], registration_id: u32,
        max_one_time_pre_keys: usize,
    ) -> CoreResult<u32>;

    async fn fetch_bundle(&self, owner: &UserId) -> CoreResult<PreKeyBundle>;

    async fn check_bundle_health(
        &self, owner: &UserId, low_water_mark: u32,
    ) -> CoreResult<BundleHealth>;

    // ── Envelopes ────────────────────────────────────────────────────────
    async fn submit_direct(
        &self, sender: &UserId, recipient: &UserId, payload: &Payload,
    ) -> CoreResult<(EnvelopeId, i64)>;

    async fn mark_read(&self, envelope_id: EnvelopeId, reader: &UserId) -> CoreResult<bool>;

    async fn destroy(
        &self, envelope_id: EnvelopeId, actor: Option<&UserId>,
    ) -> CoreResult<bool>;

    async fn is_destructible(&self, envelope_id: EnvelopeId) -> CoreResult<bool>;

    async fn get_envelope(&self, envelope_id: EnvelopeId, caller: &UserId) -> CoreResult<Envelope>;

    async fn due_for_destruction(&self, now: i64, limit: u32) -> CoreResult<Vec<EnvelopeId>>;

    async fn sweep_due(&self, now: i64, batch: u32) -> CoreResult<u64>;

    // ── Delivery queue ───────────────────────────────────────────────────
    async fn drain_and_mark(
        &self, recipient: &UserId, limit: u32,
    ) -> CoreResult<Vec<PendingEnvelope>>;

    async fn pending_count(&self, recipient: &UserId) -> CoreResult<i64>;
    async fn purge_delivered(&self, older_than: i64) -> CoreResult<u64>;

    // ── Groups ───────────────────────────────────────────────────────────
    async fn create_group(
        &self, group_id: &GroupId, name: &str, creator: &UserId, member_ids: &[UserId],
        description: Option<&str>, only_admins_post: bool,
    ) -> CoreResult<RosterUpdate>;

    async fn add_member(
        &self, group_id: &GroupId, caller: &UserId, user: &UserId, admin: bool,
    ) -> CoreResult<RosterUpdate>;

    async fn remove_member(
        &self, group_id: &GroupId, caller: &UserId, user: &UserId,
    ) -> CoreResult<RosterUpdate>;

    async fn leave_group(&self, group_id: &GroupId, user: &UserId) -> CoreResult<RosterUpdate>;

    async fn set_admin(
        &self, group_id: &GroupId, caller: &UserId, user: &UserId, admin: bool,
    ) -> CoreResult<RosterUpdate>;

    async fn set_posting_policy(
        &self, group_id: &GroupId, caller: &UserId, only_admins_post: bool,
    ) -> CoreResult<RosterUpdate>;

    async fn get_group(&self, group_id: &GroupId, caller: &UserId) -> CoreResult<GroupInfo>;

    async fn list_members(
        &self, group_id: &GroupId, caller: &UserId,
    ) -> CoreResult<Vec<MemberInfo>>;

    // ── Sender keys ──────────────────────────────────────────────────────
    async fn distribute_sender_key(
        &self, group_id: &GroupId, sender: &UserId, recipient: &UserId,
        encrypted_key: &[u8], message_type: u8, epoch: u32,
    ) -> CoreResult<()>;

    async fn fetch_sender_keys(
        &self, group_id: &GroupId, recipient: &UserId,
    ) -> CoreResult<Vec<SenderKeyRecord>>;

    async fn desynchronized_members(
        &self, group_id: &GroupId, sender: &UserId,
    ) -> CoreResult<(u32, Vec<UserId>)>;

    // ── Group stream ─────────────────────────────────────────────────────
    async fn send_group_message(
        &self, group_id: &GroupId, sender: &UserId, cipher: &GroupCipher, payload: &Payload,
    ) -> CoreResult<(EnvelopeId, i64)>;

    async fn read_group_stream(
        &self, group_id: &GroupId, reader: &UserId, after_id: EnvelopeId, limit: u32,
    ) -> CoreResult<Vec<Envelope>>;

    // ── Device link codes ────────────────────────────────────────────────
    async fn issue_device_code(
        &self, user: &UserId, ttl_seconds: i64,
    ) -> CoreResult<(String, i64)>;

    async fn redeem_device_code(&self, code: &str, redeemer: &UserId) -> CoreResult<UserId>;
}
