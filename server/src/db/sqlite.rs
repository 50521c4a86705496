//! SQLite implementation of DatabaseBackend
//!
//! Thin delegation to the component modules, which take the pool directly.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Pool, Sqlite};

use cipherpost_shared::{
    BundleHealth, Envelope, EnvelopeId, GroupId, GroupInfo, MemberInfo, OneTimePreKey,
    PendingEnvelope, PreKeyBundle, SenderKeyRecord, SignedPreKey, UserId,
};

use super::DatabaseBackend;
use crate::database::BrokerStats;
use crate::envelopes::{GroupCipher, Payload};
use crate::error::CoreResult;
use crate::groups::RosterUpdate;
use crate::{database, delivery, device_codes, envelopes, groups, keys};

pub struct SqliteBackend {
    pool: Pool<Sqlite>,
}

impl SqliteBackend {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
    async fn run_migrations(&self) -> Result<()> {
        database::run_migrations(&self.pool).await
    }

    async fn checkpoint(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("WAL checkpoint failed")?;
        Ok(())
    }

    async fn broker_stats(&self) -> CoreResult<BrokerStats> {
        database::broker_stats(&self.pool).await
    }

    async fn store_user(&self, user: &UserId, identity_pubkey: Option<&[u8]>) -> CoreResult<()> {
        database::store_user(&self.pool, user, identity_pubkey).await
    }

    async fn upload_bundle(
        &self, user: &UserId, identity_key: &[u8], signed_pre_key: &SignedPreKey,
        one_time_pre_keys: &[OneTimePreKey], registration_id: u32,
        max_one_time_pre_keys: usize,
    ) -> CoreResult<u32> {
        keys::upload_bundle(
            &self.pool, user, identity_key, signed_pre_key,
            one_time_pre_keys, registration_id, max_one_time_pre_keys,
        ).await
    }

    async fn fetch_bundle(&self, owner: &UserId) -> CoreResult<PreKeyBundle> {
        keys::fetch_bundle(&self.pool, owner).await
    }

    async fn check_bundle_health(
        &self, owner: &UserId, low_water_mark: u32,
    ) -> CoreResult<BundleHealth> {
        keys::check_bundle_health(&self.pool, owner, low_water_mark).await
    }

    async fn submit_direct(
        &self, sender: &UserId, recipient: &UserId, payload: &Payload,
    ) -> CoreResult<(EnvelopeId, i64)> {
        envelopes::submit_direct(&self.pool, sender, recipient, payload).await
    }

    async fn mark_read(&self, envelope_id: EnvelopeId, reader: &UserId) -> CoreResult<bool> {
        envelopes::mark_read(&self.pool, envelope_id, reader).await
    }

    async fn destroy(
        &self, envelope_id: EnvelopeId, actor: Option<&UserId>,
    ) -> CoreResult<bool> {
        envelopes::destroy(&self.pool, envelope_id, actor).await
    }

    async fn is_destructible(&self, envelope_id: EnvelopeId) -> CoreResult<bool> {
        envelopes::is_destructible(&self.pool, envelope_id).await
    }

    async fn get_envelope(&self, envelope_id: EnvelopeId, caller: &UserId) -> CoreResult<Envelope> {
        envelopes::get_envelope(&self.pool, envelope_id, caller).await
    }

    async fn due_for_destruction(&self, now: i64, limit: u32) -> CoreResult<Vec<EnvelopeId>> {
        envelopes::due_for_destruction(&self.pool, now, limit).await
    }

    async fn sweep_due(&self, now: i64, batch: u32) -> CoreResult<u64> {
        envelopes::sweep_due(&self.pool, now, batch).await
    }

    async fn drain_and_mark(
        &self, recipient: &UserId, limit: u32,
    ) -> CoreResult<Vec<PendingEnvelope>> {
        delivery::drain_and_mark(&self.pool, recipient, limit).await
    }

    async fn pending_count(&self, recipient: &UserId) -> CoreResult<i64> {
        delivery::pending_count(&self.pool, recipient).await
    }

    async fn purge_delivered(&self, older_than: i64) -> CoreResult<u64> {
        delivery::purge_delivered(&self.pool, older_than).await
    }

    async fn create_group(
        &self, group_id: &GroupId, name: &str, creator: &UserId, member_ids: &[UserId],
        description: Option<&str>, only_admins_post: bool,
    ) -> CoreResult<RosterUpdate> {
        groups::create_group(
            &self.pool, group_id, name, creator, member_ids, description, only_admins_post,
        ).await
    }

    async fn add_member(
        &self, group_id: &GroupId, caller: &UserId, user: &UserId, admin: bool,
    ) -> CoreResult<RosterUpdate> {
        groups::add_member(&self.pool, group_id, caller, user, admin).await
    }

    async fn remove_member(
        &self, group_id: &GroupId, caller: &UserId, user: &UserId,
    ) -> CoreResult<RosterUpdate> {
        groups::remove_member(&self.pool, group_id, caller, user).await
    }

    async fn leave_group(&self, group_id: &GroupId, user: &UserId) -> CoreResult<RosterUpdate> {
        groups::leave_group(&self.pool, group_id, user).await
    }

    async fn set_admin(
        &self, group_id: &GroupId, caller: &UserId, user: &UserId, admin: bool,
    ) -> CoreResult<RosterUpdate> {
        groups::set_admin(&self.pool, group_id, caller, user, admin).await
    }

    async fn set_posting_policy(
        &self, group_id: &GroupId, caller: &UserId, only_admins_post: bool,
    ) -> CoreResult<RosterUpdate> {
        groups::set_posting_policy(&self.pool, group_id, caller, only_admins_post).await
    }

    async fn get_group(&self, group_id: &GroupId, caller: &UserId) -> CoreResult<GroupInfo> {
        groups::get_group(&self.pool, group_id, caller).await
    }

    async fn list_members(
        &self, group_id: &GroupId, caller: &UserId,
    ) -> CoreResult<Vec<MemberInfo>> {
        groups::list_members(&self.pool, group_id, caller).await
    }

    async fn distribute_sender_key(
        &self, group_id: &GroupId, sender: &UserId, recipient: &UserId,
        encrypted_key: &[u8], message_type: u8, epoch: u32,
    ) -> CoreResult<()> {
        groups::distribute_sender_key(
            &self.pool, group_id, sender, recipient, encrypted_key, message_type, epoch,
        ).await
    }

    async fn fetch_sender_keys(
        &self, group_id: &GroupId, recipient: &UserId,
    ) -> CoreResult<Vec<SenderKeyRecord>> {
        groups::fetch_sender_keys(&self.pool, group_id, recipient).await
    }

    async fn desynchronized_members(
        &self, group_id: &GroupId, sender: &UserId,
    ) -> CoreResult<(u32, Vec<UserId>)> {
        groups::desynchronized_members(&self.pool, group_id, sender).await
    }

    async fn send_group_message(
        &self, group_id: &GroupId, sender: &UserId, cipher: &GroupCipher, payload: &Payload,
    ) -> CoreResult<(EnvelopeId, i64)> {
        groups::send_group_message(&self.pool, group_id, sender, cipher, payload).await
    }

    async fn read_group_stream(
        &self, group_id: &GroupId, reader: &UserId, after_id: EnvelopeId, limit: u32,
    ) -> CoreResult<Vec<Envelope>> {
        groups::read_group_stream(&self.pool, group_id, reader, after_id, limit).await
    }

    async fn issue_device_code(
        &self, user: &UserId, ttl_seconds: i64,
    ) -> CoreResult<(String, i64)> {
        device_codes::issue(&self.pool, user, ttl_seconds).await
    }

    async fn redeem_device_code(&self, code: &str, redeemer: &UserId) -> CoreResult<UserId> {
        device_codes::redeem(&self.pool, code, redeemer).await
    }
}
