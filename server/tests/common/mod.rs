//! Shared fixtures for the integration tests

#![allow(dead_code)]

use sqlx::SqlitePool;
use tempfile::TempDir;

use cipherpost_server::database;
use cipherpost_server::envelopes::Payload;
use cipherpost_shared::{OneTimePreKey, SignedPreKey, UserId};

/// A migrated on-disk database that lives as long as this value.
///
/// On-disk rather than `:memory:` so every pooled connection sees the same
/// data and concurrent transactions contend for real locks.
pub struct TestDb {
    pub pool: SqlitePool,
    _dir: TempDir,
}

pub async fn setup_test_db() -> TestDb {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("test.db").display());
    let pool = database::init(&url).await.expect("Failed to init test database");
    TestDb { pool, _dir: dir }
}

/// Register a user whose id is derived from a fixed byte pattern
pub async fn user(pool: &SqlitePool, seed: u8) -> UserId {
    let pubkey = [seed; 32];
    let id = UserId::from_pubkey(&pubkey);
    database::store_user(pool, &id, Some(&pubkey))
        .await
        .expect("Failed to store user");
    id
}

pub fn signed_pre_key() -> SignedPreKey {
    SignedPreKey {
        key_id: 1,
        public_key: vec![0x5A; 32],
        signature: vec![0x5B; 64],
    }
}

pub fn one_time_keys(ids: std::ops::Range<u32>) -> Vec<OneTimePreKey> {
    ids.map(|key_id| OneTimePreKey {
        key_id,
        public_key: vec![key_id as u8; 32],
    })
    .collect()
}

pub fn payload(body: &[u8]) -> Payload {
    Payload {
        ciphertext: body.to_vec(),
        content_type: "text/plain".to_string(),
        ..Payload::default()
    }
}

pub fn ephemeral(body: &[u8], timer: u32) -> Payload {
    Payload {
        ephemeral_timer: timer,
        ..payload(body)
    }
}
