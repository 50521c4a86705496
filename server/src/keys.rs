//! Key directory: identity and pre-key bundles
//!
//! The server only ever holds public key material. A one-time pre-key leaves
//! the pool in the same transaction that hands it out, so no key is issued
//! twice even when fetchers race on the last one.

use std::collections::HashSet;

use sqlx::{Pool, Sqlite};
use tracing::{debug, info};

use cipherpost_shared::{BundleHealth, OneTimePreKey, PreKeyBundle, SignedPreKey, UserId};

use crate::database::{self, unix_now};
use crate::error::{CoreError, CoreResult};

/// Replace `user`'s bundle with a freshly generated one.
///
/// The previous bundle, including any unconsumed one-time keys, is discarded
/// in the same transaction. Returns the number of one-time keys stored.
pub async fn upload_bundle(
    pool: &Pool<Sqlite>,
    user: &UserId,
    identity_key: &[u8],
    signed_pre_key: &SignedPreKey,
    one_time_pre_keys: &[OneTimePreKey],
    registration_id: u32,
    max_one_time_pre_keys: usize,
) -> CoreResult<u32> {
    validate_bundle(identity_key, signed_pre_key, one_time_pre_keys, max_one_time_pre_keys)?;

    let now = unix_now();
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM one_time_prekeys WHERE user_id = ?1")
        .bind(user.as_str())
        .execute(&mut *tx)
        .await?;

    if !database::user_exists(&mut tx, user).await? {
        return Err(CoreError::not_found(format!("user {user}")));
    }

    sqlx::query(
        r#"
        INSERT INTO prekey_bundles
            (user_id, identity_key, signed_prekey_id, signed_prekey, signed_prekey_sig, registration_id, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(user_id) DO UPDATE SET
            identity_key = excluded.identity_key,
            signed_prekey_id = excluded.signed_prekey_id,
            signed_prekey = excluded.signed_prekey,
            signed_prekey_sig = excluded.signed_prekey_sig,
            registration_id = excluded.registration_id,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(user.as_str())
    .bind(identity_key)
    .bind(signed_pre_key.key_id)
    .bind(&signed_pre_key.public_key)
    .bind(&signed_pre_key.signature)
    .bind(registration_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    for key in one_time_pre_keys {
        sqlx::query(
            "INSERT INTO one_time_prekeys (user_id, key_id, public_key) VALUES (?1, ?2, ?3)",
        )
        .bind(user.as_str())
        .bind(key.key_id)
        .bind(&key.public_key)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    info!(
        "Stored pre-key bundle for user {} ({} one-time keys)",
        user.short(),
        one_time_pre_keys.len()
    );
    Ok(one_time_pre_keys.len() as u32)
}

fn validate_bundle(
    identity_key: &[u8],
    signed_pre_key: &SignedPreKey,
    one_time_pre_keys: &[OneTimePreKey],
    max_one_time_pre_keys: usize,
) -> CoreResult<()> {
    if identity_key.is_empty() {
        return Err(CoreError::validation("identity_key is required"));
    }
    if signed_pre_key.public_key.is_empty() || signed_pre_key.signature.is_empty() {
        return Err(CoreError::validation(
            "signed_pre_key requires a public key and a signature",
        ));
    }
    if one_time_pre_keys.len() > max_one_time_pre_keys {
        return Err(CoreError::validation(format!(
            "at most {max_one_time_pre_keys} one-time pre-keys per upload"
        )));
    }
    let mut seen = HashSet::with_capacity(one_time_pre_keys.len());
    for key in one_time_pre_keys {
        if key.public_key.is_empty() {
            return Err(CoreError::validation(format!(
                "one-time pre-key {} has an empty public key",
                key.key_id
            )));
        }
        if !seen.insert(key.key_id) {
            return Err(CoreError::validation(format!(
                "duplicate one-time pre-key id {}",
                key.key_id
            )));
        }
    }
    Ok(())
}

/// Fetch `owner`'s bundle, consuming the lowest-numbered one-time pre-key.
///
/// `pre_key` is `None` once the pool is exhausted; the bundle is still usable
/// for a session without a one-time key.
pub async fn fetch_bundle(pool: &Pool<Sqlite>, owner: &UserId) -> CoreResult<PreKeyBundle> {
    let mut tx = pool.begin().await?;

    let popped: Option<(u32, Vec<u8>)> = sqlx::query_as(
        r#"
        DELETE FROM one_time_prekeys
        WHERE user_id = ?1
          AND key_id = (SELECT MIN(key_id) FROM one_time_prekeys WHERE user_id = ?1)
        RETURNING key_id, public_key
        "#,
    )
    .bind(owner.as_str())
    .fetch_optional(&mut *tx)
    .await?;

    let row: Option<(Vec<u8>, u32, Vec<u8>, Vec<u8>, u32)> = sqlx::query_as(
        r#"
        SELECT identity_key, signed_prekey_id, signed_prekey, signed_prekey_sig, registration_id
        FROM prekey_bundles
        WHERE user_id = ?1
        "#,
    )
    .bind(owner.as_str())
    .fetch_optional(&mut *tx)
    .await?;

    let Some((identity_key, signed_id, signed_key, signed_sig, registration_id)) = row else {
        return if database::user_exists(&mut tx, owner).await? {
            Err(CoreError::NoBundle(owner.clone()))
        } else {
            Err(CoreError::not_found(format!("user {owner}")))
        };
    };

    tx.commit().await?;

    debug!(
        "Served pre-key bundle for {} (one-time key: {:?})",
        owner.short(),
        popped.as_ref().map(|(id, _)| *id)
    );

    Ok(PreKeyBundle {
        user_id: owner.clone(),
        registration_id,
        identity_key,
        signed_pre_key: SignedPreKey {
            key_id: signed_id,
            public_key: signed_key,
            signature: signed_sig,
        },
        pre_key: popped.map(|(key_id, public_key)| OneTimePreKey { key_id, public_key }),
    })
}

/// Report whether `owner` should replenish their one-time pre-keys.
pub async fn check_bundle_health(
    pool: &Pool<Sqlite>,
    owner: &UserId,
    low_water_mark: u32,
) -> CoreResult<BundleHealth> {
    let has_bundle: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM prekey_bundles WHERE user_id = ?1")
            .bind(owner.as_str())
            .fetch_optional(pool)
            .await?;

    let remaining: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM one_time_prekeys WHERE user_id = ?1")
            .bind(owner.as_str())
            .fetch_one(pool)
            .await?;
    let remaining = remaining as u32;

    Ok(BundleHealth {
        has_bundle: has_bundle.is_some(),
        remaining_one_time_keys: remaining,
        low_water_mark,
        needs_replenish: remaining < low_water_mark,
    })
}
