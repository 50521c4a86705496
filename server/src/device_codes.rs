//! One-time device link codes
//!
//! A pairing mechanism for bringing a new device onto an existing account.
//! Unrelated to pre-keys: a code carries no key material and is consumed by
//! redemption, not by session establishment.

use rand::rngs::OsRng;
use rand::RngCore;
use sqlx::{Pool, Sqlite};
use tracing::info;

use cipherpost_shared::UserId;

use crate::database::{self, unix_now};
use crate::error::{CoreError, CoreResult};

/// Issue a fresh code for `user`, valid for `ttl_seconds`.
///
/// Returns the hex-encoded code and its expiry. Stale codes of the same user
/// are pruned in the same transaction.
pub async fn issue(
    pool: &Pool<Sqlite>,
    user: &UserId,
    ttl_seconds: i64,
) -> CoreResult<(String, i64)> {
    if ttl_seconds <= 0 {
        return Err(CoreError::validation("device code lifetime must be positive"));
    }

    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let code = hex::encode(bytes);

    let now = unix_now();
    let expires_at = now + ttl_seconds;
    let mut tx = pool.begin().await?;

    sqlx::query(
        "DELETE FROM device_link_codes WHERE user_id = ?1 AND redeemed_at IS NULL AND expires_at <= ?2",
    )
    .bind(user.as_str())
    .bind(now)
    .execute(&mut *tx)
    .await?;

    if !database::user_exists(&mut tx, user).await? {
        return Err(CoreError::not_found(format!("user {user}")));
    }

    sqlx::query(
        "INSERT INTO device_link_codes (code, user_id, expires_at, created_at) VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(&code)
    .bind(user.as_str())
    .bind(expires_at)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!("Issued device link code for {}", user.short());
    Ok((code, expires_at))
}

/// Consume `code` on behalf of `redeemer`, returning the issuing user.
///
/// Exactly one redemption succeeds; later attempts get `AlreadyUsed`.
pub async fn redeem(pool: &Pool<Sqlite>, code: &str, redeemer: &UserId) -> CoreResult<UserId> {
    let code = code.trim().to_ascii_lowercase();
    if code.is_empty() {
        return Err(CoreError::validation("device code is required"));
    }

    let now = unix_now();
    let mut tx = pool.begin().await?;

    let issuer: Option<String> = sqlx::query_scalar(
        r#"
        UPDATE device_link_codes SET redeemed_at = ?2, redeemed_by = ?3
        WHERE code = ?1 AND redeemed_at IS NULL AND expires_at > ?2
        RETURNING user_id
        "#,
    )
    .bind(&code)
    .bind(now)
    .bind(redeemer.as_str())
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(issuer) = issuer {
        tx.commit().await?;
        let issuer = UserId(issuer);
        info!(
            "Device code of {} redeemed by {}",
            issuer.short(),
            redeemer.short()
        );
        return Ok(issuer);
    }

    let row: Option<Option<i64>> =
        sqlx::query_scalar("SELECT redeemed_at FROM device_link_codes WHERE code = ?1")
            .bind(&code)
            .fetch_optional(&mut *tx)
            .await?;

    match row {
        None => Err(CoreError::not_found("device code")),
        Some(Some(_)) => Err(CoreError::AlreadyUsed(
            "device code has already been redeemed".to_string(),
        )),
        Some(None) => Err(CoreError::validation("device code has expired")),
    }
}
