//! Delivery queue for offline fan-out of direct envelopes
//!
//! "Delivered" means handed to the client's transport. A drain flips every
//! entry it returns in the same transaction, so a client that crashes after
//! receiving a batch never sees it again.

use std::collections::HashMap;

use sqlx::{Pool, Sqlite};
use tracing::{debug, info};

use cipherpost_shared::{PendingEnvelope, UserId, MAX_POLL_BATCH};

use crate::database::unix_now;
use crate::error::{CoreError, CoreResult};

type PayloadRow = (
    i64,
    String,
    Option<Vec<u8>>,
    String,
    Option<String>,
    u32,
    Option<i64>,
    Option<i64>,
    i64,
);

fn placeholders(start: usize, count: usize) -> String {
    (0..count)
        .map(|i| format!("?{}", start + i))
        .collect::<Vec<_>>()
        .join(",")
}

/// Return up to `limit` oldest pending entries for `recipient` with their
/// envelope payloads, marking each one delivered in the same transaction.
///
/// `limit` is clamped to [`MAX_POLL_BATCH`]. Envelopes destroyed before
/// hand-off come back with `ciphertext: None`.
pub async fn drain_and_mark(
    pool: &Pool<Sqlite>,
    recipient: &UserId,
    limit: u32,
) -> CoreResult<Vec<PendingEnvelope>> {
    if limit == 0 {
        return Err(CoreError::validation("limit must be at least 1"));
    }
    let limit = limit.min(MAX_POLL_BATCH);
    let now = unix_now();

    let mut tx = pool.begin().await?;

    let mut drained: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        UPDATE delivery_queue
        SET status = 'delivered', delivered_at = ?3
        WHERE id IN (
            SELECT id FROM delivery_queue
            WHERE recipient_id = ?1 AND status = 'pending'
            ORDER BY id
            LIMIT ?2
        )
        RETURNING id, envelope_id
        "#,
    )
    .bind(recipient.as_str())
    .bind(limit)
    .bind(now)
    .fetch_all(&mut *tx)
    .await?;

    if drained.is_empty() {
        tx.commit().await?;
        return Ok(Vec::new());
    }
    // RETURNING order is unspecified
    drained.sort_unstable_by_key(|(queue_id, _)| *queue_id);
    let envelope_ids: Vec<i64> = drained.iter().map(|(_, envelope_id)| *envelope_id).collect();

    let sql = format!(
        "UPDATE envelopes SET status = 'delivered', delivered_at = ?1 \
         WHERE status = 'sent' AND id IN ({})",
        placeholders(2, envelope_ids.len())
    );
    let mut query = sqlx::query(&sql).bind(now);
    for id in &envelope_ids {
        query = query.bind(id);
    }
    query.execute(&mut *tx).await?;

    let sql = format!(
        "SELECT id, sender_id, ciphertext, content_type, session_id, ephemeral_timer, \
         expires_at, reply_to, sent_at FROM envelopes WHERE id IN ({})",
        placeholders(1, envelope_ids.len())
    );
    let mut query = sqlx::query_as::<_, PayloadRow>(&sql);
    for id in &envelope_ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(&mut *tx).await?;

    tx.commit().await?;

    let mut by_id: HashMap<i64, PayloadRow> = rows.into_iter().map(|row| (row.0, row)).collect();
    let pending: Vec<PendingEnvelope> = envelope_ids
        .iter()
        .filter_map(|id| by_id.remove(id))
        .map(
            |(envelope_id, sender_id, ciphertext, content_type, session_id, timer, expires_at, reply_to, sent_at)| {
                PendingEnvelope {
                    envelope_id,
                    sender_id: UserId(sender_id),
                    ciphertext,
                    content_type,
                    session_id,
                    ephemeral_timer: timer,
                    expires_at,
                    reply_to,
                    timestamp: sent_at,
                }
            },
        )
        .collect();

    debug!(
        "Drained {} pending envelopes for {}",
        pending.len(),
        recipient.short()
    );
    Ok(pending)
}

/// Number of entries still waiting for `recipient`
pub async fn pending_count(pool: &Pool<Sqlite>, recipient: &UserId) -> CoreResult<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM delivery_queue WHERE recipient_id = ?1 AND status = 'pending'",
    )
    .bind(recipient.as_str())
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Delete delivered queue entries handed off before `older_than`.
/// Envelopes themselves are kept.
pub async fn purge_delivered(pool: &Pool<Sqlite>, older_than: i64) -> CoreResult<u64> {
    let result = sqlx::query(
        "DELETE FROM delivery_queue WHERE status = 'delivered' AND delivered_at < ?1",
    )
    .bind(older_than)
    .execute(pool)
    .await?;

    let purged = result.rows_affected();
    if purged > 0 {
        info!("Purged {} delivered queue entries", purged);
    }
    Ok(purged)
}
