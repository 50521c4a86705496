//! Message envelope store
//!
//! One table holds every envelope variant. Direct envelopes get a delivery
//! queue entry in the same transaction; group and system envelopes are only
//! ever read by stream position.

use sqlx::{FromRow, Pool, Sqlite, SqliteConnection};
use tracing::{debug, info, warn};

use cipherpost_shared::{
    Envelope, EnvelopeId, EnvelopeKind, EnvelopeStatus, GroupId, RosterEvent, UserId,
};

use crate::database::{self, unix_now};
use crate::error::{CoreError, CoreResult};

/// Content-type tag of server-authored roster envelopes
pub const SYSTEM_CONTENT_TYPE: &str = "application/x-roster-event";

const MAX_CONTENT_TYPE_LEN: usize = 128;
const MAX_SESSION_ID_LEN: usize = 128;

/// Columns selected for [`EnvelopeRow`], in order
pub(crate) const ENVELOPE_COLUMNS: &str = "id, kind, sender_id, recipient_id, group_id, epoch, \
    sender_key_id, iteration, iv, system_event, ciphertext, content_type, session_id, \
    ephemeral_timer, expires_at, reply_to, status, sent_at, delivered_at, read_at, destroyed_at";

/// Caller-supplied part of a new envelope, shared by every variant.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub ciphertext: Vec<u8>,
    pub content_type: String,
    pub session_id: Option<String>,
    /// Seconds; 0 means none
    pub ephemeral_timer: u32,
    pub expires_at: Option<i64>,
    pub reply_to: Option<EnvelopeId>,
}

impl Payload {
    pub fn validate(&self, now: i64) -> CoreResult<()> {
        if self.ciphertext.is_empty() {
            return Err(CoreError::validation("ciphertext is required"));
        }
        if self.content_type.is_empty() || self.content_type.len() > MAX_CONTENT_TYPE_LEN {
            return Err(CoreError::validation(format!(
                "content_type must be 1..={MAX_CONTENT_TYPE_LEN} bytes"
            )));
        }
        if let Some(session_id) = &self.session_id {
            if session_id.len() > MAX_SESSION_ID_LEN {
                return Err(CoreError::validation("session_id is too long"));
            }
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at <= now {
                return Err(CoreError::validation("expires_at must be in the future"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct EnvelopeRow {
    id: i64,
    kind: String,
    sender_id: String,
    recipient_id: Option<String>,
    group_id: Option<String>,
    epoch: Option<i64>,
    sender_key_id: Option<i64>,
    iteration: Option<i64>,
    iv: Option<Vec<u8>>,
    system_event: Option<String>,
    ciphertext: Option<Vec<u8>>,
    content_type: String,
    session_id: Option<String>,
    ephemeral_timer: i64,
    expires_at: Option<i64>,
    reply_to: Option<i64>,
    status: String,
    sent_at: i64,
    delivered_at: Option<i64>,
    read_at: Option<i64>,
    destroyed_at: Option<i64>,
}

/// A row that does not decode into an [`Envelope`] is a storage fault.
fn corrupt(id: i64, what: impl std::fmt::Display) -> CoreError {
    CoreError::Storage(sqlx::Error::Decode(
        format!("envelope {id}: {what}").into(),
    ))
}

fn required<T>(id: i64, field: &str, value: Option<T>) -> CoreResult<T> {
    value.ok_or_else(|| corrupt(id, format!("missing {field}")))
}

fn to_u32(id: i64, field: &str, value: i64) -> CoreResult<u32> {
    u32::try_from(value).map_err(|_| corrupt(id, format!("{field} out of range")))
}

impl TryFrom<EnvelopeRow> for Envelope {
    type Error = CoreError;

    fn try_from(row: EnvelopeRow) -> CoreResult<Self> {
        let id = row.id;
        let kind = match row.kind.as_str() {
            "direct" => EnvelopeKind::Direct {
                recipient_id: UserId(required(id, "recipient_id", row.recipient_id)?),
            },
            "group" => EnvelopeKind::Group {
                group_id: GroupId(required(id, "group_id", row.group_id)?),
                epoch: to_u32(id, "epoch", required(id, "epoch", row.epoch)?)?,
                sender_key_id: to_u32(
                    id,
                    "sender_key_id",
                    required(id, "sender_key_id", row.sender_key_id)?,
                )?,
                iteration: to_u32(id, "iteration", required(id, "iteration", row.iteration)?)?,
                iv: row.iv.unwrap_or_default(),
            },
            "system" => {
                let raw = required(id, "system_event", row.system_event)?;
                let event: RosterEvent =
                    serde_json::from_str(&raw).map_err(|e| corrupt(id, e))?;
                EnvelopeKind::System {
                    group_id: GroupId(required(id, "group_id", row.group_id)?),
                    epoch: to_u32(id, "epoch", required(id, "epoch", row.epoch)?)?,
                    event,
                }
            }
            other => return Err(corrupt(id, format!("unknown kind '{other}'"))),
        };

        Ok(Envelope {
            id,
            sender_id: UserId(row.sender_id),
            kind,
            ciphertext: row.ciphertext,
            content_type: row.content_type,
            session_id: row.session_id,
            ephemeral_timer: to_u32(id, "ephemeral_timer", row.ephemeral_timer)?,
            expires_at: row.expires_at,
            reply_to: row.reply_to,
            status: row.status.parse::<EnvelopeStatus>().map_err(|e| corrupt(id, e))?,
            sent_at: row.sent_at,
            delivered_at: row.delivered_at,
            read_at: row.read_at,
            destroyed_at: row.destroyed_at,
        })
    }
}

/// Sender-key parameters of a group envelope
#[derive(Debug, Clone, Default)]
pub struct GroupCipher {
    pub sender_key_id: u32,
    pub iteration: u32,
    pub iv: Vec<u8>,
}

/// Append a group envelope. The caller has already checked membership and
/// posting policy inside the same transaction.
pub(crate) async fn insert_group(
    conn: &mut SqliteConnection,
    group_id: &GroupId,
    sender: &UserId,
    epoch: u32,
    cipher: &GroupCipher,
    payload: &Payload,
    now: i64,
) -> CoreResult<EnvelopeId> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO envelopes
            (kind, sender_id, group_id, epoch, sender_key_id, iteration, iv,
             ciphertext, content_type, session_id, ephemeral_timer, expires_at, reply_to, sent_at)
        VALUES ('group', ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        RETURNING id
        "#,
    )
    .bind(sender.as_str())
    .bind(group_id.as_str())
    .bind(epoch)
    .bind(cipher.sender_key_id)
    .bind(cipher.iteration)
    .bind(&cipher.iv)
    .bind(&payload.ciphertext)
    .bind(&payload.content_type)
    .bind(&payload.session_id)
    .bind(payload.ephemeral_timer)
    .bind(payload.expires_at)
    .bind(payload.reply_to)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

/// Append a server-authored roster envelope to a group stream.
pub(crate) async fn insert_system(
    conn: &mut SqliteConnection,
    group_id: &GroupId,
    actor: &UserId,
    epoch: u32,
    event: &RosterEvent,
    now: i64,
) -> CoreResult<EnvelopeId> {
    let encoded = serde_json::to_string(event)
        .map_err(|e| CoreError::Storage(sqlx::Error::Encode(Box::new(e))))?;

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO envelopes (kind, sender_id, group_id, epoch, system_event, content_type, sent_at)
        VALUES ('system', ?1, ?2, ?3, ?4, ?5, ?6)
        RETURNING id
        "#,
    )
    .bind(actor.as_str())
    .bind(group_id.as_str())
    .bind(epoch)
    .bind(encoded)
    .bind(SYSTEM_CONTENT_TYPE)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

/// `reply_to` must name an envelope in the same conversation scope: any
/// direct envelope for direct replies, the same group for group replies.
pub(crate) async fn check_reply_target(
    conn: &mut SqliteConnection,
    reply_to: Option<EnvelopeId>,
    group_id: Option<&GroupId>,
) -> CoreResult<()> {
    let Some(target) = reply_to else {
        return Ok(());
    };
    let row: Option<(String, Option<String>)> =
        sqlx::query_as("SELECT kind, group_id FROM envelopes WHERE id = ?1")
            .bind(target)
            .fetch_optional(&mut *conn)
            .await?;

    let valid = match (row, group_id) {
        (Some((kind, _)), None) => kind == "direct",
        (Some((_, Some(target_group))), Some(group)) => target_group == group.as_str(),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(CoreError::validation(format!(
            "reply_to {target} does not reference an envelope in this conversation"
        )))
    }
}

/// Store a 1:1 envelope and its delivery queue entry atomically.
pub async fn submit_direct(
    pool: &Pool<Sqlite>,
    sender: &UserId,
    recipient: &UserId,
    payload: &Payload,
) -> CoreResult<(EnvelopeId, i64)> {
    let now = unix_now();
    payload.validate(now)?;

    let mut tx = pool.begin().await?;

    let envelope_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO envelopes
            (kind, sender_id, recipient_id, ciphertext, content_type, session_id,
             ephemeral_timer, expires_at, reply_to, sent_at)
        VALUES ('direct', ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        RETURNING id
        "#,
    )
    .bind(sender.as_str())
    .bind(recipient.as_str())
    .bind(&payload.ciphertext)
    .bind(&payload.content_type)
    .bind(&payload.session_id)
    .bind(payload.ephemeral_timer)
    .bind(payload.expires_at)
    .bind(payload.reply_to)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    if !database::user_exists(&mut tx, sender).await? {
        return Err(CoreError::not_found(format!("user {sender}")));
    }
    if !database::user_exists(&mut tx, recipient).await? {
        return Err(CoreError::not_found(format!("user {recipient}")));
    }
    check_reply_target(&mut tx, payload.reply_to, None).await?;

    sqlx::query(
        "INSERT INTO delivery_queue (envelope_id, recipient_id, created_at) VALUES (?1, ?2, ?3)",
    )
    .bind(envelope_id)
    .bind(recipient.as_str())
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    debug!(
        "Stored direct envelope {} from {} to {}",
        envelope_id,
        sender.short(),
        recipient.short()
    );
    Ok((envelope_id, now))
}

/// Acknowledge a direct envelope as read by its recipient.
///
/// Returns `false` if it was already read (or already destroyed).
pub async fn mark_read(
    pool: &Pool<Sqlite>,
    envelope_id: EnvelopeId,
    reader: &UserId,
) -> CoreResult<bool> {
    let now = unix_now();
    let mut tx = pool.begin().await?;

    let updated: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE envelopes
        SET status = 'read', read_at = ?3, delivered_at = COALESCE(delivered_at, ?3)
        WHERE id = ?1 AND kind = 'direct' AND recipient_id = ?2
          AND status IN ('sent', 'delivered')
        RETURNING id
        "#,
    )
    .bind(envelope_id)
    .bind(reader.as_str())
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;

    if updated.is_some() {
        // Reading implies the envelope reached the client, whatever path it took
        sqlx::query(
            r#"
            UPDATE delivery_queue SET status = 'delivered', delivered_at = ?3
            WHERE envelope_id = ?1 AND recipient_id = ?2 AND status = 'pending'
            "#,
        )
        .bind(envelope_id)
        .bind(reader.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        return Ok(true);
    }

    let row: Option<(String, Option<String>)> =
        sqlx::query_as("SELECT kind, recipient_id FROM envelopes WHERE id = ?1")
            .bind(envelope_id)
            .fetch_optional(&mut *tx)
            .await?;

    match row {
        None => Err(CoreError::not_found(format!("envelope {envelope_id}"))),
        Some((kind, _)) if kind != "direct" => Err(CoreError::validation(
            "only direct envelopes carry read receipts",
        )),
        Some((_, recipient)) if recipient.as_deref() != Some(reader.as_str()) => Err(
            CoreError::permission("only the recipient may mark an envelope read"),
        ),
        Some(_) => Ok(false),
    }
}

/// Destroy an ephemeral envelope: null its ciphertext and force `expired`.
///
/// `actor` is `None` for the sweeper. Otherwise either party of a direct
/// envelope, or the sender of a group envelope, may destroy it early.
/// Returns `false` if it was already destroyed.
pub async fn destroy(
    pool: &Pool<Sqlite>,
    envelope_id: EnvelopeId,
    actor: Option<&UserId>,
) -> CoreResult<bool> {
    let now = unix_now();
    let actor_id = actor.map(UserId::as_str);
    let mut tx = pool.begin().await?;

    let updated: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE envelopes
        SET ciphertext = NULL, status = 'expired', destroyed_at = ?3
        WHERE id = ?1
          AND status != 'expired'
          AND (ephemeral_timer > 0 OR expires_at IS NOT NULL)
          AND (?2 IS NULL
               OR (kind = 'direct' AND (sender_id = ?2 OR recipient_id = ?2))
               OR (kind = 'group' AND sender_id = ?2))
        RETURNING id
        "#,
    )
    .bind(envelope_id)
    .bind(actor_id)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;

    if updated.is_some() {
        tx.commit().await?;
        debug!("Destroyed envelope {}", envelope_id);
        return Ok(true);
    }

    let row: Option<(String, String, Option<String>, String, i64, Option<i64>)> = sqlx::query_as(
        r#"
        SELECT kind, sender_id, recipient_id, status, ephemeral_timer, expires_at
        FROM envelopes WHERE id = ?1
        "#,
    )
    .bind(envelope_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((kind, sender_id, recipient_id, status, timer, expires_at)) = row else {
        return Err(CoreError::not_found(format!("envelope {envelope_id}")));
    };

    if let Some(actor) = actor_id {
        let allowed = match kind.as_str() {
            "direct" => sender_id == actor || recipient_id.as_deref() == Some(actor),
            "group" => sender_id == actor,
            _ => false,
        };
        if !allowed {
            return Err(CoreError::permission(
                "not allowed to destroy this envelope",
            ));
        }
    }
    if timer == 0 && expires_at.is_none() {
        return Err(CoreError::validation(
            "envelope has no ephemeral timer or expiry",
        ));
    }
    if status != EnvelopeStatus::Expired.as_str() {
        warn!("Envelope {} matched no destroy branch (status {})", envelope_id, status);
    }
    Ok(false)
}

/// Whether an envelope carries an ephemeral timer or an expiry.
pub async fn is_destructible(pool: &Pool<Sqlite>, envelope_id: EnvelopeId) -> CoreResult<bool> {
    let row: Option<(i64, Option<i64>)> =
        sqlx::query_as("SELECT ephemeral_timer, expires_at FROM envelopes WHERE id = ?1")
            .bind(envelope_id)
            .fetch_optional(pool)
            .await?;

    match row {
        Some((timer, expires_at)) => Ok(timer > 0 || expires_at.is_some()),
        None => Err(CoreError::not_found(format!("envelope {envelope_id}"))),
    }
}

/// View one envelope. Direct envelopes are visible to their two parties,
/// group and system envelopes to active members of the group.
pub async fn get_envelope(
    pool: &Pool<Sqlite>,
    envelope_id: EnvelopeId,
    caller: &UserId,
) -> CoreResult<Envelope> {
    let mut conn = pool.acquire().await?;

    let sql = format!("SELECT {ENVELOPE_COLUMNS} FROM envelopes WHERE id = ?1");
    let row: Option<EnvelopeRow> = sqlx::query_as(&sql)
        .bind(envelope_id)
        .fetch_optional(&mut *conn)
        .await?;
    let envelope = match row {
        Some(row) => Envelope::try_from(row)?,
        None => return Err(CoreError::not_found(format!("envelope {envelope_id}"))),
    };

    let visible = match &envelope.kind {
        EnvelopeKind::Direct { recipient_id } => {
            &envelope.sender_id == caller || recipient_id == caller
        }
        EnvelopeKind::Group { group_id, .. } | EnvelopeKind::System { group_id, .. } => {
            let active: Option<i64> = sqlx::query_scalar(
                "SELECT 1 FROM group_members WHERE group_id = ?1 AND user_id = ?2 AND active = 1",
            )
            .bind(group_id.as_str())
            .bind(caller.as_str())
            .fetch_optional(&mut *conn)
            .await?;
            active.is_some()
        }
    };

    if visible {
        Ok(envelope)
    } else {
        Err(CoreError::permission("envelope is not visible to the caller"))
    }
}

/// Envelopes whose destruction time is at or before `now`, oldest first.
///
/// Mirrors [`Envelope::destroy_due_at`]: an explicit expiry wins, otherwise
/// the timer runs from the read time (direct) or the send time (group).
pub async fn due_for_destruction(
    pool: &Pool<Sqlite>,
    now: i64,
    limit: u32,
) -> CoreResult<Vec<EnvelopeId>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM envelopes
        WHERE status != 'expired'
          AND (ephemeral_timer > 0 OR expires_at IS NOT NULL)
          AND CASE
                WHEN expires_at IS NOT NULL THEN expires_at
                WHEN kind = 'direct' THEN read_at + ephemeral_timer
                ELSE sent_at + ephemeral_timer
              END <= ?1
        ORDER BY id
        LIMIT ?2
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

/// Destroy every envelope that is due at `now`, in batches of `batch`.
///
/// Returns how many envelopes this call destroyed. Envelopes destroyed
/// concurrently by their owners are skipped.
pub async fn sweep_due(pool: &Pool<Sqlite>, now: i64, batch: u32) -> CoreResult<u64> {
    let mut destroyed = 0u64;
    loop {
        let due = due_for_destruction(pool, now, batch).await?;
        if due.is_empty() {
            break;
        }
        let mut progressed = false;
        for id in &due {
            if destroy(pool, *id, None).await? {
                destroyed += 1;
                progressed = true;
            }
        }
        if !progressed || (due.len() as u32) < batch {
            break;
        }
    }

    if destroyed > 0 {
        info!("Ephemeral sweep destroyed {} envelopes", destroyed);
    }
    Ok(destroyed)
}
