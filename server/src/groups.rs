//! Group membership and sender-key distribution
//!
//! Every roster mutation runs in one transaction together with the system
//! envelope that announces it, so the stream and the roster never disagree.
//! Membership changes rotate the epoch; admin and policy changes do not.

use std::collections::BTreeSet;

use sqlx::{FromRow, Pool, Sqlite, SqliteConnection};
use tracing::{debug, info};

use cipherpost_shared::{
    Envelope, EnvelopeId, GroupId, GroupInfo, MemberInfo, RosterEvent, SenderKeyRecord, UserId,
    MAX_POLL_BATCH,
};

use crate::database::{self, unix_now};
use crate::envelopes::{self, EnvelopeRow, GroupCipher, Payload, ENVELOPE_COLUMNS};
use crate::error::{CoreError, CoreResult};

const MAX_GROUP_ID_LEN: usize = 128;
const MAX_GROUP_NAME_LEN: usize = 256;

/// Result of a committed roster or policy change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterUpdate {
    /// Epoch after the change
    pub epoch: u32,
    /// Stream position of the announcing system envelope; `None` if nothing changed
    pub position: Option<EnvelopeId>,
    /// Users who should hear about the change (active members plus anyone
    /// who just lost membership)
    pub notify: Vec<UserId>,
}

#[derive(Debug, FromRow)]
struct GroupRow {
    creator_id: String,
    epoch: u32,
    only_admins_post: bool,
}

#[derive(Debug, Clone, Copy)]
struct Membership {
    is_admin: bool,
    active: bool,
}

/// Take the write lock by touching the group row, returning its state.
async fn lock_group(
    conn: &mut SqliteConnection,
    group_id: &GroupId,
    now: i64,
) -> CoreResult<GroupRow> {
    let row: Option<GroupRow> = sqlx::query_as(
        r#"
        UPDATE chat_groups SET updated_at = ?2 WHERE id = ?1
        RETURNING creator_id, epoch, only_admins_post
        "#,
    )
    .bind(group_id.as_str())
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    row.ok_or_else(|| CoreError::not_found(format!("group {group_id}")))
}

/// Read-only counterpart of [`lock_group`]
async fn load_group(conn: &mut SqliteConnection, group_id: &GroupId) -> CoreResult<GroupRow> {
    let row: Option<GroupRow> =
        sqlx::query_as("SELECT creator_id, epoch, only_admins_post FROM chat_groups WHERE id = ?1")
            .bind(group_id.as_str())
            .fetch_optional(&mut *conn)
            .await?;

    row.ok_or_else(|| CoreError::not_found(format!("group {group_id}")))
}

async fn membership(
    conn: &mut SqliteConnection,
    group_id: &GroupId,
    user: &UserId,
) -> CoreResult<Option<Membership>> {
    let row: Option<(bool, bool)> = sqlx::query_as(
        "SELECT is_admin, active FROM group_members WHERE group_id = ?1 AND user_id = ?2",
    )
    .bind(group_id.as_str())
    .bind(user.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|(is_admin, active)| Membership { is_admin, active }))
}

/// Active membership of `user`, or `NotAMember`.
async fn require_member(
    conn: &mut SqliteConnection,
    group_id: &GroupId,
    user: &UserId,
) -> CoreResult<Membership> {
    match membership(conn, group_id, user).await? {
        Some(m) if m.active => Ok(m),
        _ => Err(CoreError::NotAMember(group_id.clone())),
    }
}

async fn require_admin(
    conn: &mut SqliteConnection,
    group_id: &GroupId,
    caller: &UserId,
    action: &str,
) -> CoreResult<()> {
    let m = require_member(conn, group_id, caller).await?;
    if !m.is_admin {
        return Err(CoreError::permission(format!("only admins may {action}")));
    }
    Ok(())
}

async fn bump_epoch(conn: &mut SqliteConnection, group_id: &GroupId) -> CoreResult<u32> {
    let epoch: u32 =
        sqlx::query_scalar("UPDATE chat_groups SET epoch = epoch + 1 WHERE id = ?1 RETURNING epoch")
            .bind(group_id.as_str())
            .fetch_one(&mut *conn)
            .await?;
    Ok(epoch)
}

async fn active_member_ids(
    conn: &mut SqliteConnection,
    group_id: &GroupId,
) -> CoreResult<Vec<UserId>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT user_id FROM group_members WHERE group_id = ?1 AND active = 1 ORDER BY user_id",
    )
    .bind(group_id.as_str())
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids.into_iter().map(UserId).collect())
}

async fn deactivate(
    conn: &mut SqliteConnection,
    group_id: &GroupId,
    user: &UserId,
    now: i64,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        UPDATE group_members SET active = 0, is_admin = 0, left_at = ?3
        WHERE group_id = ?1 AND user_id = ?2
        "#,
    )
    .bind(group_id.as_str())
    .bind(user.as_str())
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Create a group with `creator` as its first admin.
///
/// `member_ids` may or may not include the creator; duplicates are ignored.
pub async fn create_group(
    pool: &Pool<Sqlite>,
    group_id: &GroupId,
    name: &str,
    creator: &UserId,
    member_ids: &[UserId],
    description: Option<&str>,
    only_admins_post: bool,
) -> CoreResult<RosterUpdate> {
    if group_id.as_str().is_empty() || group_id.as_str().len() > MAX_GROUP_ID_LEN {
        return Err(CoreError::validation(format!(
            "group_id must be 1..={MAX_GROUP_ID_LEN} bytes"
        )));
    }
    if name.trim().is_empty() || name.len() > MAX_GROUP_NAME_LEN {
        return Err(CoreError::validation(format!(
            "name must be 1..={MAX_GROUP_NAME_LEN} bytes"
        )));
    }

    let invited: BTreeSet<&UserId> = member_ids.iter().filter(|m| *m != creator).collect();
    let now = unix_now();
    let epoch = 1u32;
    let mut tx = pool.begin().await?;

    let created = sqlx::query(
        r#"
        INSERT INTO chat_groups
            (id, name, description, creator_id, epoch, only_admins_post, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
        "#,
    )
    .bind(group_id.as_str())
    .bind(name)
    .bind(description)
    .bind(creator.as_str())
    .bind(epoch)
    .bind(only_admins_post)
    .bind(now)
    .execute(&mut *tx)
    .await;

    if let Err(sqlx::Error::Database(db_err)) = &created {
        if db_err.is_unique_violation() {
            return Err(CoreError::AlreadyUsed(format!(
                "group id {group_id} is already taken"
            )));
        }
    }
    created?;

    if !database::user_exists(&mut tx, creator).await? {
        return Err(CoreError::not_found(format!("user {creator}")));
    }
    for member in &invited {
        if !database::user_exists(&mut tx, member).await? {
            return Err(CoreError::not_found(format!("user {member}")));
        }
    }

    let mut roster = Vec::with_capacity(invited.len() + 1);
    roster.push(creator.clone());
    roster.extend(invited.iter().map(|m| (*m).clone()));

    let event = RosterEvent::GroupCreated {
        creator_id: creator.clone(),
        members: roster.clone(),
    };
    let position = envelopes::insert_system(&mut tx, group_id, creator, epoch, &event, now).await?;

    for member in &roster {
        let is_creator = member == creator;
        sqlx::query(
            r#"
            INSERT INTO group_members
                (group_id, user_id, is_admin, active, invited_by, joined_at, join_position)
            VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)
            "#,
        )
        .bind(group_id.as_str())
        .bind(member.as_str())
        .bind(is_creator)
        .bind(if is_creator { None } else { Some(creator.as_str()) })
        .bind(now)
        .bind(position)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    info!(
        "Created group {} by {} with {} members",
        group_id.short(),
        creator.short(),
        roster.len()
    );
    Ok(RosterUpdate {
        epoch,
        position: Some(position),
        notify: roster,
    })
}

/// Add (or re-admit) a member. Admin only.
pub async fn add_member(
    pool: &Pool<Sqlite>,
    group_id: &GroupId,
    caller: &UserId,
    user: &UserId,
    admin: bool,
) -> CoreResult<RosterUpdate> {
    let now = unix_now();
    let mut tx = pool.begin().await?;

    lock_group(&mut tx, group_id, now).await?;
    require_admin(&mut tx, group_id, caller, "add members").await?;

    if !database::user_exists(&mut tx, user).await? {
        return Err(CoreError::not_found(format!("user {user}")));
    }
    if let Some(m) = membership(&mut tx, group_id, user).await? {
        if m.active {
            return Err(CoreError::AlreadyUsed(format!(
                "user {user} is already a member of group {group_id}"
            )));
        }
    }

    let epoch = bump_epoch(&mut tx, group_id).await?;
    let event = RosterEvent::MemberAdded {
        member_id: user.clone(),
        added_by: caller.clone(),
        admin,
    };
    let position = envelopes::insert_system(&mut tx, group_id, caller, epoch, &event, now).await?;

    sqlx::query(
        r#"
        INSERT INTO group_members
            (group_id, user_id, is_admin, active, invited_by, joined_at, join_position)
        VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)
        ON CONFLICT(group_id, user_id) DO UPDATE SET
            is_admin = excluded.is_admin,
            active = 1,
            invited_by = excluded.invited_by,
            joined_at = excluded.joined_at,
            join_position = excluded.join_position,
            left_at = NULL
        "#,
    )
    .bind(group_id.as_str())
    .bind(user.as_str())
    .bind(admin)
    .bind(caller.as_str())
    .bind(now)
    .bind(position)
    .execute(&mut *tx)
    .await?;

    let notify = active_member_ids(&mut tx, group_id).await?;
    tx.commit().await?;

    info!(
        "Added {} to group {} (epoch {})",
        user.short(),
        group_id.short(),
        epoch
    );
    Ok(RosterUpdate {
        epoch,
        position: Some(position),
        notify,
    })
}

/// Remove a member. Admin only; the creator can never be removed.
pub async fn remove_member(
    pool: &Pool<Sqlite>,
    group_id: &GroupId,
    caller: &UserId,
    user: &UserId,
) -> CoreResult<RosterUpdate> {
    let now = unix_now();
    let mut tx = pool.begin().await?;

    let group = lock_group(&mut tx, group_id, now).await?;
    if group.creator_id == user.as_str() {
        return Err(CoreError::permission("the group creator cannot be removed"));
    }
    require_admin(&mut tx, group_id, caller, "remove members").await?;

    match membership(&mut tx, group_id, user).await? {
        Some(m) if m.active => {}
        _ => {
            return Err(CoreError::not_found(format!(
                "member {user} of group {group_id}"
            )))
        }
    }

    deactivate(&mut tx, group_id, user, now).await?;
    let epoch = bump_epoch(&mut tx, group_id).await?;
    let event = RosterEvent::MemberRemoved {
        member_id: user.clone(),
        removed_by: caller.clone(),
    };
    let position = envelopes::insert_system(&mut tx, group_id, caller, epoch, &event, now).await?;

    let mut notify = active_member_ids(&mut tx, group_id).await?;
    notify.push(user.clone());
    tx.commit().await?;

    info!(
        "Removed {} from group {} (epoch {})",
        user.short(),
        group_id.short(),
        epoch
    );
    Ok(RosterUpdate {
        epoch,
        position: Some(position),
        notify,
    })
}

/// Leave a group. The creator cannot leave.
pub async fn leave_group(
    pool: &Pool<Sqlite>,
    group_id: &GroupId,
    user: &UserId,
) -> CoreResult<RosterUpdate> {
    let now = unix_now();
    let mut tx = pool.begin().await?;

    let group = lock_group(&mut tx, group_id, now).await?;
    require_member(&mut tx, group_id, user).await?;
    if group.creator_id == user.as_str() {
        return Err(CoreError::permission("the group creator cannot leave"));
    }

    deactivate(&mut tx, group_id, user, now).await?;
    let epoch = bump_epoch(&mut tx, group_id).await?;
    let event = RosterEvent::MemberLeft {
        member_id: user.clone(),
    };
    let position = envelopes::insert_system(&mut tx, group_id, user, epoch, &event, now).await?;

    let mut notify = active_member_ids(&mut tx, group_id).await?;
    notify.push(user.clone());
    tx.commit().await?;

    info!("{} left group {} (epoch {})", user.short(), group_id.short(), epoch);
    Ok(RosterUpdate {
        epoch,
        position: Some(position),
        notify,
    })
}

/// Grant or revoke admin. Admin only; the creator cannot be demoted.
pub async fn set_admin(
    pool: &Pool<Sqlite>,
    group_id: &GroupId,
    caller: &UserId,
    user: &UserId,
    admin: bool,
) -> CoreResult<RosterUpdate> {
    let now = unix_now();
    let mut tx = pool.begin().await?;

    let group = lock_group(&mut tx, group_id, now).await?;
    require_admin(&mut tx, group_id, caller, "change admins").await?;
    if !admin && group.creator_id == user.as_str() {
        return Err(CoreError::permission("the group creator cannot be demoted"));
    }

    let current = match membership(&mut tx, group_id, user).await? {
        Some(m) if m.active => m,
        _ => {
            return Err(CoreError::not_found(format!(
                "member {user} of group {group_id}"
            )))
        }
    };

    let notify = active_member_ids(&mut tx, group_id).await?;
    if current.is_admin == admin {
        tx.commit().await?;
        return Ok(RosterUpdate {
            epoch: group.epoch,
            position: None,
            notify,
        });
    }

    sqlx::query("UPDATE group_members SET is_admin = ?3 WHERE group_id = ?1 AND user_id = ?2")
        .bind(group_id.as_str())
        .bind(user.as_str())
        .bind(admin)
        .execute(&mut *tx)
        .await?;

    let event = RosterEvent::AdminChanged {
        member_id: user.clone(),
        admin,
        changed_by: caller.clone(),
    };
    let position =
        envelopes::insert_system(&mut tx, group_id, caller, group.epoch, &event, now).await?;
    tx.commit().await?;

    debug!(
        "Admin flag of {} in group {} set to {}",
        user.short(),
        group_id.short(),
        admin
    );
    Ok(RosterUpdate {
        epoch: group.epoch,
        position: Some(position),
        notify,
    })
}

/// Switch between open posting and admins-only posting. Admin only.
pub async fn set_posting_policy(
    pool: &Pool<Sqlite>,
    group_id: &GroupId,
    caller: &UserId,
    only_admins_post: bool,
) -> CoreResult<RosterUpdate> {
    let now = unix_now();
    let mut tx = pool.begin().await?;

    let group = lock_group(&mut tx, group_id, now).await?;
    require_admin(&mut tx, group_id, caller, "change the posting policy").await?;

    let notify = active_member_ids(&mut tx, group_id).await?;
    if group.only_admins_post == only_admins_post {
        tx.commit().await?;
        return Ok(RosterUpdate {
            epoch: group.epoch,
            position: None,
            notify,
        });
    }

    sqlx::query("UPDATE chat_groups SET only_admins_post = ?2 WHERE id = ?1")
        .bind(group_id.as_str())
        .bind(only_admins_post)
        .execute(&mut *tx)
        .await?;

    let event = RosterEvent::PostingPolicyChanged {
        only_admins_post,
        changed_by: caller.clone(),
    };
    let position =
        envelopes::insert_system(&mut tx, group_id, caller, group.epoch, &event, now).await?;
    tx.commit().await?;

    debug!(
        "Posting policy of group {} set to only_admins_post={}",
        group_id.short(),
        only_admins_post
    );
    Ok(RosterUpdate {
        epoch: group.epoch,
        position: Some(position),
        notify,
    })
}

/// Active members, visible to active members only.
/// Display metadata, epoch and posting policy of a group.
pub async fn get_group(
    pool: &Pool<Sqlite>,
    group_id: &GroupId,
    caller: &UserId,
) -> CoreResult<GroupInfo> {
    let mut tx = pool.begin().await?;

    let row: Option<(String, Option<String>, String, u32, bool, i64)> = sqlx::query_as(
        r#"
        SELECT name, description, creator_id, epoch, only_admins_post, created_at
        FROM chat_groups WHERE id = ?1
        "#,
    )
    .bind(group_id.as_str())
    .fetch_optional(&mut *tx)
    .await?;

    let (name, description, creator_id, epoch, only_admins_post, created_at) =
        row.ok_or_else(|| CoreError::not_found(format!("group {group_id}")))?;
    require_member(&mut tx, group_id, caller).await?;
    tx.commit().await?;

    Ok(GroupInfo {
        group_id: group_id.clone(),
        name,
        description,
        creator_id: UserId(creator_id),
        epoch,
        only_admins_post,
        created_at,
    })
}

pub async fn list_members(
    pool: &Pool<Sqlite>,
    group_id: &GroupId,
    caller: &UserId,
) -> CoreResult<Vec<MemberInfo>> {
    let mut tx = pool.begin().await?;
    load_group(&mut tx, group_id).await?;
    require_member(&mut tx, group_id, caller).await?;

    let rows: Vec<(String, bool, Option<String>, i64)> = sqlx::query_as(
        r#"
        SELECT user_id, is_admin, invited_by, joined_at
        FROM group_members
        WHERE group_id = ?1 AND active = 1
        ORDER BY join_position, user_id
        "#,
    )
    .bind(group_id.as_str())
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(rows
        .into_iter()
        .map(|(user_id, is_admin, invited_by, joined_at)| MemberInfo {
            user_id: UserId(user_id),
            is_admin,
            invited_by: invited_by.map(UserId),
            joined_at,
        })
        .collect())
}

/// Store `sender`'s sender key encrypted for `recipient`.
///
/// Only the current epoch is accepted. A resend for the same epoch replaces
/// the blob; records of older epochs are kept but never served.
pub async fn distribute_sender_key(
    pool: &Pool<Sqlite>,
    group_id: &GroupId,
    sender: &UserId,
    recipient: &UserId,
    encrypted_key: &[u8],
    message_type: u8,
    epoch: u32,
) -> CoreResult<()> {
    if encrypted_key.is_empty() {
        return Err(CoreError::validation("encrypted_key is required"));
    }
    if sender == recipient {
        return Err(CoreError::validation(
            "sender keys are distributed to other members only",
        ));
    }

    let now = unix_now();
    let mut tx = pool.begin().await?;

    let group = lock_group(&mut tx, group_id, now).await?;
    require_member(&mut tx, group_id, sender).await?;
    match membership(&mut tx, group_id, recipient).await? {
        Some(m) if m.active => {}
        _ => {
            return Err(CoreError::validation(format!(
                "recipient {recipient} is not an active member"
            )))
        }
    }

    if epoch < group.epoch {
        return Err(CoreError::Conflict(format!(
            "epoch {epoch} is stale, group is at epoch {}",
            group.epoch
        )));
    }
    if epoch > group.epoch {
        return Err(CoreError::validation(format!(
            "epoch {epoch} is ahead of the group's epoch {}",
            group.epoch
        )));
    }

    sqlx::query(
        r#"
        INSERT INTO sender_key_distributions
            (group_id, sender_id, recipient_id, epoch, encrypted_key, message_type, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(group_id, sender_id, recipient_id, epoch) DO UPDATE SET
            encrypted_key = excluded.encrypted_key,
            message_type = excluded.message_type,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(group_id.as_str())
    .bind(sender.as_str())
    .bind(recipient.as_str())
    .bind(epoch)
    .bind(encrypted_key)
    .bind(message_type)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    debug!(
        "Stored sender key {} -> {} in group {} (epoch {})",
        sender.short(),
        recipient.short(),
        group_id.short(),
        epoch
    );
    Ok(())
}

/// Current-epoch sender keys addressed to `recipient`.
pub async fn fetch_sender_keys(
    pool: &Pool<Sqlite>,
    group_id: &GroupId,
    recipient: &UserId,
) -> CoreResult<Vec<SenderKeyRecord>> {
    let mut tx = pool.begin().await?;
    let group = load_group(&mut tx, group_id).await?;
    require_member(&mut tx, group_id, recipient).await?;

    let rows: Vec<(String, Vec<u8>, u8, i64)> = sqlx::query_as(
        r#"
        SELECT sender_id, encrypted_key, message_type, updated_at
        FROM sender_key_distributions
        WHERE group_id = ?1 AND recipient_id = ?2 AND epoch = ?3
        ORDER BY sender_id
        "#,
    )
    .bind(group_id.as_str())
    .bind(recipient.as_str())
    .bind(group.epoch)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(rows
        .into_iter()
        .map(|(sender_id, encrypted_key, message_type, updated_at)| SenderKeyRecord {
            group_id: group_id.clone(),
            sender_id: UserId(sender_id),
            recipient_id: recipient.clone(),
            epoch: group.epoch,
            encrypted_key,
            message_type,
            updated_at,
        })
        .collect())
}

/// Active members who hold no current-epoch sender key from `sender`.
///
/// Returns the current epoch alongside, so the sender knows which epoch to
/// distribute for.
pub async fn desynchronized_members(
    pool: &Pool<Sqlite>,
    group_id: &GroupId,
    sender: &UserId,
) -> CoreResult<(u32, Vec<UserId>)> {
    let mut tx = pool.begin().await?;
    let group = load_group(&mut tx, group_id).await?;
    require_member(&mut tx, group_id, sender).await?;

    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT m.user_id FROM group_members m
        WHERE m.group_id = ?1 AND m.active = 1 AND m.user_id != ?2
          AND NOT EXISTS (
              SELECT 1 FROM sender_key_distributions d
              WHERE d.group_id = m.group_id
                AND d.sender_id = ?2
                AND d.recipient_id = m.user_id
                AND d.epoch = ?3
          )
        ORDER BY m.user_id
        "#,
    )
    .bind(group_id.as_str())
    .bind(sender.as_str())
    .bind(group.epoch)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok((group.epoch, ids.into_iter().map(UserId).collect()))
}

/// Append a message to the group stream, subject to the posting policy.
pub async fn send_group_message(
    pool: &Pool<Sqlite>,
    group_id: &GroupId,
    sender: &UserId,
    cipher: &GroupCipher,
    payload: &Payload,
) -> CoreResult<(EnvelopeId, i64)> {
    let now = unix_now();
    payload.validate(now)?;

    let mut tx = pool.begin().await?;

    let group = lock_group(&mut tx, group_id, now).await?;
    let member = require_member(&mut tx, group_id, sender).await?;
    if group.only_admins_post && !member.is_admin {
        return Err(CoreError::PostingRestricted(group_id.clone()));
    }
    envelopes::check_reply_target(&mut tx, payload.reply_to, Some(group_id)).await?;

    let id =
        envelopes::insert_group(&mut tx, group_id, sender, group.epoch, cipher, payload, now)
            .await?;
    tx.commit().await?;

    debug!(
        "Group message {} from {} in group {}",
        id,
        sender.short(),
        group_id.short()
    );
    Ok((id, now))
}

/// Page through the group stream after `after_id`.
///
/// A reader only sees the stream from the roster event that (re)admitted them.
pub async fn read_group_stream(
    pool: &Pool<Sqlite>,
    group_id: &GroupId,
    reader: &UserId,
    after_id: EnvelopeId,
    limit: u32,
) -> CoreResult<Vec<Envelope>> {
    if limit == 0 {
        return Err(CoreError::validation("limit must be at least 1"));
    }
    let limit = limit.min(MAX_POLL_BATCH);

    let mut tx = pool.begin().await?;
    load_group(&mut tx, group_id).await?;
    require_member(&mut tx, group_id, reader).await?;

    let join_position: i64 = sqlx::query_scalar(
        "SELECT join_position FROM group_members WHERE group_id = ?1 AND user_id = ?2",
    )
    .bind(group_id.as_str())
    .bind(reader.as_str())
    .fetch_one(&mut *tx)
    .await?;

    let sql = format!(
        "SELECT {ENVELOPE_COLUMNS} FROM envelopes \
         WHERE group_id = ?1 AND id > ?2 AND id >= ?3 \
         ORDER BY id LIMIT ?4"
    );
    let rows: Vec<EnvelopeRow> = sqlx::query_as(&sql)
        .bind(group_id.as_str())
        .bind(after_id)
        .bind(join_position)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
    tx.commit().await?;

    rows.into_iter().map(Envelope::try_from).collect()
}
