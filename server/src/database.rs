//! Database bootstrap and the user directory
//!
//! Every mutable piece of state lives in SQLite. Read-modify-write operations
//! open a transaction whose first statement is a write, so the connection
//! holds the write lock before it reads anything and concurrent writers queue
//! on `busy_timeout` instead of failing a lock upgrade.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use cipherpost_shared::UserId;

use crate::error::CoreResult;

/// Initialize the database connection pool
pub async fn init(database_url: &str) -> Result<Pool<Sqlite>> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("Invalid database URL {database_url}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    info!("Opening database at {}", database_url);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("Failed to connect to SQLite database")?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run database migrations
pub async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    info!("Running database migrations");

    // User directory: populated when a client authenticates
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            identity_pubkey BLOB,
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
            last_seen INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create users table")?;

    // Pre-key bundles. Public key material only; the pool of one-time keys
    // lives in its own table so that popping one is a single DELETE.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prekey_bundles (
            user_id TEXT PRIMARY KEY,
            identity_key BLOB NOT NULL,
            signed_prekey_id INTEGER NOT NULL,
            signed_prekey BLOB NOT NULL,
            signed_prekey_sig BLOB NOT NULL,
            registration_id INTEGER NOT NULL,
            updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create prekey_bundles table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS one_time_prekeys (
            user_id TEXT NOT NULL,
            key_id INTEGER NOT NULL,
            public_key BLOB NOT NULL,
            PRIMARY KEY (user_id, key_id),
            FOREIGN KEY (user_id) REFERENCES prekey_bundles(user_id) ON DELETE CASCADE
        );
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create one_time_prekeys table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_groups (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            creator_id TEXT NOT NULL,
            epoch INTEGER NOT NULL DEFAULT 1,
            only_admins_post INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create chat_groups table")?;

    // Memberships are soft-deleted (active = 0) so that historical messages
    // keep their attribution. join_position is the stream id of the roster
    // event that (re)admitted the member.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS group_members (
            group_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            is_admin INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            invited_by TEXT,
            joined_at INTEGER NOT NULL,
            join_position INTEGER NOT NULL,
            left_at INTEGER,
            PRIMARY KEY (group_id, user_id),
            FOREIGN KEY (group_id) REFERENCES chat_groups(id)
        );
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create group_members table")?;

    // Sender keys, each encrypted pairwise for one recipient. Older epochs
    // are retained but never served as current.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sender_key_distributions (
            group_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            recipient_id TEXT NOT NULL,
            epoch INTEGER NOT NULL,
            encrypted_key BLOB NOT NULL,
            message_type INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (group_id, sender_id, recipient_id, epoch),
            FOREIGN KEY (group_id) REFERENCES chat_groups(id)
        );
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create sender_key_distributions table")?;

    // Envelopes of every variant. AUTOINCREMENT keeps ids strictly
    // increasing, which is also the group stream order.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS envelopes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL CHECK (kind IN ('direct', 'group', 'system')),
            sender_id TEXT NOT NULL,
            recipient_id TEXT,
            group_id TEXT,
            epoch INTEGER,
            sender_key_id INTEGER,
            iteration INTEGER,
            iv BLOB,
            system_event TEXT,
            ciphertext BLOB,
            content_type TEXT NOT NULL,
            session_id TEXT,
            ephemeral_timer INTEGER NOT NULL DEFAULT 0,
            expires_at INTEGER,
            reply_to INTEGER,
            status TEXT NOT NULL DEFAULT 'sent'
                CHECK (status IN ('sent', 'delivered', 'read', 'expired')),
            sent_at INTEGER NOT NULL,
            delivered_at INTEGER,
            read_at INTEGER,
            destroyed_at INTEGER
        );
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create envelopes table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_envelopes_group_stream
        ON envelopes(group_id, id);
        "#,
    )
    .execute(pool)
    .await?;

    // Partial index for the ephemeral sweeper
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_envelopes_destructible
        ON envelopes(status, expires_at)
        WHERE ephemeral_timer > 0 OR expires_at IS NOT NULL;
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS delivery_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            envelope_id INTEGER NOT NULL,
            recipient_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'delivered')),
            created_at INTEGER NOT NULL,
            delivered_at INTEGER,
            UNIQUE (envelope_id, recipient_id),
            FOREIGN KEY (envelope_id) REFERENCES envelopes(id)
        );
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create delivery_queue table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_queue_pending
        ON delivery_queue(recipient_id, status, id);
        "#,
    )
    .execute(pool)
    .await?;

    // Device link codes: a pairing mechanism independent of pre-keys
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS device_link_codes (
            code TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            expires_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            redeemed_at INTEGER,
            redeemed_by TEXT
        );
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create device_link_codes table")?;

    info!("Migrations completed successfully");
    Ok(())
}

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Register (or refresh) a user in the directory
pub async fn store_user(
    pool: &Pool<Sqlite>,
    user_id: &UserId,
    identity_pubkey: Option<&[u8]>,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO users (id, identity_pubkey)
        VALUES (?1, ?2)
        ON CONFLICT(id) DO UPDATE SET
            identity_pubkey = COALESCE(excluded.identity_pubkey, users.identity_pubkey),
            last_seen = strftime('%s', 'now')
        "#,
    )
    .bind(user_id.as_str())
    .bind(identity_pubkey)
    .execute(pool)
    .await?;

    Ok(())
}

/// Whether a user is known to the directory
pub async fn user_exists(conn: &mut SqliteConnection, user_id: &UserId) -> CoreResult<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE id = ?1")
        .bind(user_id.as_str())
        .fetch_optional(conn)
        .await?;
    Ok(found.is_some())
}

/// Store-wide counters reported on the admin endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub users: i64,
    pub groups: i64,
    /// Queue entries not yet handed to a recipient
    pub pending_deliveries: i64,
    /// Envelopes with a timer or expiry whose ciphertext still exists
    pub awaiting_destruction: i64,
    pub destroyed_envelopes: i64,
}

pub async fn broker_stats(pool: &Pool<Sqlite>) -> CoreResult<BrokerStats> {
    let (users, groups, pending_deliveries, awaiting_destruction, destroyed_envelopes): (
        i64,
        i64,
        i64,
        i64,
        i64,
    ) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM users),
            (SELECT COUNT(*) FROM chat_groups),
            (SELECT COUNT(*) FROM delivery_queue WHERE status = 'pending'),
            (SELECT COUNT(*) FROM envelopes
                WHERE status != 'expired' AND (ephemeral_timer > 0 OR expires_at IS NOT NULL)),
            (SELECT COUNT(*) FROM envelopes WHERE status = 'expired')
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(BrokerStats {
        users,
        groups,
        pending_deliveries,
        awaiting_destruction,
        destroyed_envelopes,
    })
}
