//! End-to-end flows through the storage backend trait

mod common;

use std::sync::Arc;

use cipherpost_server::database::unix_now;
use cipherpost_server::db::sqlite::SqliteBackend;
use cipherpost_server::db::DatabaseBackend;
use cipherpost_server::envelopes::Payload;
use cipherpost_shared::{EnvelopeStatus, ErrorKind};

use common::{ephemeral, one_time_keys, setup_test_db, signed_pre_key, user};

// ============================================================================
// Session setup through destruction
// ============================================================================

#[tokio::test]
async fn test_one_prekey_ephemeral_message_lifecycle() {
    let db = setup_test_db().await;
    let backend: Arc<dyn DatabaseBackend> = Arc::new(SqliteBackend::new(db.pool.clone()));
    let a = user(&db.pool, 0xA0).await;
    let b = user(&db.pool, 0xB0).await;

    // A publishes a bundle with a single one-time key
    let stored = backend
        .upload_bundle(&a, &[0xA1; 32], &signed_pre_key(), &one_time_keys(1..2), 77, 100)
        .await
        .unwrap();
    assert_eq!(stored, 1);

    // B gets the key, C gets a bundle without one
    let for_b = backend.fetch_bundle(&a).await.unwrap();
    assert_eq!(for_b.pre_key.map(|k| k.key_id), Some(1));
    let for_c = backend.fetch_bundle(&a).await.unwrap();
    assert!(for_c.pre_key.is_none());
    assert_eq!(for_c.signed_pre_key, for_b.signed_pre_key);
    assert_eq!(for_c.registration_id, 77);

    let health = backend.check_bundle_health(&a, 10).await.unwrap();
    assert_eq!(health.remaining_one_time_keys, 0);
    assert!(health.needs_replenish);

    // A -> B with a 30 second timer
    let (id, _) = backend
        .submit_direct(&a, &b, &ephemeral(b"see you soon", 30))
        .await
        .unwrap();

    let pending = backend.drain_and_mark(&b, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].envelope_id, id);
    assert_eq!(pending[0].ephemeral_timer, 30);
    let viewed = backend.get_envelope(id, &b).await.unwrap();
    assert_eq!(viewed.status, EnvelopeStatus::Delivered);

    assert!(backend.mark_read(id, &b).await.unwrap());
    let read_at = backend.get_envelope(id, &b).await.unwrap().read_at.unwrap();

    // Not yet due right after reading; due once the timer has run
    assert!(!backend
        .due_for_destruction(read_at + 29, 10)
        .await
        .unwrap()
        .contains(&id));
    assert!(backend
        .due_for_destruction(read_at + 30, 10)
        .await
        .unwrap()
        .contains(&id));

    assert!(backend.destroy(id, Some(&b)).await.unwrap());
    assert!(!backend.destroy(id, Some(&b)).await.unwrap());

    let destroyed = backend.get_envelope(id, &a).await.unwrap();
    assert!(destroyed.ciphertext.is_none());
    assert_eq!(destroyed.status, EnvelopeStatus::Expired);
    assert!(backend
        .due_for_destruction(unix_now() + 1_000, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_sweeper_destroys_expired_unread_envelope() {
    let db = setup_test_db().await;
    let backend = SqliteBackend::new(db.pool.clone());
    let a = user(&db.pool, 1).await;
    let b = user(&db.pool, 2).await;

    let expires_at = unix_now() + 5;
    let payload = Payload {
        ciphertext: b"short lived".to_vec(),
        content_type: "text/plain".to_string(),
        expires_at: Some(expires_at),
        ..Payload::default()
    };
    let (id, _) = backend.submit_direct(&a, &b, &payload).await.unwrap();

    assert_eq!(backend.sweep_due(expires_at - 1, 10).await.unwrap(), 0);
    assert_eq!(backend.sweep_due(expires_at, 10).await.unwrap(), 1);

    // Still queued: the recipient learns it existed but gets no ciphertext
    let pending = backend.drain_and_mark(&b, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].ciphertext.is_none());
    assert_eq!(pending[0].expires_at, Some(expires_at));
}

#[tokio::test]
async fn test_migrations_rerun_and_checkpoint() {
    let db = setup_test_db().await;
    let backend = SqliteBackend::new(db.pool.clone());
    let a = user(&db.pool, 1).await;

    // Startup runs them once already; a second pass must keep the data
    backend.run_migrations().await.unwrap();
    backend.store_user(&a, None).await.unwrap();
    assert_eq!(backend.pending_count(&a).await.unwrap(), 0);
    backend.checkpoint().await.unwrap();
}

// ============================================================================
// Device linking
// ============================================================================

#[tokio::test]
async fn test_device_code_redeems_exactly_once() {
    let db = setup_test_db().await;
    let backend = SqliteBackend::new(db.pool.clone());
    let phone = user(&db.pool, 1).await;
    let laptop = user(&db.pool, 2).await;
    let tablet = user(&db.pool, 3).await;

    let (code, expires_at) = backend.issue_device_code(&phone, 300).await.unwrap();
    assert_eq!(code.len(), 64);
    assert!(code.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(expires_at > unix_now());

    // Codes are case-insensitive and tolerate surrounding whitespace
    let typed = format!("  {}  ", code.to_uppercase());
    assert_eq!(backend.redeem_device_code(&typed, &laptop).await.unwrap(), phone);

    let err = backend.redeem_device_code(&code, &tablet).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyUsed);

    let err = backend.redeem_device_code("00ff", &tablet).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = backend.redeem_device_code("   ", &tablet).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_device_code_expiry_and_issue_rules() {
    let db = setup_test_db().await;
    let backend = SqliteBackend::new(db.pool.clone());
    let phone = user(&db.pool, 1).await;
    let laptop = user(&db.pool, 2).await;

    let (code, _) = backend.issue_device_code(&phone, 300).await.unwrap();
    sqlx::query("UPDATE device_link_codes SET expires_at = ?1 WHERE code = ?2")
        .bind(unix_now() - 1)
        .bind(&code)
        .execute(&db.pool)
        .await
        .unwrap();

    let err = backend.redeem_device_code(&code, &laptop).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    // Issuing again prunes the stale code
    let (fresh, _) = backend.issue_device_code(&phone, 300).await.unwrap();
    assert_ne!(fresh, code);
    let err = backend.redeem_device_code(&code, &laptop).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = backend.issue_device_code(&phone, 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let ghost = cipherpost_shared::UserId::from_pubkey(&[0xEE; 32]);
    let err = backend.issue_device_code(&ghost, 300).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_concurrent_redeems_have_one_winner() {
    let db = setup_test_db().await;
    let backend: Arc<dyn DatabaseBackend> = Arc::new(SqliteBackend::new(db.pool.clone()));
    let phone = user(&db.pool, 1).await;
    let mut devices = Vec::new();
    for seed in 10..16u8 {
        devices.push(user(&db.pool, seed).await);
    }

    let (code, _) = backend.issue_device_code(&phone, 300).await.unwrap();

    let mut handles = Vec::new();
    for device in devices {
        let backend = backend.clone();
        let code = code.clone();
        handles.push(tokio::spawn(async move {
            backend.redeem_device_code(&code, &device).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(issuer) => {
                assert_eq!(issuer, phone);
                winners += 1;
            }
            Err(e) => assert!(
                matches!(e.kind(), ErrorKind::AlreadyUsed | ErrorKind::Conflict),
                "unexpected error {e}"
            ),
        }
    }
    assert_eq!(winners, 1);
}
