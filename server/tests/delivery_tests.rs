//! Delivery queue tests

mod common;

use std::collections::HashSet;

use cipherpost_server::database::{self, unix_now, BrokerStats};
use cipherpost_server::{delivery, envelopes, groups};
use cipherpost_shared::{EnvelopeStatus, ErrorKind, GroupId, MAX_POLL_BATCH};

use common::{ephemeral, payload, setup_test_db, user};

// ============================================================================
// Drain
// ============================================================================

#[tokio::test]
async fn test_drain_returns_oldest_first_and_marks_delivered() {
    let db = setup_test_db().await;
    let alice = user(&db.pool, 1).await;
    let bob = user(&db.pool, 2).await;

    let mut sent = Vec::new();
    for i in 0..5u8 {
        let (id, _) = envelopes::submit_direct(&db.pool, &alice, &bob, &payload(&[i + 1]))
            .await
            .unwrap();
        sent.push(id);
    }

    let first = delivery::drain_and_mark(&db.pool, &bob, 3).await.unwrap();
    let ids: Vec<_> = first.iter().map(|p| p.envelope_id).collect();
    assert_eq!(ids, sent[..3].to_vec());
    assert_eq!(first[0].ciphertext, Some(vec![1]));
    assert_eq!(first[0].sender_id, alice);
    assert_eq!(first[0].content_type, "text/plain");
    assert_eq!(delivery::pending_count(&db.pool, &bob).await.unwrap(), 2);

    let envelope = envelopes::get_envelope(&db.pool, sent[0], &bob).await.unwrap();
    assert_eq!(envelope.status, EnvelopeStatus::Delivered);
    assert!(envelope.delivered_at.is_some());

    // Drained entries never come back
    let second = delivery::drain_and_mark(&db.pool, &bob, 50).await.unwrap();
    let ids: Vec<_> = second.iter().map(|p| p.envelope_id).collect();
    assert_eq!(ids, sent[3..].to_vec());
    assert!(delivery::drain_and_mark(&db.pool, &bob, 50).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_drain_limit_is_clamped() {
    let db = setup_test_db().await;
    let alice = user(&db.pool, 1).await;
    let bob = user(&db.pool, 2).await;

    for i in 0..(MAX_POLL_BATCH + 5) {
        envelopes::submit_direct(&db.pool, &alice, &bob, &payload(&i.to_be_bytes()))
            .await
            .unwrap();
    }

    let batch = delivery::drain_and_mark(&db.pool, &bob, 1_000).await.unwrap();
    assert_eq!(batch.len(), MAX_POLL_BATCH as usize);
    assert!(batch.windows(2).all(|w| w[0].envelope_id < w[1].envelope_id));

    let rest = delivery::drain_and_mark(&db.pool, &bob, 1_000).await.unwrap();
    assert_eq!(rest.len(), 5);

    let err = delivery::drain_and_mark(&db.pool, &bob, 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_drain_is_per_recipient() {
    let db = setup_test_db().await;
    let alice = user(&db.pool, 1).await;
    let bob = user(&db.pool, 2).await;
    let carol = user(&db.pool, 3).await;

    envelopes::submit_direct(&db.pool, &alice, &bob, &payload(b"to bob"))
        .await
        .unwrap();
    envelopes::submit_direct(&db.pool, &alice, &carol, &payload(b"to carol"))
        .await
        .unwrap();

    let bobs = delivery::drain_and_mark(&db.pool, &bob, 10).await.unwrap();
    assert_eq!(bobs.len(), 1);
    assert_eq!(bobs[0].ciphertext, Some(b"to bob".to_vec()));
    assert_eq!(delivery::pending_count(&db.pool, &carol).await.unwrap(), 1);
}

#[tokio::test]
async fn test_destroyed_before_handoff_drains_without_ciphertext() {
    let db = setup_test_db().await;
    let alice = user(&db.pool, 1).await;
    let bob = user(&db.pool, 2).await;

    let (id, _) = envelopes::submit_direct(&db.pool, &alice, &bob, &ephemeral(b"gone", 10))
        .await
        .unwrap();
    envelopes::destroy(&db.pool, id, Some(&alice)).await.unwrap();

    let drained = delivery::drain_and_mark(&db.pool, &bob, 10).await.unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].envelope_id, id);
    assert!(drained[0].ciphertext.is_none());
    assert_eq!(drained[0].ephemeral_timer, 10);

    // Hand-off does not resurrect a destroyed envelope
    let envelope = envelopes::get_envelope(&db.pool, id, &bob).await.unwrap();
    assert_eq!(envelope.status, EnvelopeStatus::Expired);
}

#[tokio::test]
async fn test_concurrent_drains_hand_out_each_entry_once() {
    let db = setup_test_db().await;
    let alice = user(&db.pool, 1).await;
    let bob = user(&db.pool, 2).await;

    for i in 0..20u8 {
        envelopes::submit_direct(&db.pool, &alice, &bob, &payload(&[i]))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let pool = db.pool.clone();
        let recipient = bob.clone();
        handles.push(tokio::spawn(async move {
            delivery::drain_and_mark(&pool, &recipient, 7).await
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        // Lock contention surfaces as a retryable conflict, never a duplicate
        match handle.await.unwrap() {
            Ok(batch) => {
                for entry in batch {
                    assert!(seen.insert(entry.envelope_id));
                }
            }
            Err(e) => assert!(e.kind().is_retryable(), "unexpected error {e}"),
        }
    }

    let leftover = delivery::drain_and_mark(&db.pool, &bob, 50).await.unwrap();
    for entry in leftover {
        assert!(seen.insert(entry.envelope_id));
    }
    assert_eq!(seen.len(), 20);
}

// ============================================================================
// Retention
// ============================================================================

#[tokio::test]
async fn test_purge_delivered_keeps_pending_and_envelopes() {
    let db = setup_test_db().await;
    let alice = user(&db.pool, 1).await;
    let bob = user(&db.pool, 2).await;

    let (delivered, _) = envelopes::submit_direct(&db.pool, &alice, &bob, &payload(b"a"))
        .await
        .unwrap();
    delivery::drain_and_mark(&db.pool, &bob, 10).await.unwrap();
    envelopes::submit_direct(&db.pool, &alice, &bob, &payload(b"b"))
        .await
        .unwrap();

    assert_eq!(delivery::purge_delivered(&db.pool, unix_now() - 3_600).await.unwrap(), 0);
    assert_eq!(delivery::purge_delivered(&db.pool, unix_now() + 1).await.unwrap(), 1);

    assert_eq!(delivery::pending_count(&db.pool, &bob).await.unwrap(), 1);
    let envelope = envelopes::get_envelope(&db.pool, delivered, &bob).await.unwrap();
    assert_eq!(envelope.ciphertext, Some(b"a".to_vec()));
}

// ============================================================================
// Admin counters
// ============================================================================

#[tokio::test]
async fn test_broker_stats_track_queue_and_sweeper_backlog() {
    let db = setup_test_db().await;
    let alice = user(&db.pool, 1).await;
    let bob = user(&db.pool, 2).await;

    groups::create_group(&db.pool, &GroupId::from("g1"), "G", &alice, &[bob.clone()], None, false)
        .await
        .unwrap();
    envelopes::submit_direct(&db.pool, &alice, &bob, &payload(b"one")).await.unwrap();
    envelopes::submit_direct(&db.pool, &alice, &bob, &payload(b"two")).await.unwrap();
    let (fleeting, _) = envelopes::submit_direct(&db.pool, &alice, &bob, &ephemeral(b"three", 5))
        .await
        .unwrap();

    let stats = database::broker_stats(&db.pool).await.unwrap();
    assert_eq!(
        stats,
        BrokerStats {
            users: 2,
            groups: 1,
            pending_deliveries: 3,
            awaiting_destruction: 1,
            destroyed_envelopes: 0,
        }
    );

    delivery::drain_and_mark(&db.pool, &bob, 50).await.unwrap();
    assert!(envelopes::destroy(&db.pool, fleeting, None).await.unwrap());

    let stats = database::broker_stats(&db.pool).await.unwrap();
    assert_eq!(stats.pending_deliveries, 0);
    assert_eq!(stats.awaiting_destruction, 0);
    assert_eq!(stats.destroyed_envelopes, 1);
}
