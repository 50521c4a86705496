//! Wire protocol tests
//!
//! Frame tagging as seen by clients in MessagePack and JSON, the error
//! taxonomy, and the envelope lifecycle helpers.

use cipherpost_shared::{
    constant_time_eq, ClientFrame, Envelope, EnvelopeKind, EnvelopeStatus, ErrorKind, GroupId,
    Notice, Outcome, Request, Response, RosterEvent, ServerFrame, UserId, WireError,
};
use serde_json::json;

fn direct_envelope(timer: u32, expires_at: Option<i64>, read_at: Option<i64>) -> Envelope {
    Envelope {
        id: 1,
        sender_id: UserId::from("aa"),
        kind: EnvelopeKind::Direct {
            recipient_id: UserId::from("bb"),
        },
        ciphertext: Some(vec![1, 2, 3]),
        content_type: "text/plain".to_string(),
        session_id: None,
        ephemeral_timer: timer,
        expires_at,
        reply_to: None,
        status: if read_at.is_some() {
            EnvelopeStatus::Read
        } else {
            EnvelopeStatus::Sent
        },
        sent_at: 1_000,
        delivered_at: read_at,
        read_at,
        destroyed_at: None,
    }
}

// ============================================================================
// Frames
// ============================================================================

#[test]
fn test_request_tags_are_snake_case() {
    assert_eq!(serde_json::to_value(Request::Ping).unwrap(), json!({ "type": "ping" }));
    assert_eq!(
        serde_json::to_value(Request::PollPending { limit: 5 }).unwrap(),
        json!({ "type": "poll_pending", "limit": 5 })
    );
    assert_eq!(Request::CheckBundleHealth.name(), "check_bundle_health");
    assert_eq!(
        Request::GetGroup { group_id: GroupId::from("g1") }.name(),
        "get_group"
    );
    assert_eq!(
        Request::RedeemDeviceCode { code: String::new() }.name(),
        "redeem_device_code"
    );
}

#[test]
fn test_optional_request_fields_default() {
    let request: Request = serde_json::from_value(json!({
        "type": "send_direct",
        "recipient_id": "bb",
        "ciphertext": [1, 2, 3],
        "content_type": "text/plain",
    }))
    .unwrap();

    match request {
        Request::SendDirect {
            recipient_id,
            session_id,
            ephemeral_timer,
            expires_at,
            reply_to,
            ..
        } => {
            assert_eq!(recipient_id, UserId::from("bb"));
            assert!(session_id.is_none());
            assert!(ephemeral_timer.is_none());
            assert!(expires_at.is_none());
            assert!(reply_to.is_none());
        }
        other => panic!("unexpected request {other:?}"),
    }

    let request: Request = serde_json::from_value(json!({
        "type": "read_group_stream",
        "group_id": "g1",
        "limit": 10,
    }))
    .unwrap();
    assert_eq!(
        request,
        Request::ReadGroupStream {
            group_id: GroupId::from("g1"),
            after_id: 0,
            limit: 10,
        }
    );
}

#[test]
fn test_client_frame_over_messagepack() {
    let frame = ClientFrame {
        id: 42,
        request: Request::DistributeSenderKey {
            group_id: GroupId::from("g1"),
            recipient_id: UserId::from("bb"),
            encrypted_key: vec![0xFF; 256],
            message_type: 3,
            epoch: 7,
        },
    };

    let encoded = rmp_serde::to_vec_named(&frame).expect("Failed to serialize");
    let decoded: ClientFrame = rmp_serde::from_slice(&encoded).expect("Failed to deserialize");
    assert_eq!(decoded, frame);
}

#[test]
fn test_byte_fields_encode_as_msgpack_bin() {
    let ciphertext = vec![0xFF; 1 << 20];
    let frame = ClientFrame {
        id: 1,
        request: Request::SendDirect {
            recipient_id: UserId::from("bb"),
            ciphertext: ciphertext.clone(),
            content_type: "text/plain".to_string(),
            session_id: None,
            ephemeral_timer: None,
            expires_at: None,
            reply_to: None,
        },
    };

    let encoded = rmp_serde::to_vec_named(&frame).unwrap();
    // bin32 marker followed by the big-endian length, then the raw bytes
    let mut header = vec![0xC6];
    header.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
    assert!(encoded.windows(header.len()).any(|w| w == header.as_slice()));
    assert!(encoded.len() < ciphertext.len() + 256);

    let decoded: ClientFrame = rmp_serde::from_slice(&encoded).unwrap();
    assert_eq!(decoded, frame);
}

#[test]
fn test_unknown_request_type_is_rejected() {
    let bytes = rmp_serde::to_vec_named(&json!({
        "id": 1,
        "request": { "type": "drop_tables" },
    }))
    .unwrap();
    assert!(rmp_serde::from_slice::<ClientFrame>(&bytes).is_err());
}

#[test]
fn test_reply_frame_shapes() {
    let ok = ServerFrame::Reply {
        id: 3,
        outcome: Outcome::Ok(Response::ReadMarked { changed: false }),
    };
    assert_eq!(
        serde_json::to_value(&ok).unwrap(),
        json!({
            "frame": "reply",
            "id": 3,
            "outcome": { "ok": { "type": "read_marked", "changed": false } },
        })
    );

    let err = ServerFrame::Reply {
        id: 4,
        outcome: Outcome::Err(WireError::new(ErrorKind::Conflict, "retry")),
    };
    assert_eq!(
        serde_json::to_value(&err).unwrap(),
        json!({
            "frame": "reply",
            "id": 4,
            "outcome": { "err": { "kind": "conflict", "detail": "retry" } },
        })
    );

    let bytes = rmp_serde::to_vec_named(&err).unwrap();
    assert_eq!(rmp_serde::from_slice::<ServerFrame>(&bytes).unwrap(), err);
}

#[test]
fn test_notices_carry_no_payload() {
    let notice = ServerFrame::Notice {
        notice: Notice::RosterChanged {
            group_id: GroupId::from("g1"),
            epoch: 2,
        },
    };
    assert_eq!(
        serde_json::to_value(&notice).unwrap(),
        json!({
            "frame": "notice",
            "notice": { "notice": "roster_changed", "group_id": "g1", "epoch": 2 },
        })
    );
    assert_eq!(
        serde_json::to_value(Notice::PendingDeliveries).unwrap(),
        json!({ "notice": "pending_deliveries" })
    );
}

// ============================================================================
// Error taxonomy
// ============================================================================

#[test]
fn test_error_kind_strings() {
    let kinds = [
        (ErrorKind::Validation, "validation"),
        (ErrorKind::NotFound, "not_found"),
        (ErrorKind::NoBundle, "no_bundle"),
        (ErrorKind::Permission, "permission"),
        (ErrorKind::AlreadyUsed, "already_used"),
        (ErrorKind::Conflict, "conflict"),
        (ErrorKind::Internal, "internal"),
    ];
    for (kind, name) in kinds {
        assert_eq!(kind.as_str(), name);
        assert_eq!(kind.to_string(), name);
        assert_eq!(serde_json::to_value(kind).unwrap(), json!(name));
    }
}

#[test]
fn test_only_conflict_is_retryable() {
    assert!(ErrorKind::Conflict.is_retryable());
    for kind in [
        ErrorKind::Validation,
        ErrorKind::NotFound,
        ErrorKind::NoBundle,
        ErrorKind::Permission,
        ErrorKind::AlreadyUsed,
        ErrorKind::Internal,
    ] {
        assert!(!kind.is_retryable(), "{kind} must be terminal");
    }
}

#[test]
fn test_wire_error_display() {
    let err = WireError::new(ErrorKind::NotFound, "user bb not found");
    assert_eq!(err.to_string(), "not_found: user bb not found");
}

// ============================================================================
// Envelope lifecycle
// ============================================================================

#[test]
fn test_destroy_due_at() {
    // Not destructible
    assert_eq!(direct_envelope(0, None, Some(1_100)).destroy_due_at(), None);

    // Direct timer waits for the read
    assert_eq!(direct_envelope(30, None, None).destroy_due_at(), None);
    assert_eq!(direct_envelope(30, None, Some(1_100)).destroy_due_at(), Some(1_130));

    // Explicit expiry wins
    assert_eq!(direct_envelope(30, Some(1_050), None).destroy_due_at(), Some(1_050));

    // Group timer runs from submission
    let mut group = direct_envelope(30, None, None);
    group.kind = EnvelopeKind::Group {
        group_id: GroupId::from("g1"),
        epoch: 1,
        sender_key_id: 1,
        iteration: 0,
        iv: vec![0; 12],
    };
    assert_eq!(group.destroy_due_at(), Some(1_030));
    assert!(group.is_destructible());

    let mut expired = direct_envelope(30, Some(1_050), Some(1_010));
    expired.status = EnvelopeStatus::Expired;
    expired.ciphertext = None;
    assert_eq!(expired.destroy_due_at(), None);
}

#[test]
fn test_envelope_status_strings() {
    for status in [
        EnvelopeStatus::Sent,
        EnvelopeStatus::Delivered,
        EnvelopeStatus::Read,
        EnvelopeStatus::Expired,
    ] {
        assert_eq!(status.as_str().parse::<EnvelopeStatus>().unwrap(), status);
    }
    assert!("pending".parse::<EnvelopeStatus>().is_err());
}

#[test]
fn test_envelope_kind_tag() {
    let envelope = direct_envelope(0, None, None);
    let value = serde_json::to_value(&envelope).unwrap();
    assert_eq!(value["kind"]["variant"], json!("direct"));
    assert_eq!(value["status"], json!("sent"));
    assert_eq!(envelope.kind.tag(), "direct");
    assert!(envelope.kind.group_id().is_none());
}

#[test]
fn test_membership_events_rotate_epoch() {
    let alice = UserId::from("aa");
    let bob = UserId::from("bb");

    assert!(RosterEvent::MemberAdded {
        member_id: bob.clone(),
        added_by: alice.clone(),
        admin: false,
    }
    .changes_membership());
    assert!(RosterEvent::MemberLeft { member_id: bob.clone() }.changes_membership());
    assert!(!RosterEvent::AdminChanged {
        member_id: bob.clone(),
        admin: true,
        changed_by: alice.clone(),
    }
    .changes_membership());
    assert!(!RosterEvent::PostingPolicyChanged {
        only_admins_post: true,
        changed_by: alice,
    }
    .changes_membership());
}

// ============================================================================
// Identifiers
// ============================================================================

#[test]
fn test_user_id_from_pubkey() {
    let id = UserId::from_pubkey(&[0xAB; 32]);
    assert_eq!(id.as_str().len(), 64);
    assert_eq!(id.short(), "abababababababab");
    assert_eq!(serde_json::to_value(&id).unwrap(), json!(id.as_str()));
    assert_eq!(GroupId::from("short").short(), "short");
}

#[test]
fn test_constant_time_eq() {
    assert!(constant_time_eq(b"token", b"token"));
    assert!(!constant_time_eq(b"token", b"tokem"));
    assert!(!constant_time_eq(b"token", b"token!"));
}
