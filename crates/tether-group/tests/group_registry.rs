//! Integration tests for group membership and presence fan-out.

use serde_json::json;
use tether_group::{Delivery, GroupError, GroupKey, GroupRegistry, Recipient};
use tether_protocol::{OutboundBody, OutboundKind};
use tether_session::SessionId;

// =========================================================================
// Helpers
// =========================================================================

fn lobby() -> GroupKey {
    GroupKey::new("chat", "lobby")
}

fn sid(s: &str) -> SessionId {
    SessionId::from(s)
}

/// `(recipient, frame type)` pairs, for compact assertions.
fn summary(deliveries: &[Delivery]) -> Vec<(String, OutboundKind)> {
    deliveries
        .iter()
        .map(|d| (d.to.to_string(), d.body.kind()))
        .collect()
}

fn presence_user(delivery: &Delivery) -> &str {
    match &delivery.body {
        OutboundBody::Enter(p) | OutboundBody::Exit(p) => &p.user,
        other => panic!("expected presence, got {other:?}"),
    }
}

// =========================================================================
// Presence
// =========================================================================

#[test]
fn test_new_identity_is_announced_to_existing_members() {
    let mut reg = GroupRegistry::new();
    reg.join(&lobby(), &sid("a"), "alice", None).unwrap();
    reg.join(&lobby(), &sid("b"), "bob", None).unwrap();

    let out = reg.join(&lobby(), &sid("c"), "carol", Some(1)).unwrap();
    assert_eq!(
        summary(&out),
        vec![
            ("a".into(), OutboundKind::Enter),
            ("b".into(), OutboundKind::Enter),
            ("c".into(), OutboundKind::Join),
        ]
    );
    assert_eq!(presence_user(&out[0]), "carol");

    match &out[2].body {
        OutboundBody::Join(body) => {
            assert_eq!(body.users, vec!["alice", "bob", "carol"]);
        }
        other => panic!("expected join, got {other:?}"),
    }
}

#[test]
fn test_second_session_of_same_identity_is_not_announced() {
    let mut reg = GroupRegistry::new();
    reg.join(&lobby(), &sid("s1"), "u1", None).unwrap();

    let out = reg.join(&lobby(), &sid("s2"), "u1", None).unwrap();
    assert_eq!(summary(&out), vec![("s2".into(), OutboundKind::Join)]);

    match &out[0].body {
        OutboundBody::Join(body) => assert_eq!(body.users, vec!["u1"]),
        other => panic!("expected join, got {other:?}"),
    }
}

#[test]
fn test_leave_while_identity_remains_sends_no_exit() {
    let mut reg = GroupRegistry::new();
    reg.join(&lobby(), &sid("s1"), "u1", None).unwrap();
    reg.join(&lobby(), &sid("s2"), "u1", None).unwrap();

    let out = reg.leave(&lobby(), &sid("s1")).unwrap();
    assert_eq!(summary(&out), vec![("s1".into(), OutboundKind::Leave)]);
    assert_eq!(reg.users(&lobby()), vec!["u1"]);
}

#[test]
fn test_last_session_of_identity_leaving_sends_exit() {
    let mut reg = GroupRegistry::new();
    reg.join(&lobby(), &sid("a"), "alice", None).unwrap();
    reg.join(&lobby(), &sid("b"), "bob", None).unwrap();

    let out = reg.leave(&lobby(), &sid("b")).unwrap();
    assert_eq!(
        summary(&out),
        vec![
            ("a".into(), OutboundKind::Exit),
            ("b".into(), OutboundKind::Leave),
        ]
    );
    assert_eq!(presence_user(&out[0]), "bob");
}

// =========================================================================
// Close
// =========================================================================

#[test]
fn test_close_sends_leave_to_every_member_and_deletes() {
    let mut reg = GroupRegistry::new();
    reg.join(&lobby(), &sid("a"), "alice", None).unwrap();
    reg.join(&lobby(), &sid("b"), "bob", None).unwrap();

    let out = reg.close(&lobby()).unwrap();
    assert_eq!(
        summary(&out),
        vec![
            ("a".into(), OutboundKind::Leave),
            ("b".into(), OutboundKind::Leave),
        ]
    );
    assert!(!reg.contains(&lobby()));
    assert!(reg.groups_of(&sid("a")).is_empty());
    assert_eq!(reg.group_count(), 0);
}

#[test]
fn test_close_missing_group() {
    let mut reg = GroupRegistry::new();
    assert!(matches!(reg.close(&lobby()), Err(GroupError::NotFound(_))));
}

// =========================================================================
// Events
// =========================================================================

fn populated() -> GroupRegistry {
    let mut reg = GroupRegistry::new();
    reg.join(&lobby(), &sid("a1"), "alice", None).unwrap();
    reg.join(&lobby(), &sid("a2"), "alice", None).unwrap();
    reg.join(&lobby(), &sid("b"), "bob", None).unwrap();
    reg
}

fn targets(reg: &GroupRegistry, recipient: Recipient) -> Vec<String> {
    reg.event(&lobby(), &recipient, "message", json!({"text": "hi"}))
        .unwrap()
        .into_iter()
        .map(|d| d.to.to_string())
        .collect()
}

#[test]
fn test_event_recipients() {
    let reg = populated();
    assert_eq!(targets(&reg, Recipient::All), vec!["a1", "a2", "b"]);
    assert_eq!(targets(&reg, Recipient::Session(sid("b"))), vec!["b"]);
    assert_eq!(
        targets(&reg, Recipient::User("alice".into())),
        vec!["a1", "a2"]
    );
    assert_eq!(
        targets(&reg, Recipient::AllExcept(sid("a1"))),
        vec!["a2", "b"]
    );
}

#[test]
fn test_event_never_reaches_non_members() {
    let reg = populated();
    assert!(targets(&reg, Recipient::Session(sid("stranger"))).is_empty());
    assert!(targets(&reg, Recipient::User("mallory".into())).is_empty());
}

#[test]
fn test_event_payload_shape() {
    let reg = populated();
    let out = reg
        .event(&lobby(), &Recipient::Session(sid("b")), "message", json!(1))
        .unwrap();
    match &out[0].body {
        OutboundBody::Event(e) => {
            assert_eq!(e.service, "chat");
            assert_eq!(e.group, "lobby");
            assert_eq!(e.kind, "message");
            assert_eq!(e.data, json!(1));
        }
        other => panic!("expected event, got {other:?}"),
    }
}

#[test]
fn test_event_to_missing_group() {
    let reg = GroupRegistry::new();
    let err = reg
        .event(&lobby(), &Recipient::All, "message", json!(null))
        .unwrap_err();
    assert_eq!(err.code().as_u16(), 404);
}
