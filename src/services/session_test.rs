use super::*;
use crate::frame::{ErrorCode, Status};
use crate::services::hub::{SYSCALL_MESSAGE, SYSCALL_USERS};
use crate::state::test_helpers::{self, UnavailableStore, user};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::timeout;

async fn recv(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("session receive timed out")
        .expect("session channel closed unexpectedly")
}

async fn assert_no_frame(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected no frame"
    );
}

async fn connected(state: &AppState) -> (ChatSession, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(32);
    let mut session = ChatSession::new(state, Uuid::new_v4());
    session.on_connect(tx).await.expect("history read");
    (session, rx)
}

async fn identified(state: &AppState, user_id: &str) -> (ChatSession, mpsc::Receiver<Frame>) {
    let (mut session, mut rx) = connected(state).await;
    session.on_identify(Some(user_id)).await.expect("identify");
    let snapshot = recv(&mut rx).await;
    assert_eq!(snapshot.syscall, SYSCALL_USERS);
    (session, rx)
}

fn send(sender_id: Option<&str>, name: &str, text: &str) -> SendMessage {
    SendMessage {
        sender_id: sender_id.map(str::to_string),
        sender_name: Some(name.into()),
        message: Some(text.into()),
    }
}

fn users_of(frame: &Frame) -> Vec<String> {
    serde_json::from_value(frame.data["users"].clone()).expect("users array")
}

// =============================================================================
// on_connect
// =============================================================================

#[tokio::test]
async fn connect_returns_history_in_order() {
    let state = test_helpers::test_app_state();
    let (mut alice, _rx) = identified(&state, "u1").await;
    let m1 = alice.on_send_message(send(Some("u1"), "Alice", "one")).await.unwrap();
    let m2 = alice.on_send_message(send(Some("u1"), "Alice", "two")).await.unwrap();

    let (tx, _rx2) = mpsc::channel(8);
    let mut late = ChatSession::new(&state, Uuid::new_v4());
    let history = late.on_connect(tx).await.unwrap();
    assert_eq!(history, vec![m1, m2]);
    assert_eq!(late.state(), &SessionState::Connecting);
}

#[tokio::test]
async fn connect_with_unavailable_store_keeps_session_open() {
    let state = test_helpers::test_app_state_with_store(Arc::new(UnavailableStore));
    let (tx, _rx) = mpsc::channel(8);
    let mut session = ChatSession::new(&state, Uuid::new_v4());

    let err = session.on_connect(tx).await.unwrap_err();
    assert!(matches!(err, ChatError::StoreUnavailable(_)));
    assert!(err.retryable());
    assert_eq!(state.hub.client_count().await, 1);

    // Still able to identify afterwards.
    session.on_identify(Some("u1")).await.unwrap();
    assert_eq!(state.hub.active_users().await, vec![user("u1")]);
}

// =============================================================================
// on_identify
// =============================================================================

#[tokio::test]
async fn identify_transitions_and_broadcasts_to_all() {
    let state = test_helpers::test_app_state();
    let (_a, mut rx_a) = identified(&state, "u1").await;
    let (mut b, mut rx_b) = connected(&state).await;

    let user_id = b.on_identify(Some(" u2 ")).await.unwrap();
    assert_eq!(user_id, user("u2"));
    assert_eq!(b.state(), &SessionState::Identified(user("u2")));

    assert_eq!(users_of(&recv(&mut rx_a).await), vec!["u1", "u2"]);
    assert_eq!(users_of(&recv(&mut rx_b).await), vec!["u1", "u2"]);
}

#[tokio::test]
async fn identify_requires_user_id() {
    let state = test_helpers::test_app_state();
    let (mut s, mut rx) = connected(&state).await;

    assert!(matches!(s.on_identify(None).await, Err(ChatError::MalformedPayload(_))));
    assert!(matches!(s.on_identify(Some("  ")).await, Err(ChatError::MalformedPayload(_))));
    assert_eq!(s.state(), &SessionState::Connecting);
    assert_no_frame(&mut rx).await;
}

#[tokio::test]
async fn identify_as_different_user_is_rejected() {
    let state = test_helpers::test_app_state();
    let (mut s, mut rx) = identified(&state, "u1").await;

    let err = s.on_identify(Some("u2")).await.unwrap_err();
    assert!(matches!(err, ChatError::AlreadyIdentified(ref u) if *u == user("u1")));
    assert_eq!(err.error_code(), "E_ALREADY_IDENTIFIED");
    assert_eq!(state.hub.active_users().await, vec![user("u1")]);
    assert_no_frame(&mut rx).await;
}

#[tokio::test]
async fn re_identify_same_user_rebroadcasts() {
    let state = test_helpers::test_app_state();
    let (mut s, mut rx) = identified(&state, "u1").await;

    s.on_identify(Some("u1")).await.unwrap();
    assert_eq!(users_of(&recv(&mut rx).await), vec!["u1"]);
}

#[tokio::test]
async fn identify_after_eviction_closes_session() {
    let state = test_helpers::test_app_state();
    let (mut s, _rx) = connected(&state).await;
    state.hub.detach(s.client_id()).await;

    assert!(matches!(s.on_identify(Some("u1")).await, Err(ChatError::SessionClosed)));
    assert_eq!(s.state(), &SessionState::Closed);
    assert!(state.hub.active_users().await.is_empty());
}

// =============================================================================
// on_send_message
// =============================================================================

#[tokio::test]
async fn two_sessions_both_receive_new_message() {
    let state = test_helpers::test_app_state();
    let (mut a, mut rx_a) = identified(&state, "u1").await;
    let (_b, mut rx_b) = identified(&state, "u2").await;
    recv(&mut rx_a).await; // snapshot from B's identify

    let began = OffsetDateTime::now_utc();
    let persisted = a.on_send_message(send(Some("u1"), "Alice", "hello")).await.unwrap();
    assert!(persisted.timestamp >= began);

    for rx in [&mut rx_a, &mut rx_b] {
        let frame = recv(rx).await;
        assert_eq!(frame.syscall, SYSCALL_MESSAGE);
        assert_eq!(frame.status, Status::Request);
        assert_eq!(frame.data_str("message"), Some("hello"));
        assert_eq!(frame.data_str("sender_id"), Some("u1"));
        assert_eq!(frame.data_str("sender_name"), Some("Alice"));
        assert_eq!(frame.data_str("id"), Some(persisted.id.to_string().as_str()));
    }
}

#[tokio::test]
async fn sequential_messages_have_strictly_increasing_timestamps() {
    let state = test_helpers::test_app_state();
    let (mut a, _rx) = identified(&state, "u1").await;

    let m1 = a.on_send_message(send(None, "Alice", "M1")).await.unwrap();
    let m2 = a.on_send_message(send(None, "Alice", "M2")).await.unwrap();
    assert!(m1.timestamp < m2.timestamp);
}

#[tokio::test]
async fn omitted_sender_id_defaults_to_bound_identity() {
    let state = test_helpers::test_app_state();
    let (mut a, _rx) = identified(&state, "u1").await;

    let m = a.on_send_message(send(None, "Alice", "hi")).await.unwrap();
    assert_eq!(m.sender_id, user("u1"));
}

#[tokio::test]
async fn send_before_identify_is_rejected() {
    let state = test_helpers::test_app_state();
    let (mut s, mut rx) = connected(&state).await;

    let err = s.on_send_message(send(Some("u1"), "Alice", "hi")).await.unwrap_err();
    assert!(matches!(err, ChatError::NotIdentified));
    assert!(state.store.list_ordered_by_time().await.unwrap().is_empty());
    assert_no_frame(&mut rx).await;
}

#[tokio::test]
async fn spoofed_sender_id_is_rejected() {
    let state = test_helpers::test_app_state();
    let (mut s, mut rx) = identified(&state, "u1").await;

    let err = s.on_send_message(send(Some("u2"), "Mallory", "hi")).await.unwrap_err();
    assert!(matches!(err, ChatError::IdentityMismatch { .. }));
    assert_eq!(err.error_code(), "E_IDENTITY_MISMATCH");
    assert!(state.store.list_ordered_by_time().await.unwrap().is_empty());
    assert_no_frame(&mut rx).await;
}

#[tokio::test]
async fn malformed_payloads_are_not_persisted_or_broadcast() {
    let state = test_helpers::test_app_state();
    let (mut s, mut rx) = identified(&state, "u1").await;
    let too_long = "x".repeat(state.chat.max_message_len + 1);

    let cases = [
        SendMessage { sender_id: None, sender_name: Some("Alice".into()), message: None },
        SendMessage { sender_id: None, sender_name: Some("Alice".into()), message: Some("   ".into()) },
        SendMessage { sender_id: None, sender_name: None, message: Some("hi".into()) },
        SendMessage { sender_id: None, sender_name: Some(" ".into()), message: Some("hi".into()) },
        SendMessage { sender_id: None, sender_name: Some("Alice".into()), message: Some(too_long) },
    ];
    for payload in cases {
        let err = s.on_send_message(payload.clone()).await.unwrap_err();
        assert!(matches!(err, ChatError::MalformedPayload(_)), "{payload:?}");
        assert_eq!(err.error_code(), "E_MALFORMED_PAYLOAD");
    }
    assert!(state.store.list_ordered_by_time().await.unwrap().is_empty());
    assert_no_frame(&mut rx).await;
}

#[tokio::test]
async fn message_at_max_length_is_accepted() {
    let state = test_helpers::test_app_state();
    let (mut s, _rx) = identified(&state, "u1").await;
    let exact = "é".repeat(state.chat.max_message_len);

    let m = s.on_send_message(send(None, "Alice", &exact)).await.unwrap();
    assert_eq!(m.message.chars().count(), state.chat.max_message_len);
}

#[tokio::test]
async fn failed_persist_is_not_broadcast() {
    let state = test_helpers::test_app_state_with_store(Arc::new(UnavailableStore));
    let (tx_a, mut rx_a) = mpsc::channel(8);
    let (tx_b, mut rx_b) = mpsc::channel(8);
    let mut a = ChatSession::new(&state, Uuid::new_v4());
    let mut b = ChatSession::new(&state, Uuid::new_v4());
    let _ = a.on_connect(tx_a).await;
    let _ = b.on_connect(tx_b).await;
    a.on_identify(Some("u1")).await.unwrap();
    recv(&mut rx_a).await;
    recv(&mut rx_b).await;

    let err = a.on_send_message(send(Some("u1"), "Alice", "lost")).await.unwrap_err();
    assert!(matches!(err, ChatError::StoreUnavailable(_)));
    assert_no_frame(&mut rx_a).await;
    assert_no_frame(&mut rx_b).await;
}

// =============================================================================
// on_disconnect
// =============================================================================

#[tokio::test]
async fn disconnect_is_idempotent() {
    let state = test_helpers::test_app_state();
    let (mut a, _rx_a) = identified(&state, "u1").await;
    let (_b, mut rx_b) = identified(&state, "u2").await;

    assert!(a.on_disconnect().await);
    assert_eq!(a.state(), &SessionState::Closed);
    assert_eq!(users_of(&recv(&mut rx_b).await), vec!["u2"]);

    assert!(!a.on_disconnect().await);
    assert_no_frame(&mut rx_b).await;
}

#[tokio::test]
async fn closed_session_rejects_further_events() {
    let state = test_helpers::test_app_state();
    let (mut a, _rx) = identified(&state, "u1").await;
    a.on_disconnect().await;

    assert!(matches!(a.on_identify(Some("u1")).await, Err(ChatError::SessionClosed)));
    assert!(matches!(
        a.on_send_message(send(None, "Alice", "late")).await,
        Err(ChatError::SessionClosed)
    ));
    let (tx, _rx2) = mpsc::channel(1);
    assert!(matches!(a.on_connect(tx).await, Err(ChatError::SessionClosed)));
    assert!(state.hub.active_users().await.is_empty());
}

#[tokio::test]
async fn disconnect_unidentified_session_is_silent() {
    let state = test_helpers::test_app_state();
    let (mut anon, _rx) = connected(&state).await;
    let (_b, mut rx_b) = identified(&state, "u2").await;

    assert!(!anon.on_disconnect().await);
    assert_no_frame(&mut rx_b).await;
    assert_eq!(state.hub.client_count().await, 1);
}

#[tokio::test]
async fn scenario_two_users_chat_then_one_leaves() {
    let state = test_helpers::test_app_state();
    let (mut a, mut rx_a) = identified(&state, "u1").await;
    let (_b, mut rx_b) = identified(&state, "u2").await;
    recv(&mut rx_a).await;

    a.on_send_message(send(Some("u1"), "Alice", "hello")).await.unwrap();
    for rx in [&mut rx_a, &mut rx_b] {
        let f = recv(rx).await;
        assert_eq!(f.data_str("message"), Some("hello"));
        assert_eq!(f.data_str("sender_id"), Some("u1"));
    }

    a.on_disconnect().await;
    assert_eq!(users_of(&recv(&mut rx_b).await), vec!["u2"]);
}
