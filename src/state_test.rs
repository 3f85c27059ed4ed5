use super::*;

#[test]
fn user_id_parse_trims() {
    let id = UserId::parse("  65f0a1b2c3  ").unwrap();
    assert_eq!(id.as_str(), "65f0a1b2c3");
    assert_eq!(id.to_string(), "65f0a1b2c3");
}

#[test]
fn user_id_parse_rejects_blank() {
    assert!(UserId::parse("").is_none());
    assert!(UserId::parse("   ").is_none());
}

#[test]
fn user_id_serializes_as_plain_string() {
    let id = test_helpers::user("u1");
    assert_eq!(serde_json::to_value(&id).unwrap(), serde_json::json!("u1"));
}

#[test]
fn chat_message_uses_snake_case_and_rfc3339() {
    let msg = ChatMessage {
        id: Uuid::nil(),
        sender_id: test_helpers::user("u1"),
        sender_name: "Alice".into(),
        message: "hi".into(),
        timestamp: time::macros::datetime!(2024-03-01 12:00:00 UTC),
    };
    let json = serde_json::to_value(&msg).unwrap();
    assert_eq!(json["sender_id"], "u1");
    assert_eq!(json["sender_name"], "Alice");
    assert_eq!(json["message"], "hi");
    assert_eq!(json["timestamp"], "2024-03-01T12:00:00Z");

    let restored: ChatMessage = serde_json::from_value(json).unwrap();
    assert_eq!(restored, msg);
}

#[tokio::test]
async fn test_app_state_starts_empty() {
    let state = test_helpers::test_app_state();
    assert!(state.store.list_ordered_by_time().await.unwrap().is_empty());
    assert_eq!(state.hub.client_count().await, 0);
    assert!(state.hub.active_users().await.is_empty());
}
