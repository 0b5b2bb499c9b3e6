use roomsync::backend::{Backend, MemoryBackend};
use roomsync::session::{Operation, RoomSession, SessionConfig, SessionError, SessionSnapshot};
use roomsync::types::{NewMessage, SenderKind};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn spawn_session(memory: &Arc<MemoryBackend>, config: SessionConfig) -> RoomSession {
    RoomSession::spawn(Backend::from_shared(memory.clone()), config)
}

async fn wait_until(session: &RoomSession, pred: impl FnMut(&SessionSnapshot) -> bool) {
    let mut rx = session.watch();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(pred))
        .await
        .expect("timed out waiting for session state")
        .expect("session actor stopped");
}

/// Create a room, receive an external write, then survive a redelivery
#[tokio::test]
async fn test_create_receive_and_redeliver() {
    let memory = Arc::new(MemoryBackend::new());
    let session = spawn_session(
        &memory,
        SessionConfig {
            code_generator: || "K7M2QZ".to_string(),
            ..SessionConfig::default()
        },
    );

    // 1. Create room
    let room = session.create_room().await.expect("room should be created");
    assert_eq!(room.code, "K7M2QZ");

    // 2. History of a new room is empty
    let history = session.load_history().await.unwrap();
    assert!(history.is_empty());

    // 3. Another client writes "hi"
    let stored = memory
        .insert_external(NewMessage {
            room_id: room.id.clone(),
            sender_type: SenderKind::Partner,
            text: "hi".to_string(),
        })
        .await
        .unwrap();

    wait_until(&session, |s| s.messages.len() == 1).await;
    let messages = session.messages();
    assert_eq!(messages[0].id, stored.id);
    assert_eq!(messages[0].text, "hi");
    assert_eq!(messages[0].sender_type, SenderKind::Partner);

    // 4. Redeliver the same record, followed by a marker payload that fails to
    //    decode so we know the redelivery has been processed
    memory
        .publish_raw(&room.id, serde_json::to_value(&stored).unwrap())
        .await;
    memory.publish_raw(&room.id, json!({"marker": true})).await;

    wait_until(&session, |s| s.decode_failures == 1).await;
    assert_eq!(session.messages().len(), 1);
}

#[tokio::test]
async fn test_join_unknown_code() {
    let memory = Arc::new(MemoryBackend::new());
    let session = spawn_session(&memory, SessionConfig::default());

    let result = session.join_room("bad1").await;
    assert_eq!(result, Err(SessionError::RoomNotFound("BAD1".to_string())));
    assert!(session.active_room().is_none());
    assert!(!session.snapshot().subscribed);
}

#[tokio::test]
async fn test_join_is_case_insensitive() {
    let memory = Arc::new(MemoryBackend::new());
    let host = spawn_session(&memory, SessionConfig::default());
    let room = host.create_room().await.unwrap();

    let upper = spawn_session(&memory, SessionConfig::default());
    let lower = spawn_session(&memory, SessionConfig::default());

    let a = upper.join_room(&room.code).await.unwrap();
    let b = lower.join_room(&room.code.to_lowercase()).await.unwrap();
    assert_eq!(a, room);
    assert_eq!(b, room);
}

/// Two clients in one room both see every message, including their own echo
#[tokio::test]
async fn test_two_clients_chat() {
    let memory = Arc::new(MemoryBackend::new());
    let me = spawn_session(&memory, SessionConfig::default());
    let partner = spawn_session(
        &memory,
        SessionConfig {
            sender_kind: SenderKind::Partner,
            ..SessionConfig::default()
        },
    );

    let room = me.create_room().await.unwrap();
    partner.join_room(&room.code).await.unwrap();

    me.send_message("hey").await.unwrap();
    wait_until(&me, |s| s.messages.len() == 1).await;
    wait_until(&partner, |s| s.messages.len() == 1).await;

    partner.send_message("hi back").await.unwrap();
    wait_until(&me, |s| s.messages.len() == 2).await;
    wait_until(&partner, |s| s.messages.len() == 2).await;

    let texts: Vec<String> = me.messages().into_iter().map(|m| m.text).collect();
    assert_eq!(texts, vec!["hey", "hi back"]);
    assert_eq!(partner.messages(), me.messages());
    assert_eq!(me.messages()[1].sender_type, SenderKind::Partner);
}

/// Joining later loads the existing history
#[tokio::test]
async fn test_join_loads_history() {
    let memory = Arc::new(MemoryBackend::new());
    let host = spawn_session(&memory, SessionConfig::default());
    let room = host.create_room().await.unwrap();

    for text in ["one", "two", "three"] {
        host.send_message(text).await.unwrap();
    }

    let guest = spawn_session(&memory, SessionConfig::default());
    guest.join_room(&room.code).await.unwrap();

    let texts: Vec<String> = guest.messages().into_iter().map(|m| m.text).collect();
    assert_eq!(texts, vec!["one", "two", "three"]);

    // Loading again is idempotent
    let again = guest.load_history().await.unwrap();
    assert_eq!(again, guest.messages());
    assert_eq!(again.len(), 3);
}

/// Switching rooms releases the old feed; nothing from the old room leaks in
#[tokio::test]
async fn test_switching_rooms_releases_old_feed() {
    let memory = Arc::new(MemoryBackend::new());
    let other = spawn_session(&memory, SessionConfig::default());
    let first = other.create_room().await.unwrap();

    let session = spawn_session(&memory, SessionConfig::default());
    session.join_room(&first.code).await.unwrap();
    other.send_message("in first").await.unwrap();
    wait_until(&session, |s| s.messages.len() == 1).await;

    let second = session.create_room().await.unwrap();
    assert_eq!(session.active_room(), Some(second.clone()));
    assert!(session.messages().is_empty());

    // Old room keeps talking; new room gets one message
    other.send_message("still in first").await.unwrap();
    memory
        .insert_external(NewMessage {
            room_id: second.id.clone(),
            sender_type: SenderKind::Ai,
            text: "welcome".to_string(),
        })
        .await
        .unwrap();

    wait_until(&session, |s| !s.messages.is_empty()).await;
    // A foreign-room payload pushed straight at the new feed is filtered too
    memory
        .publish_raw(
            &second.id,
            json!({
                "id": "stray",
                "room_id": first.id,
                "sender_type": "user",
                "text": "wrong room",
            }),
        )
        .await;
    memory.publish_raw(&second.id, json!("marker")).await;
    wait_until(&session, |s| s.decode_failures == 1).await;

    let texts: Vec<String> = session.messages().into_iter().map(|m| m.text).collect();
    assert_eq!(texts, vec!["welcome"]);
}

#[tokio::test]
async fn test_unsubscribe_stops_live_updates() {
    let memory = Arc::new(MemoryBackend::new());
    let session = spawn_session(&memory, SessionConfig::default());
    let room = session.create_room().await.unwrap();

    session.unsubscribe().await.unwrap();
    assert!(!session.snapshot().subscribed);

    session.send_message("into the void").await.unwrap();
    assert_eq!(memory.store_writes(), 1);
    // Feed is gone, so the echo never arrives; history still has it
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.messages().is_empty());

    let history = session.load_history().await.unwrap();
    assert_eq!(history.len(), 1);

    // Resubscribing brings live updates back
    session.subscribe().await.unwrap();
    memory
        .insert_external(NewMessage {
            room_id: room.id.clone(),
            sender_type: SenderKind::Partner,
            text: "back".to_string(),
        })
        .await
        .unwrap();
    wait_until(&session, |s| s.messages.len() == 2).await;
}

#[tokio::test]
async fn test_failed_send_reports_backend_error() {
    let memory = Arc::new(MemoryBackend::new());
    let session = spawn_session(&memory, SessionConfig::default());
    session.create_room().await.unwrap();

    memory.set_available(false);
    let result = session.send_message("hello").await;
    assert!(matches!(result, Err(SessionError::BackendUnavailable(_))));
    assert!(result.unwrap_err().to_string().starts_with("Could not reach the server"));
    assert_eq!(memory.store_writes(), 0);
}

#[tokio::test]
async fn test_overlapping_create_is_rejected() {
    let memory = Arc::new(MemoryBackend::new());
    let session = spawn_session(&memory, SessionConfig::default());

    let (first, second) = tokio::join!(session.create_room(), session.create_room());

    // The second call starts while the first is still waiting on the actor
    assert!(first.is_ok());
    assert_eq!(second, Err(SessionError::Busy(Operation::CreateRoom)));
    assert_eq!(memory.directory_calls(), 1);

    // Once finished, creating again is allowed
    assert!(session.create_room().await.is_ok());
}

#[tokio::test]
async fn test_dropping_all_handles_releases_feed() {
    let memory = Arc::new(MemoryBackend::new());
    let session = spawn_session(&memory, SessionConfig::default());
    let room = session.create_room().await.unwrap();
    let mut rx = session.watch();
    drop(session);

    // The actor drops its snapshot sender once it has shut down
    tokio::time::timeout(Duration::from_secs(2), async {
        while rx.changed().await.is_ok() {}
    })
    .await
    .expect("actor should stop");
    // let the aborted forwarder task be dropped
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(memory.publish_raw(&room.id, json!({})).await, 0);
}
