//! Client-side room session: create or join a room, load its history and
//! stay live-updated through the change feed.
//!
//! [`RoomSession`] is a cheap-to-clone handle. All state lives in a single
//! actor task that processes one command at a time; readers get a
//! [`SessionSnapshot`] through a watch channel.

mod actor;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use crate::backend::{Backend, BackendError};
use crate::code::{generate_room_code, normalize_code};
use crate::types::{Message, Room, SenderKind};
use actor::{SessionActor, SessionCommand};

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced to the user. Display strings are meant to be shown as-is.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("Enter a room code.")]
    InvalidCode,

    #[error("No room found with code {0}. Double-check and try again.")]
    RoomNotFound(String),

    #[error("Room code {0} is already taken. Please try again.")]
    DuplicateCode(String),

    #[error("Could not reach the server: {0}")]
    BackendUnavailable(String),

    #[error("Type a message before sending.")]
    EmptyMessage,

    #[error("Create or join a room first.")]
    NoActiveRoom,

    #[error("Received a message that could not be read: {0}")]
    DecodeFailure(String),

    #[error("{0} is already in progress.")]
    Busy(Operation),

    #[error("This room session has been closed.")]
    Closed,
}

impl From<BackendError> for SessionError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::DuplicateCode(code) => SessionError::DuplicateCode(code),
            BackendError::Decode(msg) => SessionError::DecodeFailure(msg),
            BackendError::NotFound => {
                SessionError::BackendUnavailable("the room no longer exists".to_string())
            }
            BackendError::Unavailable(msg) => SessionError::BackendUnavailable(msg),
        }
    }
}

/// Operations guarded against overlapping calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateRoom,
    JoinRoom,
    LoadHistory,
    SendMessage,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::CreateRoom => "Creating a room",
            Operation::JoinRoom => "Joining a room",
            Operation::LoadHistory => "Loading messages",
            Operation::SendMessage => "Sending a message",
        })
    }
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Tag written on messages this client sends
    pub sender_kind: SenderKind,
    /// Queued commands (including feed events) before callers wait
    pub command_capacity: usize,
    /// Source of codes for new rooms
    pub code_generator: fn() -> String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sender_kind: SenderKind::User,
            command_capacity: 64,
            code_generator: generate_room_code,
        }
    }
}

/// What the presentation layer renders
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub active_room: Option<Room>,
    /// Ascending by created_at, no duplicate ids
    pub messages: Vec<Message>,
    /// Whether a live feed is currently held
    pub subscribed: bool,
    /// Feed payloads dropped because they didn't decode
    pub decode_failures: u64,
    pub last_decode_error: Option<String>,
}

#[derive(Default)]
struct InFlight {
    create_room: AtomicBool,
    join_room: AtomicBool,
    load_history: AtomicBool,
    send_message: AtomicBool,
}

impl InFlight {
    fn flag(&self, op: Operation) -> &AtomicBool {
        match op {
            Operation::CreateRoom => &self.create_room,
            Operation::JoinRoom => &self.join_room,
            Operation::LoadHistory => &self.load_history,
            Operation::SendMessage => &self.send_message,
        }
    }

    fn begin(&self, op: Operation) -> SessionResult<InFlightGuard<'_>> {
        let flag = self.flag(op);
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SessionError::Busy(op))?;
        Ok(InFlightGuard(flag))
    }
}

/// Clears the in-flight flag when the call finishes or is dropped
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle to a running room session (cheap to Clone).
#[derive(Clone)]
pub struct RoomSession {
    command_tx: mpsc::Sender<SessionCommand>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    in_flight: Arc<InFlight>,
}

impl RoomSession {
    /// Start a session against the given backend. Must be called inside a tokio runtime.
    pub fn spawn(backend: Backend, config: SessionConfig) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let actor = SessionActor::new(backend, config, snapshot_tx, command_tx.downgrade());
        tokio::spawn(actor.run(command_rx));

        Self {
            command_tx,
            snapshot_rx,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Create a new room and make it the active one
    pub async fn create_room(&self) -> SessionResult<Room> {
        let _guard = self.in_flight.begin(Operation::CreateRoom)?;
        self.request(|reply| SessionCommand::CreateRoom { reply }).await
    }

    /// Join an existing room by code (case and surrounding whitespace ignored)
    pub async fn join_room(&self, code: &str) -> SessionResult<Room> {
        let code = normalize_code(code).ok_or(SessionError::InvalidCode)?;
        let _guard = self.in_flight.begin(Operation::JoinRoom)?;
        self.request(|reply| SessionCommand::JoinRoom { code, reply }).await
    }

    /// Re-fetch the active room's messages, replacing the local list
    pub async fn load_history(&self) -> SessionResult<Vec<Message>> {
        let _guard = self.in_flight.begin(Operation::LoadHistory)?;
        self.request(|reply| SessionCommand::LoadHistory { reply }).await
    }

    /// (Re)open the live feed for the active room
    pub async fn subscribe(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Subscribe { reply }).await
    }

    /// Release the live feed. A no-op when none is held.
    pub async fn unsubscribe(&self) -> SessionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Unsubscribe { reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Write a message to the active room.
    ///
    /// The message is not added locally; it shows up once the feed echoes it back.
    pub async fn send_message(&self, text: &str) -> SessionResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let _guard = self.in_flight.begin(Operation::SendMessage)?;
        let text = text.to_string();
        self.request(|reply| SessionCommand::SendMessage { text, reply }).await
    }

    /// Tear the session down: release the feed and stop the actor.
    /// Idempotent; later operations fail with `Closed`.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(SessionCommand::Close { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Current state
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver that is notified on every state change
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn active_room(&self) -> Option<Room> {
        self.snapshot_rx.borrow().active_room.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.snapshot_rx.borrow().messages.clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<SessionResult<T>>) -> SessionCommand,
    ) -> SessionResult<T> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(make(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, RoomDirectory};
    use std::time::Duration;

    fn setup() -> (Arc<MemoryBackend>, RoomSession) {
        let memory = Arc::new(MemoryBackend::new());
        let session = RoomSession::spawn(
            Backend::from_shared(memory.clone()),
            SessionConfig::default(),
        );
        (memory, session)
    }

    async fn wait_until(session: &RoomSession, pred: impl FnMut(&SessionSnapshot) -> bool) {
        let mut rx = session.watch();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(pred))
            .await
            .expect("timed out waiting for session state")
            .expect("session actor stopped");
    }

    #[tokio::test]
    async fn test_create_room_activates_and_subscribes() {
        let (_memory, session) = setup();

        let room = session.create_room().await.unwrap();
        assert!(crate::code::is_well_formed(&room.code));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.active_room, Some(room));
        assert!(snapshot.messages.is_empty());
        assert!(snapshot.subscribed);
    }

    #[tokio::test]
    async fn test_join_room_rejects_blank_code_without_lookup() {
        let (memory, session) = setup();

        assert_eq!(session.join_room("").await, Err(SessionError::InvalidCode));
        assert_eq!(
            session.join_room("   ").await,
            Err(SessionError::InvalidCode)
        );
        assert_eq!(memory.directory_calls(), 0);
    }

    #[tokio::test]
    async fn test_join_room_normalizes_code() {
        let (memory, session) = setup();
        let room = memory.create("K7M2QZ").await.unwrap();

        let joined = session.join_room("  k7m2qz ").await.unwrap();
        assert_eq!(joined, room);
        assert_eq!(session.active_room(), Some(room));
    }

    #[tokio::test]
    async fn test_join_unknown_room_leaves_state_unset() {
        let (_memory, session) = setup();

        assert_eq!(
            session.join_room("bad1").await,
            Err(SessionError::RoomNotFound("BAD1".to_string()))
        );
        assert_eq!(session.snapshot(), SessionSnapshot::default());
    }

    #[tokio::test]
    async fn test_send_without_room_fails_without_write() {
        let (memory, session) = setup();

        assert_eq!(
            session.send_message("hello").await,
            Err(SessionError::NoActiveRoom)
        );
        assert_eq!(memory.store_writes(), 0);
    }

    #[tokio::test]
    async fn test_send_empty_message() {
        let (memory, session) = setup();
        session.create_room().await.unwrap();

        assert_eq!(
            session.send_message("  \n ").await,
            Err(SessionError::EmptyMessage)
        );
        assert_eq!(memory.store_writes(), 0);
    }

    #[tokio::test]
    async fn test_sent_message_appears_through_echo() {
        let (_memory, session) = setup();
        session.create_room().await.unwrap();

        session.send_message("  hi there ").await.unwrap();
        wait_until(&session, |s| s.messages.len() == 1).await;

        let messages = session.messages();
        assert_eq!(messages[0].text, "hi there");
        assert_eq!(messages[0].sender_type, SenderKind::User);
    }

    #[tokio::test]
    async fn test_duplicate_code_is_not_retried() {
        let memory = Arc::new(MemoryBackend::new());
        memory.create("K7M2QZ").await.unwrap();
        let session = RoomSession::spawn(
            Backend::from_shared(memory.clone()),
            SessionConfig {
                code_generator: || "K7M2QZ".to_string(),
                ..SessionConfig::default()
            },
        );

        assert_eq!(
            session.create_room().await,
            Err(SessionError::DuplicateCode("K7M2QZ".to_string()))
        );
        // one seed create + one attempt
        assert_eq!(memory.directory_calls(), 2);
        assert!(session.active_room().is_none());
    }

    #[tokio::test]
    async fn test_backend_outage_keeps_previous_room() {
        let (memory, session) = setup();
        let room = session.create_room().await.unwrap();

        memory.set_available(false);
        assert!(matches!(
            session.create_room().await,
            Err(SessionError::BackendUnavailable(_))
        ));
        assert_eq!(session.active_room(), Some(room));
        assert!(session.snapshot().subscribed);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let (_memory, session) = setup();

        session.unsubscribe().await.unwrap();
        session.create_room().await.unwrap();
        session.unsubscribe().await.unwrap();
        session.unsubscribe().await.unwrap();
        assert!(!session.snapshot().subscribed);
    }

    #[tokio::test]
    async fn test_subscribe_requires_room() {
        let (_memory, session) = setup();
        assert_eq!(session.subscribe().await, Err(SessionError::NoActiveRoom));
        assert_eq!(
            session.load_history().await,
            Err(SessionError::NoActiveRoom)
        );
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let (_memory, session) = setup();
        session.create_room().await.unwrap();

        session.close().await;
        session.close().await;
        assert_eq!(session.create_room().await, Err(SessionError::Closed));
        assert_eq!(session.unsubscribe().await, Err(SessionError::Closed));
    }

    #[test]
    fn test_in_flight_guard() {
        let in_flight = InFlight::default();

        let guard = in_flight.begin(Operation::CreateRoom).unwrap();
        assert!(matches!(
            in_flight.begin(Operation::CreateRoom),
            Err(SessionError::Busy(Operation::CreateRoom))
        ));
        // other operations are independent
        assert!(in_flight.begin(Operation::JoinRoom).is_ok());

        drop(guard);
        assert!(in_flight.begin(Operation::CreateRoom).is_ok());
    }

    #[test]
    fn test_error_messages_are_displayable() {
        assert_eq!(SessionError::InvalidCode.to_string(), "Enter a room code.");
        assert_eq!(
            SessionError::Busy(Operation::JoinRoom).to_string(),
            "Joining a room is already in progress."
        );
    }
}
