//! Session actor: owns all session state and processes commands sequentially.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::{SessionConfig, SessionError, SessionResult, SessionSnapshot};
use crate::backend::{Backend, BackendError, FeedSubscription};
use crate::feed;
use crate::types::{Message, NewMessage, Room, RoomId};

/// A command sent to the session actor
pub(super) enum SessionCommand {
    CreateRoom {
        reply: oneshot::Sender<SessionResult<Room>>,
    },
    JoinRoom {
        /// Already normalized
        code: String,
        reply: oneshot::Sender<SessionResult<Room>>,
    },
    LoadHistory {
        reply: oneshot::Sender<SessionResult<Vec<Message>>>,
    },
    Subscribe {
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Unsubscribe {
        reply: oneshot::Sender<()>,
    },
    SendMessage {
        text: String,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    /// A raw payload forwarded from the live feed of the given generation
    FeedEvent {
        generation: u64,
        payload: serde_json::Value,
    },
    /// The feed of the given generation ended on its own
    FeedClosed {
        generation: u64,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// A live feed held by the session. Dropping it stops the forwarder and
/// with it the backend subscription.
struct LiveFeed {
    room_id: RoomId,
    generation: u64,
    forwarder: JoinHandle<()>,
}

impl Drop for LiveFeed {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

pub(super) struct SessionActor {
    backend: Backend,
    config: SessionConfig,
    active_room: Option<Room>,
    messages: Vec<Message>,
    live: Option<LiveFeed>,
    /// Bumped for every new subscription; events tagged with an older value are stale
    generation: u64,
    decode_failures: u64,
    last_decode_error: Option<String>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    /// Weak so that forwarders don't keep the actor alive once every handle is gone
    command_tx: mpsc::WeakSender<SessionCommand>,
}

impl SessionActor {
    pub(super) fn new(
        backend: Backend,
        config: SessionConfig,
        snapshot_tx: watch::Sender<SessionSnapshot>,
        command_tx: mpsc::WeakSender<SessionCommand>,
    ) -> Self {
        Self {
            backend,
            config,
            active_room: None,
            messages: Vec::new(),
            live: None,
            generation: 0,
            decode_failures: 0,
            last_decode_error: None,
            snapshot_tx,
            command_tx,
        }
    }

    pub(super) async fn run(mut self, mut command_rx: mpsc::Receiver<SessionCommand>) {
        while let Some(cmd) = command_rx.recv().await {
            let closing = matches!(cmd, SessionCommand::Close { .. });
            self.handle(cmd).await;
            if closing {
                tracing::debug!("Room session closed");
                return;
            }
        }

        // Every handle dropped: same as view teardown
        self.release_feed();
        tracing::debug!("Room session dropped");
    }

    async fn handle(&mut self, cmd: SessionCommand) {
        // Reply send errors mean the caller went away; its result is discarded.
        match cmd {
            SessionCommand::CreateRoom { reply } => {
                let result = self.create_room().await;
                let _ = reply.send(result);
            }
            SessionCommand::JoinRoom { code, reply } => {
                let result = self.join_room(code).await;
                let _ = reply.send(result);
            }
            SessionCommand::LoadHistory { reply } => {
                let result = self.load_history().await;
                let _ = reply.send(result);
            }
            SessionCommand::Subscribe { reply } => {
                let result = self.subscribe().await;
                let _ = reply.send(result);
            }
            SessionCommand::Unsubscribe { reply } => {
                self.release_feed();
                self.publish();
                let _ = reply.send(());
            }
            SessionCommand::SendMessage { text, reply } => {
                let result = self.send_message(text).await;
                let _ = reply.send(result);
            }
            SessionCommand::FeedEvent {
                generation,
                payload,
            } => self.on_feed_event(generation, payload),
            SessionCommand::FeedClosed { generation } => {
                if self.live.as_ref().map(|l| l.generation) == Some(generation) {
                    tracing::warn!("Live feed for room {:?} ended", self.active_room_id());
                    self.live = None;
                    self.publish();
                }
            }
            SessionCommand::Close { reply } => {
                self.release_feed();
                self.publish();
                let _ = reply.send(());
            }
        }
    }

    async fn create_room(&mut self) -> SessionResult<Room> {
        let code = (self.config.code_generator)();
        let room = self.backend.rooms.create(&code).await.map_err(|e| {
            tracing::error!("Failed to create room {}: {}", code, e);
            SessionError::from(e)
        })?;

        tracing::info!("Created room {} ({})", room.code, room.id);
        self.switch_to(room).await
    }

    async fn join_room(&mut self, code: String) -> SessionResult<Room> {
        let room = match self.backend.rooms.find_by_code(&code).await {
            Ok(room) => room,
            Err(BackendError::NotFound) => {
                tracing::info!("No room with code {}", code);
                return Err(SessionError::RoomNotFound(code));
            }
            Err(e) => {
                tracing::error!("Failed to look up room {}: {}", code, e);
                return Err(e.into());
            }
        };

        tracing::info!("Joining room {} ({})", room.code, room.id);
        self.switch_to(room).await
    }

    /// Make `room` the active room.
    ///
    /// The new feed and history are obtained first; nothing is committed
    /// unless both succeed. The feed is opened before the history fetch so
    /// inserts in between are buffered rather than missed.
    async fn switch_to(&mut self, room: Room) -> SessionResult<Room> {
        let subscription = self.backend.feed.subscribe(&room.id).await.map_err(|e| {
            tracing::error!("Failed to subscribe to room {}: {}", room.id, e);
            SessionError::from(e)
        })?;
        let history = self.backend.messages.list_by_room(&room.id).await.map_err(|e| {
            tracing::error!("Failed to load history for room {}: {}", room.id, e);
            SessionError::from(e)
        })?;

        self.release_feed();
        self.active_room = Some(room.clone());
        self.messages = feed::replace_history(history);
        self.live = Some(self.start_forwarding(subscription));
        self.publish();

        tracing::debug!(
            "Room {} active with {} messages",
            room.code,
            self.messages.len()
        );
        Ok(room)
    }

    async fn load_history(&mut self) -> SessionResult<Vec<Message>> {
        let room_id = self.active_room_id().ok_or(SessionError::NoActiveRoom)?;

        let history = self.backend.messages.list_by_room(&room_id).await.map_err(|e| {
            tracing::error!("Failed to load history for room {}: {}", room_id, e);
            SessionError::from(e)
        })?;

        self.messages = feed::replace_history(history);
        self.publish();
        Ok(self.messages.clone())
    }

    async fn subscribe(&mut self) -> SessionResult<()> {
        let room_id = self.active_room_id().ok_or(SessionError::NoActiveRoom)?;

        let subscription = self.backend.feed.subscribe(&room_id).await.map_err(|e| {
            tracing::error!("Failed to subscribe to room {}: {}", room_id, e);
            SessionError::from(e)
        })?;

        self.release_feed();
        self.live = Some(self.start_forwarding(subscription));
        self.publish();
        Ok(())
    }

    async fn send_message(&mut self, text: String) -> SessionResult<()> {
        let room_id = self.active_room_id().ok_or(SessionError::NoActiveRoom)?;

        let message = NewMessage {
            room_id: room_id.clone(),
            sender_type: self.config.sender_kind.clone(),
            text,
        };

        self.backend.messages.insert(message).await.map_err(|e| {
            tracing::error!("Failed to send message to room {}: {}", room_id, e);
            SessionError::from(e)
        })?;

        tracing::debug!("Message sent to room {}, waiting for echo", room_id);
        Ok(())
    }

    fn on_feed_event(&mut self, generation: u64, payload: serde_json::Value) {
        let current = match &self.live {
            Some(live) if live.generation == generation => live,
            _ => {
                tracing::debug!("Dropping event from stale feed generation {}", generation);
                return;
            }
        };

        let message = match feed::decode_payload(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping undecodable feed payload: {}", e);
                self.decode_failures += 1;
                self.last_decode_error = Some(SessionError::from(e).to_string());
                self.publish();
                return;
            }
        };

        // The feed is already room-scoped; this is a safety check
        if message.room_id != current.room_id {
            tracing::debug!(
                "Dropping message {} for room {} (active: {})",
                message.id,
                message.room_id,
                current.room_id
            );
            return;
        }

        let id = message.id.clone();
        if feed::insert_ordered(&mut self.messages, message) {
            self.publish();
        } else {
            tracing::debug!("Ignoring redelivered message {}", id);
        }
    }

    fn start_forwarding(&mut self, subscription: FeedSubscription) -> LiveFeed {
        self.generation += 1;
        let generation = self.generation;
        let room_id = subscription.room_id().clone();
        let forwarder = tokio::spawn(forward_feed(
            subscription,
            generation,
            self.command_tx.clone(),
        ));

        tracing::debug!("Subscribed to room {} (generation {})", room_id, generation);
        LiveFeed {
            room_id,
            generation,
            forwarder,
        }
    }

    fn release_feed(&mut self) {
        if let Some(live) = self.live.take() {
            tracing::debug!(
                "Unsubscribed from room {} (generation {})",
                live.room_id,
                live.generation
            );
        }
    }

    fn active_room_id(&self) -> Option<RoomId> {
        self.active_room.as_ref().map(|r| r.id.clone())
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            active_room: self.active_room.clone(),
            messages: self.messages.clone(),
            subscribed: self.live.is_some(),
            decode_failures: self.decode_failures,
            last_decode_error: self.last_decode_error.clone(),
        });
    }
}

/// Pump payloads from a backend subscription into the actor's queue
async fn forward_feed(
    mut subscription: FeedSubscription,
    generation: u64,
    commands: mpsc::WeakSender<SessionCommand>,
) {
    while let Some(payload) = subscription.next().await {
        let Some(tx) = commands.upgrade() else {
            return;
        };
        if tx
            .send(SessionCommand::FeedEvent {
                generation,
                payload,
            })
            .await
            .is_err()
        {
            return;
        }
    }

    if let Some(tx) = commands.upgrade() {
        let _ = tx.send(SessionCommand::FeedClosed { generation }).await;
    }
}
