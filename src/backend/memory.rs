use super::*;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{broadcast, RwLock};

/// In-process backend: rooms and messages in memory, one broadcast channel
/// per room for the change feed.
///
/// Used when no hosted API is configured and as the fake in tests.
#[derive(Clone)]
pub struct MemoryBackend {
    rooms: Arc<RwLock<HashMap<RoomId, Room>>>,
    messages: Arc<RwLock<Vec<Message>>>,
    feeds: Arc<RwLock<HashMap<RoomId, broadcast::Sender<serde_json::Value>>>>,
    available: Arc<AtomicBool>,
    directory_calls: Arc<AtomicUsize>,
    store_writes: Arc<AtomicUsize>,
    feed_capacity: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(feed_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            messages: Arc::new(RwLock::new(Vec::new())),
            feeds: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            directory_calls: Arc::new(AtomicUsize::new(0)),
            store_writes: Arc::new(AtomicUsize::new(0)),
            feed_capacity: feed_capacity.max(1),
        }
    }

    /// Simulate an outage: while unavailable every call fails with `Unavailable`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of directory calls made so far (create + lookups)
    pub fn directory_calls(&self) -> usize {
        self.directory_calls.load(Ordering::SeqCst)
    }

    /// Number of successful message inserts
    pub fn store_writes(&self) -> usize {
        self.store_writes.load(Ordering::SeqCst)
    }

    /// Push a raw payload to every subscriber of a room.
    /// Returns how many subscribers received it.
    pub async fn publish_raw(&self, room_id: &RoomId, payload: serde_json::Value) -> usize {
        let mut feeds = self.feeds.write().await;
        let Some(tx) = feeds.get(room_id) else {
            return 0;
        };
        if tx.receiver_count() == 0 {
            // Last subscriber gone
            feeds.remove(room_id);
            return 0;
        }
        tx.send(payload).unwrap_or(0)
    }

    /// Store a message as if another client had written it, returning the stored record
    pub async fn insert_external(&self, message: NewMessage) -> BackendResult<Message> {
        self.check_available()?;
        self.store(message).await
    }

    fn check_available(&self) -> BackendResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable(
                "in-memory backend switched off".to_string(),
            ))
        }
    }

    async fn store(&self, message: NewMessage) -> BackendResult<Message> {
        if !self.rooms.read().await.contains_key(&message.room_id) {
            return Err(BackendError::NotFound);
        }

        let stored = Message {
            id: ulid::Ulid::new().to_string(),
            room_id: message.room_id,
            sender_type: message.sender_type,
            text: message.text,
            created_at: Some(Utc::now()),
        };

        self.messages.write().await.push(stored.clone());
        self.store_writes.fetch_add(1, Ordering::SeqCst);

        let payload = serde_json::to_value(&stored)
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        self.publish_raw(&stored.room_id, payload).await;

        Ok(stored)
    }

    /// Subscribe under the map lock so a concurrent prune can't orphan the receiver
    async fn feed_receiver(&self, room_id: &RoomId) -> broadcast::Receiver<serde_json::Value> {
        let mut feeds = self.feeds.write().await;
        feeds
            .entry(room_id.clone())
            .or_insert_with(|| broadcast::channel(self.feed_capacity).0)
            .subscribe()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoomDirectory for MemoryBackend {
    async fn create(&self, code: &str) -> BackendResult<Room> {
        self.directory_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut rooms = self.rooms.write().await;
        if rooms.values().any(|r| r.code == code) {
            return Err(BackendError::DuplicateCode(code.to_string()));
        }

        let room = Room {
            id: ulid::Ulid::new().to_string(),
            code: code.to_string(),
            created_at: Some(Utc::now()),
        };
        rooms.insert(room.id.clone(), room.clone());
        Ok(room)
    }

    async fn find_by_code(&self, code: &str) -> BackendResult<Room> {
        self.directory_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        self.rooms
            .read()
            .await
            .values()
            .find(|r| r.code == code)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    async fn find_by_id(&self, id: &RoomId) -> BackendResult<Room> {
        self.directory_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        self.rooms
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(BackendError::NotFound)
    }
}

#[async_trait]
impl MessageStore for MemoryBackend {
    async fn insert(&self, message: NewMessage) -> BackendResult<()> {
        self.check_available()?;
        self.store(message).await.map(|_| ())
    }

    async fn list_by_room(&self, room_id: &RoomId) -> BackendResult<Vec<Message>> {
        self.check_available()?;

        let mut messages: Vec<Message> = self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| &m.room_id == room_id)
            .cloned()
            .collect();
        // Stable: equal timestamps keep insertion order
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, room_id: &RoomId) -> BackendResult<FeedSubscription> {
        self.check_available()?;

        let rx = self.feed_receiver(room_id).await;
        let scope = room_id.clone();

        let events = futures::stream::unfold(rx, move |mut rx| {
            let scope = scope.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                "Feed for room {} lagged, {} events skipped",
                                scope,
                                skipped
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(FeedSubscription::new(room_id.clone(), events))
    }
}
