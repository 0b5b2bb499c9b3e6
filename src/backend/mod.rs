mod memory;
mod rest;

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;

use crate::types::{Message, NewMessage, Room, RoomId};

pub use memory::MemoryBackend;
pub use rest::RestBackend;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors reported by the hosted backend or its fakes
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("Not found")]
    NotFound,

    #[error("Room code {0} is already taken")]
    DuplicateCode(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Could not decode backend response: {0}")]
    Decode(String),
}

/// Persists rooms keyed by their short code
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Create a room with the given (already generated) code
    async fn create(&self, code: &str) -> BackendResult<Room>;

    /// Look up a room by its normalized code
    async fn find_by_code(&self, code: &str) -> BackendResult<Room>;

    async fn find_by_id(&self, id: &RoomId) -> BackendResult<Room>;
}

/// Persists messages per room
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: NewMessage) -> BackendResult<()>;

    /// All messages of a room, ascending by created_at
    async fn list_by_room(&self, room_id: &RoomId) -> BackendResult<Vec<Message>>;
}

/// Pushes one event per inserted message, scoped to a room
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, room_id: &RoomId) -> BackendResult<FeedSubscription>;
}

/// A live feed of raw insert payloads for one room.
///
/// Payloads are undecoded JSON records; the consumer decides what to do
/// with ones that don't match the message shape. Dropping the subscription
/// releases the feed.
pub struct FeedSubscription {
    room_id: RoomId,
    events: BoxStream<'static, serde_json::Value>,
}

impl FeedSubscription {
    pub fn new<S>(room_id: RoomId, events: S) -> Self
    where
        S: Stream<Item = serde_json::Value> + Send + 'static,
    {
        Self {
            room_id,
            events: events.boxed(),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Wait for the next payload. None once the feed has closed.
    pub async fn next(&mut self) -> Option<serde_json::Value> {
        self.events.next().await
    }
}

impl std::fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("room_id", &self.room_id)
            .finish_non_exhaustive()
    }
}

/// The three backend collaborators a session talks to.
///
/// Constructed explicitly and handed to each `RoomSession`, so tests can
/// swap in a fake.
#[derive(Clone)]
pub struct Backend {
    pub rooms: Arc<dyn RoomDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub feed: Arc<dyn ChangeFeed>,
}

impl Backend {
    pub fn new(
        rooms: Arc<dyn RoomDirectory>,
        messages: Arc<dyn MessageStore>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        Self {
            rooms,
            messages,
            feed,
        }
    }

    /// Build from a single value implementing all three collaborators
    pub fn from_shared<T>(backend: Arc<T>) -> Self
    where
        T: RoomDirectory + MessageStore + ChangeFeed + 'static,
    {
        Self {
            rooms: backend.clone(),
            messages: backend.clone(),
            feed: backend,
        }
    }
}

/// Configuration for the hosted backend
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL of the PostgREST-compatible API (None = in-memory backend)
    pub api_url: Option<String>,
    /// Anonymous API key sent with every request
    pub api_key: Option<String>,
    /// How often a REST feed polls for new messages
    pub poll_interval: Duration,
    /// How far behind the newest row a REST feed re-reads for late commits
    pub feed_overlap: Duration,
    /// Buffered feed events per room before slow consumers start lagging
    pub feed_capacity: usize,
    /// Timeout applied to each HTTP request
    pub request_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            poll_interval: Duration::from_millis(1000),
            feed_overlap: Duration::from_millis(5000),
            feed_capacity: 256,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl BackendConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let non_empty = |name: &str| {
            std::env::var(name).ok().and_then(|value| {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            })
        };

        let defaults = Self::default();

        Self {
            api_url: non_empty("ROOMSYNC_API_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            api_key: non_empty("ROOMSYNC_API_KEY"),
            poll_interval: non_empty("ROOMSYNC_POLL_INTERVAL_MS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            feed_overlap: non_empty("ROOMSYNC_FEED_OVERLAP_MS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.feed_overlap),
            feed_capacity: non_empty("ROOMSYNC_FEED_CAPACITY")
                .and_then(|s| s.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.feed_capacity),
            request_timeout: non_empty("ROOMSYNC_REQUEST_TIMEOUT")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
        }
    }

    /// Build the backend described by this config.
    /// Falls back to an in-memory backend when no API is configured.
    pub fn build_backend(&self) -> BackendResult<Backend> {
        match (&self.api_url, &self.api_key) {
            (Some(url), Some(key)) => {
                let rest = RestBackend::new(url.clone(), key.clone(), self)?;
                tracing::info!("Using REST backend at {}", url);
                Ok(Backend::from_shared(Arc::new(rest)))
            }
            _ => {
                if self.api_url.is_some() || self.api_key.is_some() {
                    tracing::warn!(
                        "ROOMSYNC_API_URL and ROOMSYNC_API_KEY must both be set to use the REST backend"
                    );
                }
                tracing::warn!("No backend configured, rooms will only live in this process");
                Ok(Backend::from_shared(Arc::new(MemoryBackend::with_capacity(
                    self.feed_capacity,
                ))))
            }
        }
    }
}
