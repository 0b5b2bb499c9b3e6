use super::*;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Backend talking to a PostgREST-compatible API (`/rest/v1/<table>`).
///
/// The change feed polls the messages table, re-reading a trailing window
/// behind the newest row seen so rows that commit late still show up.
#[derive(Clone)]
pub struct RestBackend {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    poll_interval: Duration,
    feed_overlap: Duration,
    feed_capacity: usize,
}

#[derive(Debug, Serialize)]
struct NewRoomRow<'a> {
    code: &'a str,
}

impl RestBackend {
    pub fn new(base_url: String, api_key: String, config: &BackendConfig) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
            poll_interval: config.poll_interval,
            feed_overlap: config.feed_overlap,
            feed_capacity: config.feed_capacity.max(1),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> BackendResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Unavailable(format!(
                "API returned status: {}",
                response.status()
            )));
        }
        Ok(response)
    }

    async fn fetch_rows<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> BackendResult<Vec<T>> {
        let response = self
            .send(self.request(reqwest::Method::GET, table).query(query))
            .await?;

        response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn find_room(&self, column: &str, value: &str) -> BackendResult<Room> {
        let rooms: Vec<Room> = self
            .fetch_rows(
                "rooms",
                &[(column, format!("eq.{}", value)), ("limit", "1".to_string())],
            )
            .await?;
        rooms.into_iter().next().ok_or(BackendError::NotFound)
    }

    fn feed_query(room_id: &RoomId, since: Option<DateTime<Utc>>) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("room_id", format!("eq.{}", room_id)),
            ("order", "created_at.asc".to_string()),
        ];
        if let Some(since) = since {
            query.push(("created_at", format!("gte.{}", since.to_rfc3339())));
        }
        query
    }

    /// Mark the room's current rows as seen, so a fresh feed only reports later inserts
    async fn start_cursor(&self, room_id: &RoomId) -> BackendResult<FeedCursor> {
        let mut cursor = FeedCursor::new(self.feed_overlap);

        let latest: Vec<serde_json::Value> = self
            .fetch_rows(
                "messages",
                &[
                    ("room_id", format!("eq.{}", room_id)),
                    ("order", "created_at.desc".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        cursor.advance(latest);

        if let Some(since) = cursor.window_start() {
            let window = self
                .fetch_rows("messages", &Self::feed_query(room_id, Some(since)))
                .await?;
            cursor.advance(window);
        }
        Ok(cursor)
    }

    async fn poll_feed(self, room_id: RoomId, tx: mpsc::Sender<serde_json::Value>) {
        let mut cursor = match self.start_cursor(&room_id).await {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!("Could not read feed start for room {}: {}", room_id, e);
                FeedCursor::new(self.feed_overlap)
            }
        };

        tracing::debug!(
            "Polling feed for room {} every {:?} (overlap {:?})",
            room_id,
            self.poll_interval,
            self.feed_overlap
        );

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let query = Self::feed_query(&room_id, cursor.window_start());
            let rows: Vec<serde_json::Value> = match self.fetch_rows("messages", &query).await {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!("Feed poll for room {} failed: {}", room_id, e);
                    continue;
                }
            };

            for row in cursor.advance(rows) {
                if tx.send(row).await.is_err() {
                    break;
                }
            }
        }

        tracing::debug!("Feed for room {} released", room_id);
    }
}

/// Tracks how far a polling feed has read.
///
/// `created_at` is stamped when the writing transaction starts, so a row can
/// become visible after newer ones. Each poll re-reads everything from
/// `overlap` before the newest timestamp seen and reports ids it hasn't seen
/// yet. Ids are forgotten once they fall out of that window. A row that
/// commits more than `overlap` after its timestamp is missed.
#[derive(Debug)]
struct FeedCursor {
    overlap: chrono::Duration,
    newest: Option<DateTime<Utc>>,
    seen: HashMap<String, DateTime<Utc>>,
}

impl FeedCursor {
    fn new(overlap: Duration) -> Self {
        Self {
            overlap: chrono::Duration::from_std(overlap).unwrap_or(chrono::Duration::zero()),
            newest: None,
            seen: HashMap::new(),
        }
    }

    /// Lower bound of the next poll; None reads the whole room
    fn window_start(&self) -> Option<DateTime<Utc>> {
        self.newest
            .and_then(|newest| newest.checked_sub_signed(self.overlap))
    }

    fn advance(&mut self, rows: Vec<serde_json::Value>) -> Vec<serde_json::Value> {
        let mut fresh = Vec::new();

        for row in rows {
            let id = row.get("id").and_then(|v| v.as_str()).map(str::to_string);
            let ts = row_timestamp(&row);

            if let (Some(id), Some(ts)) = (id, ts) {
                if self.seen.insert(id, ts).is_some() {
                    continue;
                }
                if self.newest.map_or(true, |newest| ts > newest) {
                    self.newest = Some(ts);
                }
            }
            // Rows without id or timestamp are passed through; the consumer
            // decides whether they decode.
            fresh.push(row);
        }

        if let Some(start) = self.window_start() {
            self.seen.retain(|_, ts| *ts >= start);
        }

        fresh
    }
}

fn row_timestamp(row: &serde_json::Value) -> Option<DateTime<Utc>> {
    row.get("created_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl RoomDirectory for RestBackend {
    async fn create(&self, code: &str) -> BackendResult<Room> {
        let response = self
            .request(reqwest::Method::POST, "rooms")
            .header("Prefer", "return=representation")
            .json(&NewRoomRow { code })
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        // Unique constraint on code
        if response.status() == StatusCode::CONFLICT {
            return Err(BackendError::DuplicateCode(code.to_string()));
        }
        if !response.status().is_success() {
            return Err(BackendError::Unavailable(format!(
                "API returned status: {}",
                response.status()
            )));
        }

        let rooms: Vec<Room> = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        rooms
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Decode("insert returned no room".to_string()))
    }

    async fn find_by_code(&self, code: &str) -> BackendResult<Room> {
        self.find_room("code", code).await
    }

    async fn find_by_id(&self, id: &RoomId) -> BackendResult<Room> {
        self.find_room("id", id).await
    }
}

#[async_trait]
impl MessageStore for RestBackend {
    async fn insert(&self, message: NewMessage) -> BackendResult<()> {
        self.send(
            self.request(reqwest::Method::POST, "messages")
                .header("Prefer", "return=minimal")
                .json(&message),
        )
        .await?;
        Ok(())
    }

    async fn list_by_room(&self, room_id: &RoomId) -> BackendResult<Vec<Message>> {
        self.fetch_rows(
            "messages",
            &[
                ("room_id", format!("eq.{}", room_id)),
                ("order", "created_at.asc".to_string()),
            ],
        )
        .await
    }
}

#[async_trait]
impl ChangeFeed for RestBackend {
    async fn subscribe(&self, room_id: &RoomId) -> BackendResult<FeedSubscription> {
        let (tx, rx) = mpsc::channel(self.feed_capacity);
        tokio::spawn(self.clone().poll_feed(room_id.clone(), tx));

        let events =
            futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) });
        Ok(FeedSubscription::new(room_id.clone(), events))
    }
}
