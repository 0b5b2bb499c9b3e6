//! Turning feed payloads into an ordered, duplicate-free message list

use crate::backend::BackendError;
use crate::types::Message;
use std::collections::HashSet;

/// Decode a raw insert payload into a message
pub fn decode_payload(payload: serde_json::Value) -> Result<Message, BackendError> {
    serde_json::from_value(payload).map_err(|e| BackendError::Decode(e.to_string()))
}

/// Insert a message keeping created_at order.
///
/// Returns false (and leaves the list alone) if a message with the same id
/// is already present. Messages without a timestamp sort after all others.
pub fn insert_ordered(messages: &mut Vec<Message>, message: Message) -> bool {
    if messages.iter().any(|m| m.id == message.id) {
        return false;
    }

    let pos = match message.created_at {
        Some(ts) => messages.partition_point(|m| matches!(m.created_at, Some(t) if t <= ts)),
        None => messages.len(),
    };
    messages.insert(pos, message);
    true
}

/// Normalize a fetched history: first occurrence of each id wins, stable
/// sort by created_at with untimed messages last.
pub fn replace_history(fetched: Vec<Message>) -> Vec<Message> {
    let mut seen = HashSet::new();
    let mut messages: Vec<Message> = fetched
        .into_iter()
        .filter(|m| seen.insert(m.id.clone()))
        .collect();
    messages.sort_by_key(|m| (m.created_at.is_none(), m.created_at));
    messages
}
