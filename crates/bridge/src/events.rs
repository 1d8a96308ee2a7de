//! Append-only per-conversation event log with broadcast fan-out (§6.4).
//!
//! Shadows the two-table schema (`conversations`, `events`) as in-process
//! structures rather than a SQL engine, following the design note that a
//! future on-disk backend is a drop-in swap since the schema is declared
//! stable — this process owns no persistence-across-restart guarantee.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{RwLock, broadcast};
use voicebridge_protocol::{ConversationRecord, Event, EventSource, VoiceProfile};

const BROADCAST_CAPACITY: usize = 256;

struct ConversationLog {
    record: ConversationRecord,
    events: Vec<Event>,
    next_id: u64,
    sender: broadcast::Sender<Event>,
}

/// Process-wide append-only event log, keyed by `conversation_id`.
pub struct EventStore {
    conversations: RwLock<HashMap<String, ConversationLog>>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl EventStore {
    pub fn new() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
        }
    }

    /// Ensure a conversation row exists, creating it with the given voice
    /// if this is the first time it's been seen. Idempotent.
    pub async fn ensure_conversation(&self, conversation_id: &str, voice: VoiceProfile) {
        let mut conversations = self.conversations.write().await;
        if conversations.contains_key(conversation_id) {
            return;
        }
        let now = now_ms();
        let (sender, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        conversations.insert(
            conversation_id.to_string(),
            ConversationLog {
                record: ConversationRecord {
                    id: conversation_id.to_string(),
                    name: None,
                    created_at_ms: now,
                    updated_at_ms: now,
                    voice,
                    metadata: serde_json::json!({}),
                },
                events: Vec::new(),
                next_id: 1,
                sender,
            },
        );
    }

    pub async fn conversation_record(&self, conversation_id: &str) -> Option<ConversationRecord> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .map(|log| log.record.clone())
    }

    /// Append an event, assigning it the next monotonic id for this
    /// conversation, and fan it out to current subscribers. Subscribers
    /// that aren't currently listening simply miss it (a `broadcast`
    /// channel, not a queue that blocks on slow readers).
    pub async fn append(
        &self,
        conversation_id: &str,
        source: EventSource,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Option<Event> {
        let mut conversations = self.conversations.write().await;
        let log = conversations.get_mut(conversation_id)?;

        let event = Event {
            id: log.next_id,
            conversation_id: conversation_id.to_string(),
            timestamp_ms: now_ms(),
            source,
            event_type: event_type.into(),
            payload,
        };
        log.next_id += 1;
        log.record.updated_at_ms = event.timestamp_ms;
        log.events.push(event.clone());

        // Fan-out happens outside any await point that would hold the lock
        // across network I/O — `broadcast::Sender::send` is synchronous and
        // just copies the value into subscriber queues.
        let _ = log.sender.send(event.clone());

        Some(event)
    }

    pub async fn subscribe(&self, conversation_id: &str) -> Option<broadcast::Receiver<Event>> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .map(|log| log.sender.subscribe())
    }

    pub async fn history(&self, conversation_id: &str) -> Vec<Event> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .map(|log| log.events.clone())
            .unwrap_or_default()
    }

    pub async fn exists(&self, conversation_id: &str) -> bool {
        self.conversations.read().await.contains_key(conversation_id)
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedEventStore = Arc<EventStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_assigns_monotonic_ids() {
        let store = EventStore::new();
        store.ensure_conversation("c1", VoiceProfile::default()).await;
        let e1 = store
            .append("c1", EventSource::Controller, "session.created", serde_json::json!({}))
            .await
            .unwrap();
        let e2 = store
            .append("c1", EventSource::Voice, "speech.started", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(e1.id, 1);
        assert_eq!(e2.id, 2);
    }

    #[tokio::test]
    async fn append_to_unknown_conversation_returns_none() {
        let store = EventStore::new();
        let result = store
            .append("ghost", EventSource::Voice, "x", serde_json::json!({}))
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn subscriber_receives_appended_events_in_order() {
        let store = EventStore::new();
        store.ensure_conversation("c1", VoiceProfile::default()).await;
        let mut rx = store.subscribe("c1").await.unwrap();

        store
            .append("c1", EventSource::Nested, "first", serde_json::json!({}))
            .await;
        store
            .append("c1", EventSource::Nested, "second", serde_json::json!({}))
            .await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.event_type, "first");
        assert_eq!(second.event_type, "second");
    }

    #[tokio::test]
    async fn ensure_conversation_is_idempotent() {
        let store = EventStore::new();
        store.ensure_conversation("c1", VoiceProfile::Marin).await;
        store
            .append("c1", EventSource::Controller, "one", serde_json::json!({}))
            .await;
        store.ensure_conversation("c1", VoiceProfile::Cedar).await;
        let history = store.history("c1").await;
        assert_eq!(history.len(), 1, "re-ensuring must not wipe history");
    }

    #[tokio::test]
    async fn history_returns_events_in_append_order() {
        let store = EventStore::new();
        store.ensure_conversation("c1", VoiceProfile::default()).await;
        for i in 0..5 {
            store
                .append("c1", EventSource::Controller, format!("evt-{i}"), serde_json::json!({}))
                .await;
        }
        let history = store.history("c1").await;
        let types: Vec<&str> = history.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["evt-0", "evt-1", "evt-2", "evt-3", "evt-4"]);
    }
}
