//! The append-only event schema shared between the Event Store and anything
//! that observes it (the `/bridge/conversation/{id}/events` WebSocket, tool
//! adapters, narration).

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Where an event originated. Carried verbatim in the `events` table's
/// `source` column (see protocol §6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Voice,
    Nested,
    CodeModifier,
    Controller,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Voice => "voice",
            EventSource::Nested => "nested",
            EventSource::CodeModifier => "code_modifier",
            EventSource::Controller => "controller",
        }
    }
}

/// One append-only record. `id` is assigned by the store and is monotonic
/// per conversation; never reused, never mutated after append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub conversation_id: String,
    pub timestamp_ms: u64,
    pub source: EventSource,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(
        conversation_id: impl Into<String>,
        timestamp_ms: u64,
        source: EventSource,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: 0, // assigned by EventStore::append
            conversation_id: conversation_id.into(),
            timestamp_ms,
            source,
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Row shape of the `conversations` table (protocol §6.4). Kept alongside
/// `Event` because both are schema, not behavior — the store (crates/bridge)
/// owns mutation and fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub name: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub voice: VoiceProfile,
    pub metadata: serde_json::Value,
}

/// Provider voice names. `Other` covers any name the service adds that this
/// bridge doesn't yet know about by name — forwarded opaquely rather than
/// rejected. Serialized/deserialized as a bare lowercase string (not an
/// externally-tagged enum), so a custom `Serialize`/`Deserialize` pair is
/// used in place of the derive — serde's variant attributes have no
/// per-variant `untagged`, only a whole-enum one, which doesn't fit a
/// mix of named variants plus a string catch-all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceProfile {
    Alloy,
    Ash,
    Ballad,
    Coral,
    Echo,
    Sage,
    Shimmer,
    Verse,
    Marin,
    Cedar,
    Other(String),
}

impl Serialize for VoiceProfile {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire_str())
    }
}

impl<'de> Deserialize<'de> for VoiceProfile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "alloy" => VoiceProfile::Alloy,
            "ash" => VoiceProfile::Ash,
            "ballad" => VoiceProfile::Ballad,
            "coral" => VoiceProfile::Coral,
            "echo" => VoiceProfile::Echo,
            "sage" => VoiceProfile::Sage,
            "shimmer" => VoiceProfile::Shimmer,
            "verse" => VoiceProfile::Verse,
            "marin" => VoiceProfile::Marin,
            "cedar" => VoiceProfile::Cedar,
            other => VoiceProfile::Other(other.to_string()),
        })
    }
}

impl Default for VoiceProfile {
    fn default() -> Self {
        VoiceProfile::Marin
    }
}

impl VoiceProfile {
    pub fn as_wire_str(&self) -> &str {
        match self {
            VoiceProfile::Alloy => "alloy",
            VoiceProfile::Ash => "ash",
            VoiceProfile::Ballad => "ballad",
            VoiceProfile::Coral => "coral",
            VoiceProfile::Echo => "echo",
            VoiceProfile::Sage => "sage",
            VoiceProfile::Shimmer => "shimmer",
            VoiceProfile::Verse => "verse",
            VoiceProfile::Marin => "marin",
            VoiceProfile::Cedar => "cedar",
            VoiceProfile::Other(s) => s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_source_round_trips_snake_case() {
        let s = serde_json::to_string(&EventSource::CodeModifier).unwrap();
        assert_eq!(s, "\"code_modifier\"");
        let back: EventSource = serde_json::from_str(&s).unwrap();
        assert_eq!(back, EventSource::CodeModifier);
    }

    #[test]
    fn voice_profile_unknown_name_round_trips() {
        let v: VoiceProfile = serde_json::from_str("\"aria\"").unwrap();
        assert_eq!(v, VoiceProfile::Other("aria".to_string()));
        assert_eq!(v.as_wire_str(), "aria");
    }

    #[test]
    fn voice_profile_known_name_round_trips() {
        let v: VoiceProfile = serde_json::from_str("\"marin\"").unwrap();
        assert_eq!(v, VoiceProfile::Marin);
    }

    #[test]
    fn new_event_has_unassigned_id() {
        let e = Event::new("c1", 0, EventSource::Voice, "session.created", serde_json::json!({}));
        assert_eq!(e.id, 0);
    }
}
