//! Wire types for the two protocol boundaries the bridge exposes:
//! the browser-facing HTTP signaling/control API (§6.1) and the
//! upstream speech-service data-channel protocol (§6.2).

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------
// §6.1 HTTP signaling and control
// ---------------------------------------------------------------------

/// `POST /bridge/signal` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalRequest {
    pub conversation_id: String,
    pub offer_sdp: String,
    pub voice: Option<crate::VoiceProfile>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

/// `POST /bridge/signal` response body.
#[derive(Debug, Clone, Serialize)]
pub struct SignalResponse {
    pub connection_id: String,
    pub answer_sdp: String,
}

/// `POST /bridge/disconnect` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct DisconnectRequest {
    pub conversation_id: String,
    pub connection_id: String,
}

/// `POST /bridge/conversation/{id}/text` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct TextRequest {
    pub text: String,
}

/// `GET /bridge/conversation/{id}/status` response body.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub browser_count: usize,
    pub session_state: SessionState,
}

/// Coarse state of a conversation's Upstream Session, reported at the
/// status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No Upstream Session exists yet for this conversation.
    Absent,
    /// Peer connection and data channel are being established.
    Connecting,
    /// Data channel is open and `session.updated` has been received.
    Open,
    /// The session degraded (e.g. persistent decode errors or an
    /// unsupported mid-session rate change) but was not torn down.
    Degraded,
}

/// Generic `{ok: true}` / `{ok: false, error: ...}` response shape used by
/// `/disconnect`, the force-stop delete, and `/commit`.
#[derive(Debug, Clone, Serialize)]
pub struct OkResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OkResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn err(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(reason.into()),
        }
    }
}

// ---------------------------------------------------------------------
// §6.2 Speech-service wire protocol (upstream)
// ---------------------------------------------------------------------

/// The single outbound message that configures a freshly opened Upstream
/// Session's data channel (protocol §4.2, §6.2).
#[derive(Debug, Clone, Serialize)]
pub struct SessionUpdate {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub session: SessionUpdatePayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionUpdatePayload {
    pub voice: String,
    pub modalities: [&'static str; 2],
    pub instructions: String,
    pub tools: Vec<ToolDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,
    /// `None` serializes as JSON `null` — manual-commit mode (protocol §4.2).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
}

impl SessionUpdate {
    pub fn new(
        voice: &str,
        instructions: String,
        tools: Vec<ToolDescriptor>,
        transcription_language: &str,
        transcription_model: &str,
        server_vad: bool,
    ) -> Self {
        let input_audio_transcription = if transcription_language.is_empty() {
            None
        } else {
            Some(InputAudioTranscription {
                model: transcription_model.to_string(),
                language: transcription_language.to_string(),
            })
        };
        Self {
            kind: "session.update",
            session: SessionUpdatePayload {
                voice: voice.to_string(),
                modalities: ["audio", "text"],
                instructions,
                tools,
                input_audio_transcription,
                turn_detection: if server_vad {
                    Some(TurnDetection::default())
                } else {
                    None
                },
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InputAudioTranscription {
    pub model: String,
    pub language: String,
}

/// Server-side VAD with default parameters. The design notes (§9) call
/// custom thresholds a known footgun, so this type intentionally exposes
/// no configurable fields beyond the fixed `type` discriminant.
#[derive(Debug, Clone, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl Default for TurnDetection {
    fn default() -> Self {
        TurnDetection {
            kind: "server_vad",
        }
    }
}

/// `{type: "function", name, description, parameters}` (protocol §6.2/§6.3).
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The fixed five-tool manifest advertised to the model (protocol §6.3).
pub fn fixed_tool_manifest() -> Vec<ToolDescriptor> {
    let text_param = |desc: &str| {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string", "description": desc } },
            "required": ["text"],
        })
    };
    let no_param = || serde_json::json!({ "type": "object", "properties": {} });
    vec![
        ToolDescriptor {
            kind: "function",
            name: "send_to_nested".to_string(),
            description: "Delegate a user request to the nested multi-agent team.".to_string(),
            parameters: text_param("the user's request, verbatim or lightly summarized"),
        },
        ToolDescriptor {
            kind: "function",
            name: "send_to_code_modifier".to_string(),
            description: "Delegate a self-editing instruction to the code-modification process."
                .to_string(),
            parameters: text_param("the instruction to apply to the codebase"),
        },
        ToolDescriptor {
            kind: "function",
            name: "pause".to_string(),
            description: "Pause the nested agent team.".to_string(),
            parameters: no_param(),
        },
        ToolDescriptor {
            kind: "function",
            name: "reset".to_string(),
            description: "Reset the nested agent team's state.".to_string(),
            parameters: no_param(),
        },
        ToolDescriptor {
            kind: "function",
            name: "pause_code_modifier".to_string(),
            description: "Pause the code-modification process.".to_string(),
            parameters: no_param(),
        },
    ]
}

/// `{type: "conversation.item.create", item: {type: "function_call_output", ...}}`.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationItemCreate {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub item: ConversationItem,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ConversationItem {
    #[serde(rename = "function_call_output")]
    FunctionCallOutput { call_id: String, output: String },
    #[serde(rename = "message")]
    Message {
        role: &'static str,
        content: Vec<ContentPart>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "input_text")]
    InputText { text: String },
}

impl ConversationItemCreate {
    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            kind: "conversation.item.create",
            item: ConversationItem::FunctionCallOutput {
                call_id: call_id.into(),
                output: output.into(),
            },
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            kind: "conversation.item.create",
            item: ConversationItem::Message {
                role: "user",
                content: vec![ContentPart::InputText { text: text.into() }],
            },
        }
    }
}

/// `{type: "response.create"}` — requests the model continue after an item
/// is appended to the conversation (protocol §4.2 "Tool-call completion",
/// "Text injection", "Manual commit").
#[derive(Debug, Clone, Serialize)]
pub struct ResponseCreate {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl Default for ResponseCreate {
    fn default() -> Self {
        Self {
            kind: "response.create",
        }
    }
}

/// `{type: "input_audio_buffer.commit"}` — manual VAD commit (protocol §4.2).
#[derive(Debug, Clone, Serialize)]
pub struct InputAudioBufferCommit {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl Default for InputAudioBufferCommit {
    fn default() -> Self {
        Self {
            kind: "input_audio_buffer.commit",
        }
    }
}

/// Inbound data-channel message, parsed generically first so the two
/// function-call phases can be routed before falling through to verbatim
/// forwarding (protocol §4.2 "Event routing").
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamEventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub rest: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCallArgumentsDelta {
    pub call_id: String,
    pub delta: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCallArgumentsDone {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

pub const EVENT_TYPE_FUNCTION_CALL_DELTA: &str = "response.function_call_arguments.delta";
pub const EVENT_TYPE_FUNCTION_CALL_DONE: &str = "response.function_call_arguments.done";
pub const EVENT_TYPE_SESSION_UPDATED: &str = "session.updated";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_update_serializes_tag_and_turn_detection_default() {
        let update = SessionUpdate::new(
            "marin",
            "be helpful".to_string(),
            fixed_tool_manifest(),
            "en",
            "whisper-1",
            true,
        );
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "session.update");
        assert_eq!(json["session"]["voice"], "marin");
        assert_eq!(json["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(
            json["session"]["input_audio_transcription"]["language"],
            "en"
        );
        assert_eq!(json["session"]["tools"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn session_update_manual_commit_sends_null_turn_detection() {
        let update = SessionUpdate::new(
            "marin",
            String::new(),
            Vec::new(),
            "en",
            "whisper-1",
            false,
        );
        let json = serde_json::to_value(&update).unwrap();
        assert!(json["session"]["turn_detection"].is_null());
    }

    #[test]
    fn session_update_empty_language_omits_transcription() {
        let update = SessionUpdate::new("marin", String::new(), Vec::new(), "", "whisper-1", true);
        let json = serde_json::to_value(&update).unwrap();
        assert!(json["session"]["input_audio_transcription"].is_null());
    }

    #[test]
    fn function_call_output_item_round_trips_shape() {
        let item = ConversationItemCreate::function_call_output("call_1", "{\"ok\":true}");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "conversation.item.create");
        assert_eq!(item_type(&json), "function_call_output");
        assert_eq!(json["item"]["call_id"], "call_1");
    }

    #[test]
    fn user_text_item_has_input_text_part() {
        let item = ConversationItemCreate::user_text("hello");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["item"]["role"], "user");
        assert_eq!(json["item"]["content"][0]["type"], "input_text");
        assert_eq!(json["item"]["content"][0]["text"], "hello");
    }

    fn item_type(json: &serde_json::Value) -> &str {
        json["item"]["type"].as_str().unwrap()
    }

    #[test]
    fn envelope_parses_unknown_fields_into_rest() {
        let raw = r#"{"type":"response.audio.delta","delta":"abc","response_id":"r1"}"#;
        let env: UpstreamEventEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.event_type, "response.audio.delta");
        assert_eq!(env.rest["delta"], "abc");
    }

    #[test]
    fn function_call_delta_and_done_parse() {
        let delta: FunctionCallArgumentsDelta =
            serde_json::from_str(r#"{"call_id":"c1","delta":"{\"a\":"}"#).unwrap();
        assert_eq!(delta.call_id, "c1");

        let done: FunctionCallArgumentsDone = serde_json::from_str(
            r#"{"call_id":"c1","name":"send_to_nested","arguments":"{\"text\":\"hi\"}"}"#,
        )
        .unwrap();
        assert_eq!(done.name, "send_to_nested");
    }

    #[test]
    fn signal_request_deserializes_optional_fields() {
        let raw = r#"{"conversation_id":"c1","offer_sdp":"v=0"}"#;
        let req: SignalRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.conversation_id, "c1");
        assert!(req.voice.is_none());
        assert!(req.model.is_none());
    }

    #[test]
    fn ok_response_serializes_without_error_when_ok() {
        let json = serde_json::to_value(OkResponse::ok()).unwrap();
        assert_eq!(json["ok"], true);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn ok_response_includes_error_when_failed() {
        let json = serde_json::to_value(OkResponse::err("unknown_tool")).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "unknown_tool");
    }
}
