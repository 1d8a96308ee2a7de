//! Tool Adapters (§4.6): outbound WebSocket clients to the two
//! agent-execution endpoints the voice model can invoke, Nested Agents and
//! Code Modifier.
//!
//! Grounded on `agent::signaling::run_signaling`'s exponential-backoff
//! reconnect and split-sink/stream shape, generalized into one `ToolAdapter`
//! type parameterized by endpoint URL and a narration-formatting closure —
//! the spec names exactly two structurally identical adapters, unlike the
//! teacher's one-off per-purpose channel, so this is the one place that
//! generalization is warranted rather than duplicating the module per tool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::error::AdapterError;
use crate::upstream::UpstreamSession;

/// Events the reader task decodes off the wire before formatting narration.
/// The two adapters speak different wire shapes, so this is left as a raw
/// JSON value and the formatting closure decides what matters.
pub type NarrationFn = Arc<dyn Fn(&serde_json::Value) -> Option<String> + Send + Sync>;
pub type EventAppendFn = Arc<dyn Fn(String, serde_json::Value) + Send + Sync>;

/// One outbound WebSocket client to a fixed agent-execution endpoint.
pub struct ToolAdapter {
    name: &'static str,
    url: String,
    outbound_tx: mpsc::Sender<Message>,
}

impl ToolAdapter {
    /// Spawn the adapter's connection-and-reconnect loop. `narrate` turns a
    /// decoded server event into a spoken-narration string (or `None` if it
    /// isn't narratable); `on_event` records every decoded event into the
    /// Event Store regardless of narratability.
    pub fn spawn(
        name: &'static str,
        url: String,
        upstream: Arc<UpstreamSession>,
        narrate: NarrationFn,
        on_event: EventAppendFn,
        reconnect_initial_secs: u64,
        reconnect_max_secs: u64,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(64);
        let adapter = Arc::new(Self {
            name,
            url: url.clone(),
            outbound_tx,
        });

        tokio::spawn(run_with_backoff(
            name,
            url,
            outbound_rx,
            upstream,
            narrate,
            on_event,
            Duration::from_secs(reconnect_initial_secs.max(1)),
            Duration::from_secs(reconnect_max_secs.max(1)),
        ));

        adapter
    }

    pub async fn send(&self, text: &str) -> Result<(), AdapterError> {
        self.outbound_tx
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(|_| AdapterError::SendFailed(format!("{} adapter channel closed", self.name)))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

async fn run_with_backoff(
    name: &'static str,
    url: String,
    mut outbound_rx: mpsc::Receiver<Message>,
    upstream: Arc<UpstreamSession>,
    narrate: NarrationFn,
    on_event: EventAppendFn,
    initial_backoff: Duration,
    max_backoff: Duration,
) {
    let mut backoff = initial_backoff;
    loop {
        info!(adapter = name, url = %url, "connecting tool adapter");
        match connect_and_pump(&url, &mut outbound_rx, &upstream, &narrate, &on_event).await {
            Ok(()) => {
                info!(adapter = name, "tool adapter connection closed cleanly");
                break;
            }
            Err(e) => {
                warn!(adapter = name, "tool adapter connection error: {e:#}");
                info!(adapter = name, "reconnecting in {}s", backoff.as_secs());
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}

async fn connect_and_pump(
    url: &str,
    outbound_rx: &mut mpsc::Receiver<Message>,
    upstream: &Arc<UpstreamSession>,
    narrate: &NarrationFn,
    on_event: &EventAppendFn,
) -> anyhow::Result<()> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .context("tool adapter WebSocket connection failed")?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&text, upstream, narrate, on_event).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    _ => {}
                }
            }
            Some(msg) = outbound_rx.recv() => {
                ws_tx.send(msg).await?;
            }
        }
    }
}

async fn handle_inbound(
    text: &str,
    upstream: &Arc<UpstreamSession>,
    narrate: &NarrationFn,
    on_event: &EventAppendFn,
) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("tool adapter sent invalid JSON: {e}");
            return;
        }
    };
    let event_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    on_event(event_type, value.clone());

    if let Some(narration) = narrate(&value)
        && let Err(e) = upstream.send_text(&narration).await
    {
        warn!("failed to narrate tool adapter event: {e:#}");
    }
}

/// Narration formatting for the Nested Agents adapter (§4.6): text messages
/// become `[TEAM <agent>] <content>`, tool results become
/// `[TEAM <tool>] <result>`, and task completion becomes
/// `[TEAM] Task <outcome>: <summary>`.
pub fn nested_narration(value: &serde_json::Value) -> Option<String> {
    let event_type = value.get("type")?.as_str()?;
    match event_type {
        "agent_message" => {
            let agent = value.get("agent")?.as_str()?;
            let content = value.get("content")?.as_str()?;
            Some(format!("[TEAM {agent}] {content}"))
        }
        "tool_result" => {
            let tool = value.get("tool")?.as_str()?;
            let result = value.get("result")?.as_str()?;
            Some(format!("[TEAM {tool}] {result}"))
        }
        "task_complete" => {
            let outcome = value.get("outcome")?.as_str()?;
            let summary = value.get("summary")?.as_str()?;
            Some(format!("[TEAM] Task {outcome}: {summary}"))
        }
        _ => None,
    }
}

/// Narration formatting for the Code Modifier adapter (§4.6): tool calls
/// become `[CODE <tool>] using <args>`, completion becomes
/// `[CODE RESULT] <message>`.
pub fn code_modifier_narration(value: &serde_json::Value) -> Option<String> {
    let event_type = value.get("type")?.as_str()?;
    match event_type {
        "tool_call" => {
            let tool = value.get("tool")?.as_str()?;
            let args = value.get("args")?.as_str()?;
            Some(format!("[CODE {tool}] using {args}"))
        }
        "result" => {
            let message = value.get("message")?.as_str()?;
            Some(format!("[CODE RESULT] {message}"))
        }
        _ => None,
    }
}

/// Which adapter a dispatched tool call should route to, and what control
/// message (if any) it should send, per §4.6's tool dispatch table.
pub enum ToolDispatch {
    SendToNested(String),
    SendToCodeModifier(String),
    Pause,
    Reset,
    PauseCodeModifier,
    Unknown(String),
}

/// Map a function-call's `tool_name`/`arguments` to the adapter action that
/// serves it. `arguments` is the raw JSON-encoded arguments string from the
/// model's `response.function_call_arguments.done` event.
pub fn dispatch_tool_call(tool_name: &str, arguments: &str) -> ToolDispatch {
    let text = extract_text_argument(arguments);
    match tool_name {
        "send_to_nested" => ToolDispatch::SendToNested(text),
        "send_to_code_modifier" => ToolDispatch::SendToCodeModifier(text),
        "pause" => ToolDispatch::Pause,
        "reset" => ToolDispatch::Reset,
        "pause_code_modifier" => ToolDispatch::PauseCodeModifier,
        other => ToolDispatch::Unknown(other.to_string()),
    }
}

fn extract_text_argument(arguments: &str) -> String {
    serde_json::from_str::<serde_json::Value>(arguments)
        .ok()
        .and_then(|v| v.get("text").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_default()
}

/// A registry of the adapters actually wired for a conversation: either
/// adapter may be absent (§6.3: "the dispatcher returns a clean error if the
/// corresponding adapter is absent").
#[derive(Default)]
pub struct AdapterRegistry {
    nested: Mutex<Option<Arc<ToolAdapter>>>,
    code_modifier: Mutex<Option<Arc<ToolAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_nested(&self, adapter: Arc<ToolAdapter>) {
        *self.nested.lock().await = Some(adapter);
    }

    pub async fn set_code_modifier(&self, adapter: Arc<ToolAdapter>) {
        *self.code_modifier.lock().await = Some(adapter);
    }

    /// Execute a dispatched tool action, returning the `{ok, error?}` result
    /// the model should be told about.
    pub async fn execute(&self, dispatch: ToolDispatch) -> serde_json::Value {
        match dispatch {
            ToolDispatch::SendToNested(text) => {
                let envelope = serde_json::json!({"type": "user_message", "data": text}).to_string();
                self.send_via(&self.nested, &envelope).await
            }
            ToolDispatch::SendToCodeModifier(text) => self.send_via(&self.code_modifier, &text).await,
            ToolDispatch::Pause => self.send_via(&self.nested, "__pause__").await,
            ToolDispatch::Reset => self.send_via(&self.nested, "__reset__").await,
            ToolDispatch::PauseCodeModifier => self.send_via(&self.code_modifier, "__pause__").await,
            ToolDispatch::Unknown(tool_name) => {
                warn!(%tool_name, "unknown tool requested by voice model");
                serde_json::json!({"ok": false, "error": "unknown_tool"})
            }
        }
    }

    async fn send_via(&self, slot: &Mutex<Option<Arc<ToolAdapter>>>, text: &str) -> serde_json::Value {
        let adapter = slot.lock().await.clone();
        match adapter {
            Some(adapter) => match adapter.send(text).await {
                Ok(()) => serde_json::json!({"ok": true}),
                Err(e) => serde_json::json!({"ok": false, "error": e.to_string()}),
            },
            None => serde_json::json!({"ok": false, "error": "adapter_not_connected"}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_agent_message_is_formatted() {
        let value = serde_json::json!({"type": "agent_message", "agent": "planner", "content": "looking into it"});
        assert_eq!(
            nested_narration(&value),
            Some("[TEAM planner] looking into it".to_string())
        );
    }

    #[test]
    fn nested_task_complete_is_formatted() {
        let value = serde_json::json!({"type": "task_complete", "outcome": "success", "summary": "done"});
        assert_eq!(
            nested_narration(&value),
            Some("[TEAM] Task success: done".to_string())
        );
    }

    #[test]
    fn code_modifier_tool_call_is_formatted() {
        let value = serde_json::json!({"type": "tool_call", "tool": "edit_file", "args": "main.rs"});
        assert_eq!(
            code_modifier_narration(&value),
            Some("[CODE edit_file] using main.rs".to_string())
        );
    }

    #[test]
    fn code_modifier_result_is_formatted() {
        let value = serde_json::json!({"type": "result", "message": "applied patch"});
        assert_eq!(
            code_modifier_narration(&value),
            Some("[CODE RESULT] applied patch".to_string())
        );
    }

    #[test]
    fn unrecognized_event_type_has_no_narration() {
        let value = serde_json::json!({"type": "heartbeat"});
        assert_eq!(nested_narration(&value), None);
        assert_eq!(code_modifier_narration(&value), None);
    }

    #[test]
    fn dispatch_maps_known_tool_names() {
        assert!(matches!(
            dispatch_tool_call("send_to_nested", "{\"text\":\"hi\"}"),
            ToolDispatch::SendToNested(ref t) if t == "hi"
        ));
        assert!(matches!(dispatch_tool_call("pause", "{}"), ToolDispatch::Pause));
        assert!(matches!(
            dispatch_tool_call("made_up_tool", "{}"),
            ToolDispatch::Unknown(ref t) if t == "made_up_tool"
        ));
    }

    #[tokio::test]
    async fn execute_unknown_tool_reports_clean_error() {
        let registry = AdapterRegistry::new();
        let result = registry.execute(ToolDispatch::Unknown("bogus".to_string())).await;
        assert_eq!(result["ok"], serde_json::json!(false));
        assert_eq!(result["error"], serde_json::json!("unknown_tool"));
    }

    #[tokio::test]
    async fn send_to_nested_wraps_text_in_user_message_envelope() {
        let (tx, mut rx) = mpsc::channel::<Message>(1);
        let adapter = Arc::new(ToolAdapter {
            name: "nested",
            url: "ws://example.invalid".to_string(),
            outbound_tx: tx,
        });
        let registry = AdapterRegistry::new();
        registry.set_nested(adapter).await;

        let result = registry
            .execute(ToolDispatch::SendToNested("create a todo app".to_string()))
            .await;
        assert_eq!(result["ok"], serde_json::json!(true));

        let Message::Text(sent) = rx.recv().await.unwrap() else {
            panic!("expected a text message");
        };
        let value: serde_json::Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(value, serde_json::json!({"type": "user_message", "data": "create a todo app"}));
    }

    #[tokio::test]
    async fn execute_with_absent_adapter_reports_not_connected() {
        let registry = AdapterRegistry::new();
        let result = registry
            .execute(ToolDispatch::SendToNested("hello".to_string()))
            .await;
        assert_eq!(result["ok"], serde_json::json!(false));
        assert_eq!(result["error"], serde_json::json!("adapter_not_connected"));
    }
}
