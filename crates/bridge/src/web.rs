//! Bridge Controller (§4.5): the HTTP/WebSocket surface that ties a
//! conversation's Upstream Session, Browser Connection Manager, Event
//! Store, and Tool Adapters together the first time a browser signals in.
//!
//! Grounded on `server::web`'s `AppState`/`build_router` shape, pared to the
//! bridge's own six routes plus the ambient `/healthz` — the teacher's
//! per-route auth/rate-limit/PAM machinery is not carried (authentication is
//! out of scope here), but `RequestBodyLimitLayer`, a `TraceLayer` with
//! request ids, and the `security_headers` middleware are, since those are
//! transport hygiene rather than authentication.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use voicebridge_protocol::{BridgeConfig, EventSource, SessionState, VoiceProfile};

use crate::adapters::{
    AdapterRegistry, ToolAdapter, code_modifier_narration, dispatch_tool_call, nested_narration,
};
use crate::browser::BrowserManager;
use crate::error::SignalingError;
use crate::events::SharedEventStore;
use crate::upstream::{ConnectParams, EventCallback, ToolCallCallback, UpstreamSession, UpstreamSessionManager};

/// Bookkeeping for one conversation's first-time wiring: the Browser
/// Manager and Tool Adapter registry live here, keyed by `conversation_id`,
/// alongside the Upstream Session Manager's own map (§4.5.1).
pub struct ConversationEntry {
    pub browser_manager: Arc<BrowserManager>,
    pub adapters: Arc<AdapterRegistry>,
}

pub struct AppState {
    pub config: BridgeConfig,
    pub upstream_sessions: UpstreamSessionManager,
    pub event_store: SharedEventStore,
    pub conversations: RwLock<HashMap<String, Arc<ConversationEntry>>>,
    pub started_at: std::time::Instant,
}

impl AppState {
    pub fn new(config: BridgeConfig, event_store: SharedEventStore) -> Self {
        Self {
            config,
            upstream_sessions: UpstreamSessionManager::new(),
            event_store,
            conversations: RwLock::new(HashMap::new()),
            started_at: std::time::Instant::now(),
        }
    }
}

async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'self'; connect-src 'self' wss: ws:"),
    );
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static("camera=(), geolocation=()"),
    );
    response
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let max_body_bytes = state.config.server.max_body_bytes;
    Router::new()
        .route("/bridge/signal", post(signal))
        .route("/bridge/disconnect", post(disconnect))
        .route("/bridge/conversation/{id}", delete(stop_conversation))
        .route("/bridge/conversation/{id}/status", get(status))
        .route("/bridge/conversation/{id}/text", post(send_text))
        .route("/bridge/conversation/{id}/commit", post(commit))
        .route("/bridge/conversation/{id}/events", get(events_ws_upgrade))
        .route("/healthz", get(healthz))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(security_headers))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

#[derive(Deserialize)]
struct SignalRequestBody {
    conversation_id: String,
    offer_sdp: String,
    voice: Option<VoiceProfile>,
    model: Option<String>,
    system_prompt: Option<String>,
}

#[derive(Serialize)]
struct SignalResponseBody {
    connection_id: String,
    answer_sdp: String,
}

/// POST /bridge/signal (§6.1): resolve-or-create the conversation's
/// Upstream Session and Browser Manager, wire them together on first use,
/// then add the new browser connection.
async fn signal(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignalRequestBody>,
) -> Result<Json<SignalResponseBody>, SignalingError> {
    let conversation_id = req.conversation_id.clone();
    let voice = req.voice.unwrap_or_default();

    state
        .event_store
        .ensure_conversation(&conversation_id, voice.clone())
        .await;

    let entry = get_or_create_conversation_entry(&state, &conversation_id).await;

    let upstream = get_or_create_upstream_session(
        &state,
        &conversation_id,
        voice,
        req.model,
        req.system_prompt,
        Arc::clone(&entry),
    )
    .await?;

    let (connection_id, answer_sdp) = entry
        .browser_manager
        .add_connection(
            &req.offer_sdp,
            &state.config.ice,
            browser_audio_callback(upstream),
            audio_event_callback(Arc::clone(&state.event_store), conversation_id.clone()),
        )
        .await?;

    Ok(Json(SignalResponseBody {
        connection_id,
        answer_sdp,
    }))
}

fn audio_event_callback(
    event_store: SharedEventStore,
    conversation_id: String,
) -> crate::browser::AudioEventCallback {
    Arc::new(move |event_type, payload| {
        let event_store = Arc::clone(&event_store);
        let conversation_id = conversation_id.clone();
        tokio::spawn(async move {
            event_store
                .append(&conversation_id, EventSource::Controller, event_type, payload)
                .await;
        });
    })
}

fn browser_audio_callback(upstream: Arc<UpstreamSession>) -> Arc<dyn Fn(Vec<i16>) + Send + Sync> {
    Arc::new(move |samples| {
        let upstream = Arc::clone(&upstream);
        tokio::spawn(async move {
            if let Err(e) = upstream.send_audio_frame(&samples).await {
                warn!("failed to forward browser audio upstream: {e:#}");
            }
        });
    })
}

async fn get_or_create_conversation_entry(
    state: &Arc<AppState>,
    conversation_id: &str,
) -> Arc<ConversationEntry> {
    if let Some(entry) = state.conversations.read().await.get(conversation_id).cloned() {
        return entry;
    }
    let mut conversations = state.conversations.write().await;
    Arc::clone(conversations.entry(conversation_id.to_string()).or_insert_with(|| {
        Arc::new(ConversationEntry {
            browser_manager: Arc::new(BrowserManager::new(
                state.config.audio.broadcast_queue_frames,
                state.config.audio.opus_bitrate,
                state.config.audio.max_consecutive_decode_errors,
            )),
            adapters: Arc::new(AdapterRegistry::new()),
        })
    }))
}

async fn get_or_create_upstream_session(
    state: &Arc<AppState>,
    conversation_id: &str,
    voice: VoiceProfile,
    model: Option<String>,
    system_prompt: Option<String>,
    entry: Arc<ConversationEntry>,
) -> anyhow::Result<Arc<UpstreamSession>> {
    let config = state.config.clone();
    let event_store = Arc::clone(&state.event_store);
    let browser_manager = Arc::clone(&entry.browser_manager);
    let adapters = Arc::clone(&entry.adapters);
    let conversation_id_owned = conversation_id.to_string();

    state
        .upstream_sessions
        .get_or_create(conversation_id, move || async move {
            let event_cb = event_callback(Arc::clone(&event_store), conversation_id_owned.clone());
            let session_cell: Arc<RwLock<Option<Arc<UpstreamSession>>>> = Arc::new(RwLock::new(None));
            let tool_call_cb = tool_call_callback(
                Arc::clone(&event_store),
                Arc::clone(&adapters),
                conversation_id_owned.clone(),
                Arc::clone(&session_cell),
            );
            let audio_out_cb = {
                let browser_manager = Arc::clone(&browser_manager);
                let audio_out_cb: Arc<dyn Fn(Vec<i16>) + Send + Sync> = Arc::new(move |samples| {
                    let browser_manager = Arc::clone(&browser_manager);
                    tokio::spawn(async move {
                        browser_manager.broadcast_audio(samples).await;
                    });
                });
                audio_out_cb
            };

            let api_key = std::env::var(&config.upstream.api_key_env).map_err(|_| {
                crate::error::CredentialError::MissingApiKey {
                    api_key_env: config.upstream.api_key_env.clone(),
                }
            })?;

            let params = ConnectParams {
                conversation_id: conversation_id_owned.clone(),
                api_key,
                session_url: config.upstream.session_url.clone(),
                signaling_url: config.upstream.signaling_url.clone(),
                model: model.unwrap_or_else(|| config.upstream.model.clone()),
                voice,
                instructions: system_prompt.unwrap_or_else(|| config.upstream.default_instructions.clone()),
                transcription_language: config.upstream.transcription_language.clone(),
                transcription_model: config.upstream.transcription_model.clone(),
                server_vad: config.upstream.server_vad,
                credential_timeout: std::time::Duration::from_secs(config.upstream.credential_timeout_secs),
                sdp_timeout: std::time::Duration::from_secs(config.upstream.sdp_timeout_secs),
                data_channel_timeout: std::time::Duration::from_secs(config.upstream.data_channel_timeout_secs),
                opus_bitrate: config.audio.opus_bitrate,
                max_consecutive_decode_errors: config.audio.max_consecutive_decode_errors,
                tools: voicebridge_protocol::fixed_tool_manifest(),
            };

            let session = UpstreamSession::connect(params, event_cb, tool_call_cb, audio_out_cb).await?;
            *session_cell.write().await = Some(Arc::clone(&session));
            spawn_default_adapters(&config, Arc::clone(&session), Arc::clone(&adapters), Arc::clone(&event_store), conversation_id_owned.clone());
            Ok(session)
        })
        .await
}

fn spawn_default_adapters(
    config: &BridgeConfig,
    upstream: Arc<UpstreamSession>,
    adapters: Arc<AdapterRegistry>,
    event_store: SharedEventStore,
    conversation_id: String,
) {
    if config.adapters.nested_enabled {
        let url = config.adapters.nested_url.clone();
        let event_store = Arc::clone(&event_store);
        let conversation_id = conversation_id.clone();
        let on_event: Arc<dyn Fn(String, serde_json::Value) + Send + Sync> = Arc::new(move |event_type, payload| {
            let event_store = Arc::clone(&event_store);
            let conversation_id = conversation_id.clone();
            tokio::spawn(async move {
                event_store.append(&conversation_id, EventSource::Nested, event_type, payload).await;
            });
        });
        let adapter = ToolAdapter::spawn(
            "nested",
            url,
            Arc::clone(&upstream),
            Arc::new(nested_narration),
            on_event,
            config.adapters.reconnect_initial_secs,
            config.adapters.reconnect_max_secs,
        );
        let adapters = Arc::clone(&adapters);
        tokio::spawn(async move {
            adapters.set_nested(adapter).await;
        });
    }

    if config.adapters.code_modifier_enabled {
        let url = config.adapters.code_modifier_url.clone();
        let event_store = Arc::clone(&event_store);
        let conversation_id = conversation_id.clone();
        let on_event: Arc<dyn Fn(String, serde_json::Value) + Send + Sync> = Arc::new(move |event_type, payload| {
            let event_store = Arc::clone(&event_store);
            let conversation_id = conversation_id.clone();
            tokio::spawn(async move {
                event_store.append(&conversation_id, EventSource::CodeModifier, event_type, payload).await;
            });
        });
        let adapter = ToolAdapter::spawn(
            "code_modifier",
            url,
            upstream,
            Arc::new(code_modifier_narration),
            on_event,
            config.adapters.reconnect_initial_secs,
            config.adapters.reconnect_max_secs,
        );
        tokio::spawn(async move {
            adapters.set_code_modifier(adapter).await;
        });
    }
}

fn event_callback(event_store: SharedEventStore, conversation_id: String) -> EventCallback {
    Arc::new(move |source: EventSource, event_type: String, payload: serde_json::Value| {
        let event_store = Arc::clone(&event_store);
        let conversation_id = conversation_id.clone();
        tokio::spawn(async move {
            event_store.append(&conversation_id, source, event_type, payload).await;
        });
    })
}

fn tool_call_callback(
    event_store: SharedEventStore,
    adapters: Arc<AdapterRegistry>,
    conversation_id: String,
    session_cell: Arc<RwLock<Option<Arc<UpstreamSession>>>>,
) -> ToolCallCallback {
    Arc::new(move |call_id: String, tool_name: String, arguments: String| {
        let event_store = Arc::clone(&event_store);
        let adapters = Arc::clone(&adapters);
        let conversation_id = conversation_id.clone();
        let session_cell = Arc::clone(&session_cell);
        tokio::spawn(async move {
            let dispatch = dispatch_tool_call(&tool_name, &arguments);
            let result = adapters.execute(dispatch).await;
            event_store
                .append(
                    &conversation_id,
                    EventSource::Controller,
                    "tool.dispatched",
                    json!({ "call_id": call_id, "tool_name": tool_name, "result": result }),
                )
                .await;

            // The session only exists by the time this fires (the data
            // channel that carries function calls opens after `connect`
            // returns and populates the cell), but the cell indirection is
            // still needed since this callback is built before `connect`
            // returns.
            if let Some(session) = session_cell.read().await.clone() {
                let output = result.to_string();
                if let Err(e) = session.send_function_call_result(&call_id, &output).await {
                    warn!("failed to report tool result to voice model: {e:#}");
                }
            }
        });
    })
}

#[derive(Deserialize)]
struct DisconnectRequestBody {
    conversation_id: String,
    connection_id: String,
}

/// Disconnect is an idempotent no-op for an unknown conversation (§8) rather
/// than a 404 — unlike status/text/commit (§6.1), it has nothing to fail:
/// there is no browser connection left to remove either way.
async fn disconnect(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DisconnectRequestBody>,
) -> Result<Json<serde_json::Value>, SignalingError> {
    let entry = state.conversations.read().await.get(&req.conversation_id).cloned();
    if let Some(entry) = entry {
        entry
            .browser_manager
            .remove_connection(&req.connection_id)
            .await
            .map_err(SignalingError::Internal)?;
    }
    Ok(Json(json!({ "ok": true })))
}

async fn stop_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<serde_json::Value>, SignalingError> {
    let entry = state.conversations.write().await.remove(&conversation_id);
    if let Some(entry) = entry {
        entry
            .browser_manager
            .close_all()
            .await
            .map_err(SignalingError::Internal)?;
    }
    state
        .upstream_sessions
        .close(&conversation_id)
        .await
        .map_err(SignalingError::Internal)?;
    info!(%conversation_id, "conversation stopped");
    Ok(Json(json!({ "ok": true })))
}

#[derive(Serialize)]
struct StatusResponseBody {
    browser_count: usize,
    session_state: SessionState,
}

async fn status(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<StatusResponseBody>, SignalingError> {
    let entry = state
        .conversations
        .read()
        .await
        .get(&conversation_id)
        .cloned()
        .ok_or_else(|| SignalingError::ConversationNotFound(conversation_id.clone()))?;

    let session_state = match state.upstream_sessions.get(&conversation_id).await {
        Some(session) => session.state().await,
        None => SessionState::Absent,
    };

    Ok(Json(StatusResponseBody {
        browser_count: entry.browser_manager.browser_count().await,
        session_state,
    }))
}

#[derive(Deserialize)]
struct TextRequestBody {
    text: String,
}

async fn send_text(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Json(req): Json<TextRequestBody>,
) -> Result<Json<serde_json::Value>, SignalingError> {
    let session = state
        .upstream_sessions
        .get(&conversation_id)
        .await
        .ok_or_else(|| SignalingError::ConversationNotFound(conversation_id.clone()))?;
    session
        .send_text(&req.text)
        .await
        .map_err(SignalingError::Internal)?;
    Ok(Json(json!({ "ok": true })))
}

async fn commit(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<serde_json::Value>, SignalingError> {
    let session = state
        .upstream_sessions
        .get(&conversation_id)
        .await
        .ok_or_else(|| SignalingError::ConversationNotFound(conversation_id.clone()))?;
    session
        .commit_audio_buffer(state.config.upstream.server_vad)
        .await
        .map_err(SignalingError::Internal)?;
    Ok(Json(json!({ "ok": true })))
}

async fn events_ws_upgrade(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !state.event_store.exists(&conversation_id).await {
        return (StatusCode::NOT_FOUND, "conversation not found").into_response();
    }
    ws.on_upgrade(move |socket| stream_events(socket, state, conversation_id))
        .into_response()
}

async fn stream_events(mut socket: WebSocket, state: Arc<AppState>, conversation_id: String) {
    let Some(mut rx) = state.event_store.subscribe(&conversation_id).await else {
        let _ = socket.close().await;
        return;
    };

    for event in state.event_store.history(&conversation_id).await {
        if send_event(&mut socket, &event).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(WsMessage::Close(_))) | None => return,
                    Some(Err(_)) => return,
                    _ => {}
                }
            }
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &voicebridge_protocol::Event) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(t) => t,
        Err(_) => return Ok(()),
    };
    socket.send(WsMessage::Text(text.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(BridgeConfig::default(), Arc::new(crate::events::EventStore::new())))
    }

    #[tokio::test]
    async fn status_returns_404_for_unknown_conversation() {
        let state = test_state();
        let result = status(State(state), Path("ghost".to_string())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn send_text_returns_404_for_unknown_conversation() {
        let state = test_state();
        let result = send_text(
            State(state),
            Path("ghost".to_string()),
            Json(TextRequestBody { text: "hi".to_string() }),
        )
        .await;
        assert!(result.is_err());
    }

    // These use `tower::ServiceExt::oneshot` to send requests through the
    // axum router without starting a real HTTP/TLS listener.
    mod router_tests {
        use super::*;
        use axum::body::Body;
        use axum::http::Request;
        use http_body_util::BodyExt;
        use tower::ServiceExt;

        async fn body_json(response: axum::response::Response<Body>) -> serde_json::Value {
            let bytes = response
                .into_body()
                .collect()
                .await
                .expect("failed to read response body")
                .to_bytes();
            serde_json::from_slice(&bytes).expect("response body is not valid JSON")
        }

        #[tokio::test]
        async fn healthz_returns_ok() {
            let app = build_router(test_state());
            let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
            let response = app.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let json = body_json(response).await;
            assert_eq!(json["status"], "ok");
        }

        #[tokio::test]
        async fn status_route_404s_for_unknown_conversation() {
            let app = build_router(test_state());
            let request = Request::builder()
                .uri("/bridge/conversation/ghost/status")
                .body(Body::empty())
                .unwrap();
            let response = app.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }

        #[tokio::test]
        async fn signal_route_rejects_body_missing_required_fields() {
            let app = build_router(test_state());
            let request = Request::builder()
                .method("POST")
                .uri("/bridge/signal")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap();
            let response = app.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        }

        #[tokio::test]
        async fn events_ws_route_404s_for_unknown_conversation() {
            let app = build_router(test_state());
            let request = Request::builder()
                .uri("/bridge/conversation/ghost/events")
                .header("connection", "upgrade")
                .header("upgrade", "websocket")
                .header("sec-websocket-version", "13")
                .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                .body(Body::empty())
                .unwrap();
            let response = app.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_for_unknown_conversation() {
        let state = test_state();
        let result = disconnect(
            State(state),
            Json(DisconnectRequestBody {
                conversation_id: "ghost".to_string(),
                connection_id: "c1".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(result.0, json!({ "ok": true }));
    }
}
