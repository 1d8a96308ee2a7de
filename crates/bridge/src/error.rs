//! Typed error surface for the bridge (protocol §7).
//!
//! Two tiers, mirroring the split this lineage already draws between a
//! protocol crate and a server crate: these `thiserror` enums are for
//! errors a caller must branch on (mapped to HTTP status codes below);
//! everything else (process wiring, I/O) uses `anyhow::Result` with
//! `.context(...)` at the call site.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Errors surfaced by the HTTP signaling/control surface (§6.1).
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("malformed SDP offer: {0}")]
    BadOffer(String),
    #[error("upstream session unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("unknown conversation_id: {0}")]
    ConversationNotFound(String),
    #[error("unknown connection_id: {0}")]
    ConnectionNotFound(String),
    #[error("signaling request for this conversation is already in flight")]
    RaceDetected,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for SignalingError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            SignalingError::BadOffer(_) => (StatusCode::BAD_REQUEST, "bad_offer"),
            SignalingError::UpstreamUnavailable(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "upstream_unavailable")
            }
            SignalingError::ConversationNotFound(_) => (StatusCode::NOT_FOUND, "conversation_not_found"),
            SignalingError::ConnectionNotFound(_) => (StatusCode::NOT_FOUND, "connection_not_found"),
            SignalingError::RaceDetected => (StatusCode::CONFLICT, "race_detected"),
            SignalingError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        (
            status,
            Json(json!({ "error": code, "message": self.to_string() })),
        )
            .into_response()
    }
}

/// Audio frame decode/validation errors (§4.1). Mirrors the shape of this
/// lineage's `FrameError` — carries enough context to log without
/// allocating a backtrace.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("opus decode failed: {0}")]
    DecodeFailed(String),
    #[error("opus encode failed: {0}")]
    EncodeFailed(String),
    #[error("frame had 0 samples")]
    EmptyFrame,
    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(u16),
}

/// Credential acquisition against the upstream speech service (§4.2, §7).
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("{api_key_env} is not set in the environment")]
    MissingApiKey { api_key_env: String },
    #[error("upstream refused session creation: HTTP {status}: {body}")]
    Refused { status: u16, body: String },
    #[error("timed out waiting for upstream session creation")]
    Timeout,
    #[error("transport error contacting upstream: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Tool adapter WebSocket errors (§4.6, §7).
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("adapter is not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn conversation_not_found_maps_to_404() {
        let err = SignalingError::ConversationNotFound("c1".to_string());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "conversation_not_found");
    }

    #[tokio::test]
    async fn race_detected_maps_to_409() {
        let err = SignalingError::RaceDetected;
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn bad_offer_maps_to_400() {
        let err = SignalingError::BadOffer("missing m= line".to_string());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn credential_error_messages_name_the_env_var() {
        let err = CredentialError::MissingApiKey {
            api_key_env: "OPENAI_API_KEY".to_string(),
        };
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }
}
