use serde::{Deserialize, Serialize};

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub audio: AudioConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP(S) port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to TLS certificate. Both this and `tls_key` must be set to enable TLS.
    pub tls_cert: Option<String>,
    /// Path to TLS private key.
    pub tls_key: Option<String>,
    /// Maximum request body size in bytes (SDP offers can be a few KB; keep generous).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Connection parameters for the upstream speech-to-speech service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the service's session-creation (credential) endpoint.
    #[serde(default = "default_session_url")]
    pub session_url: String,
    /// Base URL used to POST the SDP offer for the ephemeral signaling exchange.
    #[serde(default = "default_signaling_url")]
    pub signaling_url: String,
    /// Name of the environment variable holding the API key. Never stored in the
    /// config file itself.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Model identifier sent at session creation, unless overridden per-request.
    #[serde(default = "default_model")]
    pub model: String,
    /// Default voice, unless overridden per-request.
    #[serde(default)]
    pub voice: crate::VoiceProfile,
    /// System prompt sent at session creation, unless overridden per-request.
    /// May be empty (protocol §4.2).
    #[serde(default)]
    pub default_instructions: String,
    /// Explicit transcription language hint (e.g. "en"). Empty string lets the
    /// service auto-detect, which the design notes call out as usually undesired.
    #[serde(default = "default_transcription_language")]
    pub transcription_language: String,
    /// Transcription model name.
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    /// When false, `turn_detection` is sent as `null` (manual commit mode).
    #[serde(default = "default_true")]
    pub server_vad: bool,
    /// Timeout for the credential POST, in seconds.
    #[serde(default = "default_credential_timeout_secs")]
    pub credential_timeout_secs: u64,
    /// Timeout for the SDP exchange POST, in seconds.
    #[serde(default = "default_sdp_timeout_secs")]
    pub sdp_timeout_secs: u64,
    /// Timeout waiting for the control data channel to open, in seconds.
    #[serde(default = "default_data_channel_timeout_secs")]
    pub data_channel_timeout_secs: u64,
}

/// Outbound WebSocket endpoints for the two fixed tool adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptersConfig {
    /// Enable the nested-agents adapter.
    #[serde(default = "default_true")]
    pub nested_enabled: bool,
    /// WebSocket URL of the nested-agents subsystem.
    #[serde(default = "default_nested_url")]
    pub nested_url: String,
    /// Enable the code-modifier adapter.
    #[serde(default = "default_true")]
    pub code_modifier_enabled: bool,
    /// WebSocket URL of the code-modifier subsystem.
    #[serde(default = "default_code_modifier_url")]
    pub code_modifier_url: String,
    /// Initial reconnect backoff, in seconds.
    #[serde(default = "default_reconnect_initial_secs")]
    pub reconnect_initial_secs: u64,
    /// Maximum reconnect backoff, in seconds.
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
}

/// ICE/TURN server configuration for the browser-facing WebRTC peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

/// Audio pipeline tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Consecutive decode failures before an `audio.decode_degraded` event fires.
    #[serde(default = "default_max_consecutive_decode_errors")]
    pub max_consecutive_decode_errors: u32,
    /// Per-browser outbound queue depth, in 20ms frames (50 == 1 second).
    #[serde(default = "default_broadcast_queue_frames")]
    pub broadcast_queue_frames: usize,
    /// Opus encode bitrate for the upstream-bound mono track.
    #[serde(default = "default_opus_bitrate")]
    pub opus_bitrate: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls_cert: None,
            tls_key: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            session_url: default_session_url(),
            signaling_url: default_signaling_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            voice: crate::VoiceProfile::default(),
            default_instructions: String::new(),
            transcription_language: default_transcription_language(),
            transcription_model: default_transcription_model(),
            server_vad: true,
            credential_timeout_secs: default_credential_timeout_secs(),
            sdp_timeout_secs: default_sdp_timeout_secs(),
            data_channel_timeout_secs: default_data_channel_timeout_secs(),
        }
    }
}

impl Default for AdaptersConfig {
    fn default() -> Self {
        Self {
            nested_enabled: true,
            nested_url: default_nested_url(),
            code_modifier_enabled: true,
            code_modifier_url: default_code_modifier_url(),
            reconnect_initial_secs: default_reconnect_initial_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            max_consecutive_decode_errors: default_max_consecutive_decode_errors(),
            broadcast_queue_frames: default_broadcast_queue_frames(),
            opus_bitrate: default_opus_bitrate(),
        }
    }
}

impl BridgeConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, process should not start) or
    /// "WARNING:" (advisory, process can start but the config is likely wrong).
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    issues.push(format!("ERROR: server.tls_cert '{cert}' does not exist."));
                }
                if !std::path::Path::new(key).exists() {
                    issues.push(format!("ERROR: server.tls_key '{key}' does not exist."));
                }
            }
            (Some(_), None) => issues.push(
                "WARNING: server.tls_cert is set but server.tls_key is not. Both must be set to enable TLS; the process will bind plain HTTP.".to_string(),
            ),
            (None, Some(_)) => issues.push(
                "WARNING: server.tls_key is set but server.tls_cert is not. Both must be set to enable TLS; the process will bind plain HTTP.".to_string(),
            ),
            (None, None) => {}
        }

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        if std::env::var(&self.upstream.api_key_env).is_err() {
            issues.push(format!(
                "WARNING: environment variable '{}' (upstream.api_key_env) is not set. \
                 Upstream session creation will fail with a credential error until it is.",
                self.upstream.api_key_env
            ));
        }

        if self.upstream.transcription_language.is_empty() {
            issues.push(
                "WARNING: upstream.transcription_language is empty. The service will \
                 auto-detect the spoken language and may respond in a language other \
                 than the one implied by the system prompt."
                    .to_string(),
            );
        }

        if self.upstream.credential_timeout_secs == 0 {
            issues.push(
                "ERROR: upstream.credential_timeout_secs must be >= 1.".to_string(),
            );
        }
        if self.upstream.sdp_timeout_secs == 0 {
            issues.push("ERROR: upstream.sdp_timeout_secs must be >= 1.".to_string());
        }
        if self.upstream.data_channel_timeout_secs == 0 {
            issues.push(
                "ERROR: upstream.data_channel_timeout_secs must be >= 1.".to_string(),
            );
        }

        if self.adapters.reconnect_max_secs < self.adapters.reconnect_initial_secs {
            issues.push(
                "ERROR: adapters.reconnect_max_secs must be >= adapters.reconnect_initial_secs."
                    .to_string(),
            );
        }

        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{url}' must start with 'stun:' or 'stuns:'."
                ));
            }
        }
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{url}' must start with 'turn:' or 'turns:'."
                ));
            }
        }

        if self.audio.max_consecutive_decode_errors == 0 {
            issues.push(
                "ERROR: audio.max_consecutive_decode_errors must be >= 1.".to_string(),
            );
        }
        if self.audio.broadcast_queue_frames == 0 {
            issues.push("ERROR: audio.broadcast_queue_frames must be >= 1.".to_string());
        }

        issues
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_body_bytes() -> usize {
    1_048_576 // SDP offers are small; 1MiB is generous headroom.
}
fn default_session_url() -> String {
    "https://api.openai.com/v1/realtime/sessions".to_string()
}
fn default_signaling_url() -> String {
    "https://api.openai.com/v1/realtime".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_model() -> String {
    "gpt-4o-realtime-preview".to_string()
}
fn default_transcription_language() -> String {
    "en".to_string()
}
fn default_transcription_model() -> String {
    "whisper-1".to_string()
}
fn default_credential_timeout_secs() -> u64 {
    5
}
fn default_sdp_timeout_secs() -> u64 {
    5
}
fn default_data_channel_timeout_secs() -> u64 {
    10
}
fn default_nested_url() -> String {
    "ws://127.0.0.1:8090/nested".to_string()
}
fn default_code_modifier_url() -> String {
    "ws://127.0.0.1:8091/code-modifier".to_string()
}
fn default_reconnect_initial_secs() -> u64 {
    2
}
fn default_reconnect_max_secs() -> u64 {
    60
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
fn default_max_consecutive_decode_errors() -> u32 {
    16
}
fn default_broadcast_queue_frames() -> usize {
    50
}
fn default_opus_bitrate() -> i32 {
    32_000
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: BridgeConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert!(config.server.tls_cert.is_none());
        assert!(config.server.tls_key.is_none());

        assert_eq!(config.upstream.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.upstream.transcription_language, "en");
        assert!(config.upstream.server_vad);
        assert_eq!(config.upstream.credential_timeout_secs, 5);
        assert_eq!(config.upstream.sdp_timeout_secs, 5);
        assert_eq!(config.upstream.data_channel_timeout_secs, 10);

        assert!(config.adapters.nested_enabled);
        assert!(config.adapters.code_modifier_enabled);
        assert_eq!(config.adapters.reconnect_initial_secs, 2);
        assert_eq!(config.adapters.reconnect_max_secs, 60);

        assert_eq!(config.ice.stun_urls.len(), 2);
        assert!(config.ice.turn_urls.is_empty());

        assert_eq!(config.audio.max_consecutive_decode_errors, 16);
        assert_eq!(config.audio.broadcast_queue_frames, 50);
    }

    #[test]
    fn partial_config_only_upstream_section() {
        let toml_str = r#"
[upstream]
model = "gpt-4o-realtime-preview-2024-12-17"
transcription_language = ""
"#;
        let config: BridgeConfig =
            toml::from_str(toml_str).expect("partial config should deserialize");
        assert_eq!(config.upstream.model, "gpt-4o-realtime-preview-2024-12-17");
        assert_eq!(config.upstream.transcription_language, "");
        assert_eq!(config.upstream.credential_timeout_secs, 5);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn validate_reports_empty_transcription_language_as_warning() {
        let mut config = BridgeConfig {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            adapters: AdaptersConfig::default(),
            ice: IceConfig::default(),
            audio: AudioConfig::default(),
        };
        config.upstream.transcription_language = String::new();
        let issues = config.validate();
        assert!(
            issues
                .iter()
                .any(|i| i.starts_with("WARNING:") && i.contains("transcription_language"))
        );
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut config = BridgeConfig {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            adapters: AdaptersConfig::default(),
            ice: IceConfig::default(),
            audio: AudioConfig::default(),
        };
        config.server.port = 0;
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:") && i.contains("port")));
    }

    #[test]
    fn validate_rejects_bad_stun_scheme() {
        let mut config = BridgeConfig {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            adapters: AdaptersConfig::default(),
            ice: IceConfig::default(),
            audio: AudioConfig::default(),
        };
        config.ice.stun_urls = vec!["https://example.com".to_string()];
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:") && i.contains("STUN")));
    }

    #[test]
    fn validate_rejects_inverted_reconnect_bounds() {
        let mut config = BridgeConfig {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            adapters: AdaptersConfig::default(),
            ice: IceConfig::default(),
            audio: AudioConfig::default(),
        };
        config.adapters.reconnect_initial_secs = 120;
        config.adapters.reconnect_max_secs = 60;
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:") && i.contains("reconnect")));
    }
}
