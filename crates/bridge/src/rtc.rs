//! Shared WebRTC plumbing used by both the Upstream Session and the
//! Browser Connection Manager: an Opus-only `MediaEngine`/`API`, grounded
//! directly on `agent::peer::WebRTCPeer`'s codec registration but with the
//! H.264/video half removed entirely — this bridge carries no video.

use webrtc::api::API;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};

pub fn build_opus_only_api() -> anyhow::Result<API> {
    let mut media_engine = MediaEngine::default();

    // Register ONLY Opus. No `register_default_codecs()` — that pulls in
    // VP8/VP9/H.264 registrations this bridge has no use for and no sender
    // for, same reasoning the teacher applies to its own H.264-only video
    // registration.
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Build an `RTCConfiguration` from the configured STUN/TURN servers.
pub fn build_rtc_config(ice: &voicebridge_protocol::IceConfig) -> RTCConfiguration {
    let mut ice_servers = Vec::new();
    if !ice.stun_urls.is_empty() {
        ice_servers.push(RTCIceServer {
            urls: ice.stun_urls.clone(),
            ..Default::default()
        });
    }
    if !ice.turn_urls.is_empty() {
        ice_servers.push(RTCIceServer {
            urls: ice.turn_urls.clone(),
            username: ice.turn_username.clone().unwrap_or_default(),
            credential: ice.turn_credential.clone().unwrap_or_default(),
        });
    }
    if ice_servers.is_empty() {
        ice_servers.push(RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            ..Default::default()
        });
    }
    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}
