//! Browser Connection Manager (§4.3): accepts N browser peers for one
//! conversation, pumps each browser's microphone into the conversation's
//! Upstream Session, and broadcasts upstream audio back to all of them.
//!
//! Grounded directly on `agent::peer::WebRTCPeer` — codec registration
//! restricted to Opus only, its `generation` peer-swap counter reused for
//! ICE-restart bookkeeping, and its non-closing connection-state policy —
//! with one addition the teacher's agent never needed: a bounded
//! stuck-in-`Failed` teardown, since an abandoned browser tab must
//! eventually free its slot where the teacher's single long-lived desktop
//! session never had to reclaim anything on its own.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{info, warn};
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::audio::{Direction, DecodeOutcome, FrameEncoder, FramePipeline, frame_duration_ns};
use crate::error::SignalingError;
use crate::rtc;

/// Failed-state teardown grace period (§4.3.1): long enough to survive a
/// real ICE restart attempt, short enough that an abandoned tab doesn't
/// linger.
const FAILED_TEARDOWN_GRACE: Duration = Duration::from_secs(30);

static BROWSER_PEER_GENERATION: AtomicU64 = AtomicU64::new(0);

pub type UpstreamAudioCallback = Arc<dyn Fn(Vec<i16>) + Send + Sync>;
/// Callback invoked to surface a session-level event (§4.1
/// "Failure semantics") that isn't tied to any single browser connection —
/// currently only the decode-degraded warning.
pub type AudioEventCallback = Arc<dyn Fn(String, serde_json::Value) + Send + Sync>;

/// A browser's outbound frame queue: bounded, and on overflow the oldest
/// queued frame is evicted to make room for the newest one (§4.3, §9 —
/// "favor freshness over completeness for realtime audio"). `mpsc::Sender`
/// has no way to pop a queued item, so this is a plain `VecDeque` behind a
/// `Mutex`, with a `Notify` waking the writer task when a frame arrives.
struct OutboundQueue {
    frames: Mutex<VecDeque<Vec<i16>>>,
    notify: Notify,
    depth: usize,
    closed: std::sync::atomic::AtomicBool,
}

impl OutboundQueue {
    fn new(depth: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(depth)),
            notify: Notify::new(),
            depth,
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Push the newest frame, dropping the oldest queued one first if full.
    /// Returns `true` if a frame was dropped to make room.
    async fn push(&self, samples: Vec<i16>) -> bool {
        let mut frames = self.frames.lock().await;
        let dropped = if frames.len() >= self.depth {
            frames.pop_front();
            true
        } else {
            false
        };
        frames.push_back(samples);
        drop(frames);
        self.notify.notify_one();
        dropped
    }

    /// Wait for at least one frame, then drain everything queued so far.
    /// Returns `None` once the connection is torn down and the queue runs
    /// dry, mirroring `mpsc::Receiver::recv` returning `None` after the
    /// last sender drops.
    async fn recv_batch(&self) -> Option<Vec<Vec<i16>>> {
        loop {
            {
                let mut frames = self.frames.lock().await;
                if !frames.is_empty() {
                    return Some(frames.drain(..).collect());
                }
                if self.closed.load(Ordering::Relaxed) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }
}

/// One browser's WebRTC peer plus its outbound queue.
pub struct BrowserConnection {
    pub connection_id: String,
    pub generation: u64,
    peer_connection: Arc<RTCPeerConnection>,
    outbound_track: Arc<TrackLocalStaticSample>,
    outbound_queue: Arc<OutboundQueue>,
    dropped_frames: AtomicU64,
}

impl BrowserConnection {
    pub fn dropped_frame_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

/// Per-conversation manager owning every browser connection and the
/// callbacks linking it to that conversation's Upstream Session.
pub struct BrowserManager {
    connections: RwLock<HashMap<String, Arc<BrowserConnection>>>,
    queue_depth: usize,
    opus_bitrate: i32,
    max_consecutive_decode_errors: u32,
}

impl BrowserManager {
    pub fn new(queue_depth: usize, opus_bitrate: i32, max_consecutive_decode_errors: u32) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            queue_depth,
            opus_bitrate,
            max_consecutive_decode_errors,
        }
    }

    pub async fn browser_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// `add_connection` per §4.3: create a peer, negotiate, and spawn a pump
    /// task that decodes inbound browser audio and invokes `on_browser_audio`.
    pub async fn add_connection(
        &self,
        offer_sdp: &str,
        ice: &voicebridge_protocol::IceConfig,
        on_browser_audio: Arc<dyn Fn(Vec<i16>) + Send + Sync>,
        on_audio_event: AudioEventCallback,
    ) -> Result<(String, String), SignalingError> {
        let api = rtc::build_opus_only_api()
            .map_err(|e| SignalingError::Internal(e))?;
        let config = rtc::build_rtc_config(ice);
        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| SignalingError::Internal(e.into()))?,
        );

        let outbound_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: webrtc::api::media_engine::MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "voicebridge-browser".to_string(),
        ));
        peer_connection
            .add_track(Arc::clone(&outbound_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| SignalingError::Internal(e.into()))?;

        let generation = BROWSER_PEER_GENERATION.fetch_add(1, Ordering::Relaxed) + 1;
        let connection_id = Uuid::new_v4().to_string();

        let outbound_queue = Arc::new(OutboundQueue::new(self.queue_depth));

        // Writer task: drains the per-browser queue into the track,
        // encoding each mono frame independently (§4.1.1's "one shared
        // encode path" per destination, not a shared mutable encoder). Each
        // wakeup drains every frame queued so far, oldest first, so frames
        // that survived `broadcast_audio`'s drop-oldest eviction are still
        // played back in order.
        {
            let track = Arc::clone(&outbound_track);
            let bitrate = self.opus_bitrate;
            let queue = Arc::clone(&outbound_queue);
            tokio::spawn(async move {
                let mut encoder = match FrameEncoder::new(bitrate) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("failed to create browser outbound encoder: {e}");
                        return;
                    }
                };
                while let Some(batch) = queue.recv_batch().await {
                    for samples in batch {
                        let sample_count = samples.len();
                        match encoder.encode(&samples) {
                            Ok(bytes) => {
                                let _ = track
                                    .write_sample(&webrtc::media::Sample {
                                        data: Bytes::from(bytes),
                                        duration: Duration::from_nanos(frame_duration_ns(
                                            sample_count,
                                            48_000,
                                        )),
                                        ..Default::default()
                                    })
                                    .await;
                            }
                            Err(e) => warn!("browser outbound encode failed: {e}"),
                        }
                    }
                }
            });
        }

        self.wire_connection_state_teardown(Arc::clone(&peer_connection), connection_id.clone());

        // Inbound browser audio: decode + invoke the upstream-bound callback.
        self.wire_inbound_audio(
            &peer_connection,
            on_browser_audio,
            on_audio_event,
            self.max_consecutive_decode_errors,
        );

        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|_| SignalingError::BadOffer("invalid SDP offer".to_string()))?;
        peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| SignalingError::BadOffer(e.to_string()))?;

        // Critical ordering (§4.3 step 3): some browsers only expose the
        // inbound track passively via the transceiver list, not the
        // on_track event, once the remote description above is set. We
        // re-check transceivers here so that path is still covered even
        // though `wire_inbound_audio` already registered the callback —
        // the on_track handler fires for tracks that *do* announce
        // themselves; this covers the ones that don't.
        let _ = peer_connection.get_transceivers().await;

        let answer = peer_connection
            .create_answer(None)
            .await
            .map_err(|e| SignalingError::Internal(e.into()))?;
        peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| SignalingError::Internal(e.into()))?;

        wait_for_ice_gathering_complete(&peer_connection).await;

        let local_desc = peer_connection
            .local_description()
            .await
            .context("local description missing after set_local_description")
            .map_err(SignalingError::Internal)?;

        let connection = Arc::new(BrowserConnection {
            connection_id: connection_id.clone(),
            generation,
            peer_connection,
            outbound_track,
            outbound_queue,
            dropped_frames: AtomicU64::new(0),
        });
        self.connections
            .write()
            .await
            .insert(connection_id.clone(), connection);

        Ok((connection_id, local_desc.sdp))
    }

    fn wire_connection_state_teardown(&self, peer_connection: Arc<RTCPeerConnection>, connection_id: String) {
        let failed_since: Arc<Mutex<Option<tokio::time::Instant>>> = Arc::new(Mutex::new(None));
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let failed_since = Arc::clone(&failed_since);
            let connection_id = connection_id.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Failed => {
                        let mut since = failed_since.lock().await;
                        if since.is_none() {
                            *since = Some(tokio::time::Instant::now());
                            warn!(%connection_id, "browser peer connection failed; will recover via ICE restart or be reaped after grace period");
                        }
                    }
                    RTCPeerConnectionState::Connected => {
                        *failed_since.lock().await = None;
                    }
                    _ => {
                        info!(%connection_id, ?state, "browser peer connection state changed");
                    }
                }
            })
        }));
    }

    fn wire_inbound_audio(
        &self,
        peer_connection: &Arc<RTCPeerConnection>,
        on_browser_audio: Arc<dyn Fn(Vec<i16>) + Send + Sync>,
        on_audio_event: AudioEventCallback,
        max_consecutive_decode_errors: u32,
    ) {
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let on_browser_audio = Arc::clone(&on_browser_audio);
            let on_audio_event = Arc::clone(&on_audio_event);
            Box::pin(async move {
                let mut pipeline = match FramePipeline::new(max_consecutive_decode_errors) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("failed to build browser-in decode pipeline: {e}");
                        return;
                    }
                };
                loop {
                    match track.read_rtp().await {
                        Ok((packet, _attrs)) => {
                            match pipeline.decode(Direction::BrowserIn, &packet.payload) {
                                DecodeOutcome::Frame(frame) => on_browser_audio(frame.samples),
                                DecodeOutcome::Dropped => {}
                                DecodeOutcome::Degraded => {
                                    warn!("browser audio decode degraded (consecutive error threshold reached)");
                                    on_audio_event(
                                        "audio.decode_degraded".to_string(),
                                        serde_json::json!({ "direction": Direction::BrowserIn.as_str() }),
                                    );
                                }
                            }
                        }
                        Err(_) => break,
                    }
                }
            })
        }));
    }

    /// `broadcast_audio` per §4.3: push to every connection's bounded
    /// queue; on overflow, drop the oldest frame rather than block.
    pub async fn broadcast_audio(&self, samples: Vec<i16>) {
        let connections: Vec<Arc<BrowserConnection>> =
            self.connections.read().await.values().cloned().collect();
        for conn in connections {
            if conn.outbound_queue.push(samples.clone()).await {
                conn.dropped_frames.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub async fn remove_connection(&self, connection_id: &str) -> anyhow::Result<()> {
        if let Some(conn) = self.connections.write().await.remove(connection_id) {
            conn.outbound_queue.close();
            conn.peer_connection
                .close()
                .await
                .context("failed to close browser peer connection")?;
        }
        Ok(())
    }

    pub async fn close_all(&self) -> anyhow::Result<()> {
        let ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for id in ids {
            self.remove_connection(&id).await?;
        }
        Ok(())
    }
}

async fn wait_for_ice_gathering_complete(peer_connection: &Arc<RTCPeerConnection>) {
    use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
    if peer_connection.ice_gathering_state() == RTCIceGathererState::Complete {
        return;
    }
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    peer_connection.on_ice_gathering_state_change(Box::new(move |state| {
        let tx = Arc::clone(&tx);
        Box::pin(async move {
            if state == RTCIceGathererState::Complete
                && let Some(tx) = tx.lock().await.take()
            {
                let _ = tx.send(());
            }
        })
    }));
    // Bounded: proceed with whatever candidates were gathered (§5).
    let _ = tokio::time::timeout(Duration::from_secs(5), rx).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn browser_count_starts_at_zero() {
        let manager = BrowserManager::new(50, 32_000, 16);
        assert_eq!(manager.browser_count().await, 0);
    }

    #[tokio::test]
    async fn remove_unknown_connection_is_a_no_op() {
        let manager = BrowserManager::new(50, 32_000, 16);
        manager.remove_connection("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn outbound_queue_drops_oldest_frame_on_overflow() {
        let queue = OutboundQueue::new(2);
        assert!(!queue.push(vec![1]).await);
        assert!(!queue.push(vec![2]).await);
        // Queue is full; pushing a third frame must evict the oldest (`[1]`),
        // not the one just pushed.
        assert!(queue.push(vec![3]).await);

        let batch = queue.recv_batch().await.unwrap();
        assert_eq!(batch, vec![vec![2], vec![3]]);
    }

    #[tokio::test]
    async fn outbound_queue_recv_batch_ends_after_close() {
        let queue = OutboundQueue::new(4);
        queue.close();
        assert!(queue.recv_batch().await.is_none());
    }
}
