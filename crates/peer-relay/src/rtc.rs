//! [`PeerConnection`] backed by the `webrtc` crate.
//!
//! Each peer gets one negotiated, ordered data channel (id 0), so both sides
//! open it without an in-band announcement.

use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::peer::{PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventSink, SdpKind};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_CHANNEL_LABEL: &str = "httpl";
/// Session bandwidth advertised in outgoing descriptions, in kbps.
pub const DEFAULT_BANDWIDTH_KBPS: u32 = 102_400;
const NEGOTIATED_CHANNEL_ID: u16 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcPeerConfig {
    pub ice_servers: Vec<String>,
    pub channel_label: String,
    /// Replaces the first `b=AS:` value of each local description (`None` leaves SDP untouched).
    pub bandwidth_kbps: Option<u32>,
}

impl Default for WebRtcPeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            bandwidth_kbps: Some(DEFAULT_BANDWIDTH_KBPS),
        }
    }
}

impl WebRtcPeerConfig {
    /// Reads `PEER_RELAY_ICE_SERVERS` (comma separated) and `PEER_RELAY_LOCALHOST_ONLY`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(servers) = env::var("PEER_RELAY_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|server| !server.is_empty())
                .map(str::to_string)
                .collect();
        }
        if env::var("PEER_RELAY_LOCALHOST_ONLY").is_ok() {
            config.ice_servers.clear();
        }
        config
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

pub struct WebRtcPeerFactory {
    config: WebRtcPeerConfig,
    api: API,
}

impl WebRtcPeerFactory {
    pub fn new(config: WebRtcPeerConfig) -> Result<Self, PeerError> {
        Ok(Self {
            config,
            api: build_api()?,
        })
    }
}

fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;
    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.rtc_configuration())
                .await
                .map_err(to_setup_error)?,
        );

        let candidate_sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!(target = "webrtc", domain = %sink.domain(), "candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(PeerEvent::LocalCandidate(init.candidate));
                    }
                    Err(err) => {
                        warn!(target = "webrtc", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let state_sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let sink = state_sink.clone();
            Box::pin(async move {
                debug!(target = "webrtc", domain = %sink.domain(), ?state, "peer connection state changed");
                if state == RTCPeerConnectionState::Failed {
                    sink.emit(PeerEvent::ChannelClose);
                }
            })
        }));

        let init = RTCDataChannelInit {
            ordered: Some(true),
            negotiated: Some(NEGOTIATED_CHANNEL_ID),
            ..Default::default()
        };
        let dc = pc
            .create_data_channel(&self.config.channel_label, Some(init))
            .await
            .map_err(to_setup_error)?;
        register_channel_handlers(&dc, &events);

        debug!(target = "webrtc", domain = %events.domain(), "peer connection created");
        Ok(Arc::new(WebRtcPeer {
            pc,
            dc,
            bandwidth_kbps: self.config.bandwidth_kbps,
            draft: Mutex::new(None),
        }))
    }
}

fn register_channel_handlers(dc: &Arc<RTCDataChannel>, events: &PeerEventSink) {
    let sink = events.clone();
    dc.on_open(Box::new(move || {
        let sink = sink.clone();
        Box::pin(async move {
            debug!(target = "webrtc", domain = %sink.domain(), "data channel opened");
            sink.emit(PeerEvent::ChannelOpen);
        })
    }));

    let sink = events.clone();
    dc.on_close(Box::new(move || {
        let sink = sink.clone();
        Box::pin(async move {
            trace!(target = "webrtc", domain = %sink.domain(), "data channel closed");
            sink.emit(PeerEvent::ChannelClose);
        })
    }));

    let sink = events.clone();
    dc.on_error(Box::new(move |err| {
        let sink = sink.clone();
        Box::pin(async move {
            warn!(target = "webrtc", domain = %sink.domain(), error = %err, "data channel error");
            sink.emit(PeerEvent::ChannelError(err.to_string()));
        })
    }));

    let sink = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = sink.clone();
        Box::pin(async move {
            trace!(target = "webrtc", domain = %sink.domain(), frame_len = msg.data.len(), "received frame");
            sink.emit(PeerEvent::ChannelMessage(msg.data));
        })
    }));
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
    bandwidth_kbps: Option<u32>,
    /// Last generated description: the text handed out and the untouched original.
    draft: Mutex<Option<(String, RTCSessionDescription)>>,
}

impl WebRtcPeer {
    fn stage(&self, generated: RTCSessionDescription) -> String {
        let sdp = match self.bandwidth_kbps {
            Some(kbps) => raise_bandwidth(&generated.sdp, kbps),
            None => generated.sdp.clone(),
        };
        *self.draft.lock() = Some((sdp.clone(), generated));
        sdp
    }

    fn describe(kind: SdpKind, sdp: &str) -> Result<RTCSessionDescription, PeerError> {
        let desc = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        };
        desc.map_err(|err| PeerError::Description(err.to_string()))
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(to_description_error)?;
        Ok(self.stage(offer))
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(to_description_error)?;
        Ok(self.stage(answer))
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError> {
        let staged = self.draft.lock().take();
        let desc = match staged {
            Some((handed_out, original)) if handed_out == sdp => original,
            _ => Self::describe(kind, sdp)?,
        };
        self.pc
            .set_local_description(desc)
            .await
            .map_err(to_description_error)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError> {
        let desc = Self::describe(kind, sdp)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(to_description_error)
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        self.draft.lock().take();
        let mut desc = RTCSessionDescription::default();
        desc.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(to_description_error)
    }

    async fn add_candidate(&self, candidate: &str) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| PeerError::Candidate(err.to_string()))
    }

    async fn send(&self, data: Bytes) -> Result<(), PeerError> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|err| PeerError::Channel(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            warn!(target = "webrtc", error = %err, "failed to close peer connection");
        }
    }
}

/// Replaces the value of the first `b=AS:<digits>` attribute (case-insensitive) with `kbps`.
pub fn raise_bandwidth(sdp: &str, kbps: u32) -> String {
    const ATTRIBUTE: &str = "b=as:";
    let lowered = sdp.to_ascii_lowercase();
    let mut from = 0;
    while let Some(offset) = lowered[from..].find(ATTRIBUTE) {
        let value_start = from + offset + ATTRIBUTE.len();
        let digits = sdp[value_start..]
            .bytes()
            .take_while(u8::is_ascii_digit)
            .count();
        if digits > 0 {
            let value_end = value_start + digits;
            return format!("{}{kbps}{}", &sdp[..value_start], &sdp[value_end..]);
        }
        from = value_start;
    }
    sdp.to_string()
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> PeerError {
    PeerError::Setup(err.to_string())
}

fn to_description_error<E: std::fmt::Display>(err: E) -> PeerError {
    PeerError::Description(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex as StdMutex};

    static ENV_MUTEX: LazyLock<StdMutex<()>> = LazyLock::new(|| StdMutex::new(()));

    #[test]
    fn raise_bandwidth_rewrites_first_attribute_only() {
        let sdp = "v=0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\nb=AS:30\r\nb=AS:50\r\n";
        assert_eq!(
            raise_bandwidth(sdp, 102_400),
            "v=0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\nb=AS:102400\r\nb=AS:50\r\n"
        );
    }

    #[test]
    fn raise_bandwidth_is_case_insensitive_and_needs_digits() {
        assert_eq!(raise_bandwidth("B=as:\r\nb=As:7\r\n", 9), "B=as:\r\nb=As:9\r\n");
        assert_eq!(raise_bandwidth("v=0\r\n", 9), "v=0\r\n");
    }

    #[test]
    fn from_env_reads_ice_servers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("PEER_RELAY_ICE_SERVERS", "stun:a.example:3478, ,turn:b.example");
            env::remove_var("PEER_RELAY_LOCALHOST_ONLY");
        }
        let config = WebRtcPeerConfig::from_env();
        unsafe { env::remove_var("PEER_RELAY_ICE_SERVERS") };
        assert_eq!(
            config.ice_servers,
            vec!["stun:a.example:3478".to_string(), "turn:b.example".to_string()]
        );
        assert_eq!(config.channel_label, DEFAULT_CHANNEL_LABEL);
    }

    #[test]
    fn localhost_only_disables_ice_servers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { env::set_var("PEER_RELAY_LOCALHOST_ONLY", "1") };
        let config = WebRtcPeerConfig::from_env();
        unsafe { env::remove_var("PEER_RELAY_LOCALHOST_ONLY") };
        assert!(config.ice_servers.is_empty());
        assert!(config.rtc_configuration().ice_servers.is_empty());
    }
}
