use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry as InterceptorRegistry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::signaling::message::IceCandidate;

/// Label of the data channel the browser sends push-to-talk state on.
pub const PTT_CHANNEL: &str = "ptt";

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("media session already closed")]
    Closed,
    #[error("no media session, send an offer first")]
    NoPeer,
    #[error("invalid offer: {0}")]
    InvalidOffer(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local ICE candidate to trickle to the browser.
    LocalCandidate(IceCandidate),
    /// One Opus frame captured by the browser.
    Audio(Bytes),
    Transmit(bool),
    /// The connection failed or was closed by the browser.
    Closed,
}

/// Event sender handed to one media session. Every event carries the
/// session's id, so events from a replaced session can be ignored.
#[derive(Debug, Clone)]
pub struct PeerEvents {
    peer: Uuid,
    tx: mpsc::UnboundedSender<(Uuid, PeerEvent)>,
}

impl PeerEvents {
    pub fn new(tx: mpsc::UnboundedSender<(Uuid, PeerEvent)>) -> Self {
        PeerEvents {
            peer: Uuid::new_v4(),
            tx,
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer
    }

    pub fn send(&self, ev: PeerEvent) -> Result<(), mpsc::error::SendError<PeerEvent>> {
        self.tx
            .send((self.peer, ev))
            .map_err(|e| mpsc::error::SendError((e.0).1))
    }
}

/// One dispatcher's media session.
#[async_trait]
pub trait MediaPeer: Send + Sync {
    /// Applies the browser's offer and returns our answer SDP.
    async fn accept_offer(&self, sdp: String) -> Result<String, MediaError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Sends one frame to the browser for playback.
    async fn play(&self, frame: Bytes, duration: Duration) -> Result<(), MediaError>;

    async fn close(&self) -> Result<(), MediaError>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        events: PeerEvents,
    ) -> Result<Arc<dyn MediaPeer>, MediaError>;
}

pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = InterceptorRegistry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(WebRtcFactory { api, ice_servers })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for WebRtcFactory {
    async fn create(
        &self,
        events: PeerEvents,
    ) -> Result<Arc<dyn MediaPeer>, MediaError> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config()).await?);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            "voice-bridge".to_owned(),
        ));

        let rtp_sender = pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Incoming RTCP has to be read for the interceptors to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let init = match candidate.map(|c| c.to_json()) {
                    Some(Ok(init)) => init,
                    Some(Err(e)) => {
                        warn!("Failed to serialize local ICE candidate: {}", e);
                        return;
                    }
                    None => return,
                };

                let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate::from(init)));
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("Peer connection state: {}", state);

            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                let _ = tx.send(PeerEvent::Closed);
            }

            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                let mime_type = track.codec().capability.mime_type;

                Box::pin(async move {
                    if !mime_type.eq_ignore_ascii_case(MIME_TYPE_OPUS) {
                        warn!("Ignoring remote {} track", mime_type);
                        return;
                    }

                    info!("Receiving dispatcher audio");
                    tokio::spawn(read_track(track, tx));
                })
            },
        ));

        let tx = events;
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                if dc.label() != PTT_CHANNEL {
                    debug!("Ignoring data channel '{}'", dc.label());
                    return;
                }

                dc.on_message(Box::new(move |msg: DataChannelMessage| {
                    match parse_ptt(&msg.data) {
                        Some(on) => {
                            let _ = tx.send(PeerEvent::Transmit(on));
                        }
                        None => debug!("Invalid push-to-talk message"),
                    }
                    Box::pin(async {})
                }));
            })
        }));

        Ok(Arc::new(WebRtcPeer { pc, track }))
    }
}

async fn read_track(track: Arc<TrackRemote>, tx: PeerEvents) {
    while let Ok((packet, _)) = track.read_rtp().await {
        if packet.payload.is_empty() {
            continue;
        }

        if tx.send(PeerEvent::Audio(packet.payload)).is_err() {
            break;
        }
    }

    debug!("Remote track ended");
}

#[derive(Deserialize)]
struct PttMessage {
    transmit: bool,
}

/// Accepts `on`/`off` or `{"transmit": true}`.
fn parse_ptt(data: &[u8]) -> Option<bool> {
    let text = std::str::from_utf8(data).ok()?.trim();

    match text {
        "on" => Some(true),
        "off" => Some(false),
        _ => serde_json::from_str::<PttMessage>(text)
            .ok()
            .map(|m| m.transmit),
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
}

#[async_trait]
impl MediaPeer for WebRtcPeer {
    async fn accept_offer(&self, sdp: String) -> Result<String, MediaError> {
        if sdp.trim().is_empty() {
            return Err(MediaError::InvalidOffer("empty SDP".to_string()));
        }

        let offer = RTCSessionDescription::offer(sdp)?;
        self.pc.set_remote_description(offer).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;

        Ok(answer.sdp)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit::from(candidate))
            .await?;
        Ok(())
    }

    async fn play(&self, frame: Bytes, duration: Duration) -> Result<(), MediaError> {
        let sample = Sample {
            data: frame,
            duration,
            ..Default::default()
        };

        self.track.write_sample(&sample).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.pc.close().await?;
        Ok(())
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}
