//! WebSocket signaling endpoint, one connection per dispatcher.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use mumble::UpstreamHandle;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use url::form_urlencoded;
use uuid::Uuid;

use crate::bridge::{CodecAdapter, DispatcherBridge, MediaError, PeerEvent, PeerEvents, PeerFactory};
use crate::registry::{ChannelInfo, JoinOutcome, ParticipantInfo, Registry};

use self::message::{ClientMessage, ServerMessage, Signal};

pub mod message;

const ENDPOINT: &str = "/voice-bridge";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown dispatcher '{0}'")]
    UnknownDispatcher(String),
    #[error("invalid message: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Playback queue bound per dispatcher, in frames.
    pub queue_frames: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig { queue_frames: 50 }
    }
}

#[derive(Clone)]
pub struct Gateway {
    shared: Arc<Shared>,
}

struct Shared {
    registry: Registry,
    upstream: UpstreamHandle,
    factory: Arc<dyn PeerFactory>,
    codec: Arc<dyn CodecAdapter>,
    config: GatewayConfig,
    dispatchers: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    conn_id: Uuid,
    bridge: Arc<Mutex<DispatcherBridge>>,
    kick: Arc<Notify>,
}

struct Identity {
    dispatcher: String,
    name: String,
}

type Outbox = mpsc::UnboundedSender<ServerMessage>;

impl Gateway {
    pub fn new(
        registry: Registry,
        upstream: UpstreamHandle,
        factory: Arc<dyn PeerFactory>,
        codec: Arc<dyn CodecAdapter>,
        config: GatewayConfig,
    ) -> Self {
        Gateway {
            shared: Arc::new(Shared {
                registry,
                upstream,
                factory,
                codec,
                config,
                dispatchers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), GatewayError> {
        info!("Signaling on ws://{}{}", listener.local_addr()?, ENDPOINT);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("Failed to accept signaling connection: {}", e);
                    continue;
                }
            };

            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_connection(stream).await {
                    warn!("Signaling connection from {} failed: {}", addr, e);
                }
            });
        }
    }

    /// Runs one dispatcher's signaling connection to completion. Whichever
    /// way it ends, the dispatcher's bridge is closed before this returns.
    pub async fn handle_connection<S>(&self, stream: S) -> Result<(), GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut identity = None;

        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            identity = Some(identify(req)?);
            Ok(resp)
        })
        .await?;

        let Identity { dispatcher, name } = match identity {
            Some(v) => v,
            None => return Ok(()),
        };

        info!("Dispatcher {} ({}) connected", dispatcher, name);

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let send_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode signaling message: {}", e);
                        continue;
                    }
                };

                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }

            let _ = ws_tx.close().await;
        });

        let conn_id = Uuid::new_v4();
        let kick = Arc::new(Notify::new());
        let bridge = Arc::new(Mutex::new(DispatcherBridge::new(
            &dispatcher,
            &name,
            self.shared.registry.clone(),
            self.shared.upstream.clone(),
            self.shared.codec.clone(),
            self.shared.config.queue_frames,
        )));

        self.register(&dispatcher, conn_id, bridge.clone(), kick.clone());

        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel::<(Uuid, PeerEvent)>();

        let result = loop {
            select! {
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.on_message(&text, &bridge, &peer_tx, &out_tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                },
                Some((peer, ev)) = peer_rx.recv() => on_peer_event(peer, ev, &bridge, &out_tx),
                _ = kick.notified() => {
                    let _ = out_tx.send(ServerMessage::error("replaced by a newer connection"));
                    break Ok(());
                }
            }
        };

        {
            let mut dispatchers = self.shared.dispatchers.lock();
            if dispatchers.get(&dispatcher).map(|e| e.conn_id) == Some(conn_id) {
                dispatchers.remove(&dispatcher);
            }
        }
        bridge.lock().close();

        drop(out_tx);
        let _ = send_task.await;

        info!("Dispatcher {} disconnected", dispatcher);
        result
    }

    /// Moves a connected dispatcher into a channel, as if it had sent
    /// `join-channel` itself.
    pub fn join_channel(&self, dispatcher: &str, channel: u32) -> Result<JoinOutcome, GatewayError> {
        Ok(self.bridge(dispatcher)?.lock().join(channel))
    }

    pub fn leave_channel(&self, dispatcher: &str) -> Result<Option<u32>, GatewayError> {
        Ok(self.bridge(dispatcher)?.lock().leave())
    }

    pub fn list_participants(&self, channel: u32) -> Option<Vec<ParticipantInfo>> {
        self.shared.registry.list_participants(channel)
    }

    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        self.shared.registry.list_channels()
    }

    fn bridge(&self, dispatcher: &str) -> Result<Arc<Mutex<DispatcherBridge>>, GatewayError> {
        self.shared
            .dispatchers
            .lock()
            .get(dispatcher)
            .map(|e| e.bridge.clone())
            .ok_or_else(|| GatewayError::UnknownDispatcher(dispatcher.to_string()))
    }

    /// Replaces any live connection of the same dispatcher. The old bridge
    /// is closed before the new one can join anything.
    fn register(
        &self,
        dispatcher: &str,
        conn_id: Uuid,
        bridge: Arc<Mutex<DispatcherBridge>>,
        kick: Arc<Notify>,
    ) {
        let old = self.shared.dispatchers.lock().insert(
            dispatcher.to_string(),
            Entry {
                conn_id,
                bridge,
                kick,
            },
        );

        if let Some(old) = old {
            info!("Dispatcher {} connected again, closing previous connection", dispatcher);
            old.bridge.lock().close();
            old.kick.notify_one();
        }
    }

    async fn on_message(
        &self,
        text: &str,
        bridge: &Arc<Mutex<DispatcherBridge>>,
        peer_tx: &mpsc::UnboundedSender<(Uuid, PeerEvent)>,
        out: &Outbox,
    ) {
        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Bad signaling message: {}", e);
                let _ = out.send(ServerMessage::error(GatewayError::from(e)));
                return;
            }
        };

        match msg {
            ClientMessage::JoinChannel { channel_id } => {
                bridge.lock().join(channel_id);
            }
            ClientMessage::LeaveChannel => {
                bridge.lock().leave();
            }
            ClientMessage::WebrtcOffer { sdp } => match self.answer(sdp, bridge, peer_tx).await {
                Ok(sdp) => {
                    let _ = out.send(ServerMessage::WebrtcSignal {
                        signal: Signal::Answer { sdp },
                    });
                }
                Err(e) => {
                    warn!("WebRTC negotiation failed: {}", e);
                    let _ = out.send(ServerMessage::error(e));
                }
            },
            ClientMessage::WebrtcSignal { candidate } => {
                let peer = bridge.lock().peer();
                let result = match peer {
                    Some(peer) => peer.add_ice_candidate(candidate).await,
                    None => Err(MediaError::NoPeer),
                };

                if let Err(e) = result {
                    let _ = out.send(ServerMessage::error(e));
                }
            }
            ClientMessage::Ping => {
                let _ = out.send(ServerMessage::Pong);
            }
        }
    }

    /// Creates the media session on the first offer, reuses it for
    /// renegotiation.
    async fn answer(
        &self,
        sdp: String,
        bridge: &Arc<Mutex<DispatcherBridge>>,
        peer_tx: &mpsc::UnboundedSender<(Uuid, PeerEvent)>,
    ) -> Result<String, MediaError> {
        let existing = bridge.lock().peer();

        let peer = match existing {
            Some(peer) => peer,
            None => {
                let events = PeerEvents::new(peer_tx.clone());
                let id = events.peer_id();
                let peer = self.shared.factory.create(events).await?;
                bridge.lock().attach(id, peer.clone());
                peer
            }
        };

        peer.accept_offer(sdp).await
    }
}

fn on_peer_event(peer: Uuid, ev: PeerEvent, bridge: &Arc<Mutex<DispatcherBridge>>, out: &Outbox) {
    if bridge.lock().peer_id() != Some(peer) {
        debug!("Dropping event of a detached media session: {:?}", ev);
        return;
    }

    match ev {
        PeerEvent::LocalCandidate(candidate) => {
            let _ = out.send(ServerMessage::WebrtcSignal {
                signal: Signal::Candidate { candidate },
            });
        }
        PeerEvent::Audio(frame) => {
            bridge.lock().on_local_audio(frame);
        }
        PeerEvent::Transmit(on) => bridge.lock().set_transmitting(on),
        PeerEvent::Closed => {
            bridge.lock().detach();
            let _ = out.send(ServerMessage::error(MediaError::Closed));
        }
    }
}

fn identify(req: &Request) -> Result<Identity, ErrorResponse> {
    if req.uri().path() != ENDPOINT {
        return Err(reject(StatusCode::NOT_FOUND, "unknown endpoint"));
    }

    let mut dispatcher = None;
    let mut name = None;

    let query = req.uri().query().unwrap_or("");
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match &*key {
            "dispatcher" => dispatcher = Some(value.into_owned()),
            "name" => name = Some(value.into_owned()),
            _ => {}
        }
    }

    let dispatcher = dispatcher
        .filter(|d| !d.is_empty())
        .ok_or_else(|| reject(StatusCode::BAD_REQUEST, "missing dispatcher id"))?;
    let name = name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| dispatcher.clone());

    Ok(Identity { dispatcher, name })
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = status;
    resp
}
