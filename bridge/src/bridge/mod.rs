//! Per-dispatcher bridge between one WebRTC media session and the registry.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info};
use mumble::UpstreamHandle;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use codec::{CodecAdapter, OpusPassthrough};
pub use peer::{MediaError, MediaPeer, PeerEvent, PeerEvents, PeerFactory, WebRtcFactory};

use crate::queue::FrameQueue;
use crate::registry::{Frame, JoinOutcome, ParticipantId, Registry};

pub mod codec;
pub mod peer;

#[cfg(test)]
pub(crate) mod fake;

pub struct DispatcherBridge {
    id: ParticipantId,
    name: String,
    registry: Registry,
    upstream: UpstreamHandle,
    codec: Arc<dyn CodecAdapter>,
    queue: Arc<FrameQueue>,
    peer: Option<(Uuid, Arc<dyn MediaPeer>)>,
    playback: Option<JoinHandle<()>>,
    transmitting: bool,
    frame_number: u64,
    closed: bool,
}

impl DispatcherBridge {
    pub fn new(
        dispatcher: &str,
        name: &str,
        registry: Registry,
        upstream: UpstreamHandle,
        codec: Arc<dyn CodecAdapter>,
        queue_frames: usize,
    ) -> Self {
        DispatcherBridge {
            id: ParticipantId::Dispatcher(dispatcher.to_string()),
            name: name.to_string(),
            registry,
            upstream,
            codec,
            queue: Arc::new(FrameQueue::new(queue_frames)),
            peer: None,
            playback: None,
            transmitting: false,
            frame_number: 0,
            closed: false,
        }
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn channel(&self) -> Option<u32> {
        self.registry.channel_of(&self.id)
    }

    pub fn peer(&self) -> Option<Arc<dyn MediaPeer>> {
        self.peer.as_ref().map(|(_, peer)| peer.clone())
    }

    /// Id of the attached media session, as carried by its [`PeerEvents`].
    pub fn peer_id(&self) -> Option<Uuid> {
        self.peer.as_ref().map(|(id, _)| *id)
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting
    }

    /// Binds a media session and starts playing the channel's audio into
    /// it. A previously attached session is closed.
    pub fn attach(&mut self, id: Uuid, peer: Arc<dyn MediaPeer>) {
        if self.closed {
            release(peer);
            return;
        }

        self.detach();

        let queue = self.queue.clone();
        let codec = self.codec.clone();
        let target = peer.clone();

        self.playback = Some(tokio::spawn(async move {
            while let Some(frame) = queue.next().await {
                let (data, duration) = match codec.to_browser(frame.payload) {
                    Some(v) => v,
                    None => continue,
                };

                if let Err(e) = target.play(data, duration).await {
                    debug!("Failed to play frame: {}", e);
                }
            }
        }));
        self.peer = Some((id, peer));
    }

    /// Drops the media session, keeping the channel membership.
    pub fn detach(&mut self) {
        self.set_transmitting(false);

        if let Some(task) = self.playback.take() {
            task.abort();
        }

        if let Some((_, peer)) = self.peer.take() {
            release(peer);
        }
    }

    pub fn join(&mut self, channel: u32) -> JoinOutcome {
        if self.closed {
            return JoinOutcome::default();
        }

        if let Some(previous) = self.channel().filter(|&c| c != channel) {
            self.end_transmission(previous);
        }

        let outcome = self
            .registry
            .join(self.id.clone(), &self.name, channel, Some(self.queue.clone()));

        if outcome.already_member {
            return outcome;
        }

        info!("{} joined channel {}", self.id, channel);

        if let Some(vacated) = outcome.vacated {
            self.upstream.unlisten(vacated);
        }

        if outcome.opened {
            self.upstream.listen(channel);
        }

        outcome
    }

    /// Returns the channel that was left.
    pub fn leave(&mut self) -> Option<u32> {
        if let Some(channel) = self.channel() {
            self.end_transmission(channel);
        }

        let outcome = self.registry.leave(&self.id)?;
        info!("{} left channel {}", self.id, outcome.channel);

        if outcome.vacated {
            self.upstream.unlisten(outcome.channel);
        }

        Some(outcome.channel)
    }

    /// Push-to-talk gate. Releasing it ends the current transmission with a
    /// terminator frame.
    pub fn set_transmitting(&mut self, on: bool) {
        if self.transmitting == on {
            return;
        }

        debug!("{} push-to-talk {}", self.id, if on { "on" } else { "off" });

        if !on {
            if let Some(channel) = self.channel() {
                self.end_transmission(channel);
            }
        }

        self.transmitting = on;
    }

    /// A frame captured by the browser. Discarded unless push-to-talk is
    /// active and the dispatcher is in a channel.
    pub fn on_local_audio(&mut self, frame: Bytes) -> bool {
        if !self.transmitting {
            return false;
        }

        let channel = match self.channel() {
            Some(c) => c,
            None => return false,
        };

        let payload = match self.codec.to_upstream(frame) {
            Some(p) => p,
            None => return false,
        };

        self.upstream.send_audio(channel, payload.clone(), false);
        self.route(channel, payload, false);
        true
    }

    /// Queues a frame for playback.
    pub fn on_upstream_frame(&self, frame: Frame) {
        if !self.queue.push(frame) {
            debug!("Playback queue of {} full, dropped oldest frame", self.id);
        }
    }

    /// Leaves the channel and releases the media session. Once this returns
    /// no routed frame can reach this bridge.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }

        self.leave();
        self.queue.close();
        self.detach();
        self.closed = true;

        debug!("{} closed", self.id);
    }

    fn end_transmission(&mut self, channel: u32) {
        if !self.transmitting {
            return;
        }

        self.upstream.send_audio(channel, Bytes::new(), true);
        self.route(channel, Bytes::new(), true);
    }

    fn route(&mut self, channel: u32, payload: Bytes, terminator: bool) {
        let frame = Frame {
            sender: self.id.clone(),
            channel,
            frame_number: self.frame_number,
            payload,
            terminator,
        };
        self.frame_number += 1;

        self.registry.route_audio(frame);
    }
}

impl Drop for DispatcherBridge {
    fn drop(&mut self) {
        self.close();
    }
}

fn release(peer: Arc<dyn MediaPeer>) {
    match Handle::try_current() {
        Ok(rt) => {
            rt.spawn(async move {
                if let Err(e) = peer.close().await {
                    debug!("Failed to close media session: {}", e);
                }
            });
        }
        Err(_) => debug!("No runtime left to close media session on"),
    }
}
