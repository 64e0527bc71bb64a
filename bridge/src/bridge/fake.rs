use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::bridge::peer::{MediaError, MediaPeer, PeerEvents, PeerFactory};
use crate::signaling::message::IceCandidate;

/// Media session that records what it was asked to do.
#[derive(Default)]
pub struct FakePeer {
    played: Mutex<Vec<(Bytes, Duration)>>,
    candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
}

impl FakePeer {
    pub fn played(&self) -> Vec<(Bytes, Duration)> {
        self.played.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn wait_played(&self, n: usize) {
        wait_for(|| self.played.lock().len() >= n).await;
    }

    pub async fn wait_closed(&self) {
        wait_for(|| self.is_closed()).await;
    }
}

pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}

#[async_trait]
impl MediaPeer for FakePeer {
    async fn accept_offer(&self, sdp: String) -> Result<String, MediaError> {
        if self.is_closed() {
            return Err(MediaError::Closed);
        }
        if sdp.is_empty() {
            return Err(MediaError::InvalidOffer("empty SDP".to_string()));
        }

        Ok(format!("answer to {}", sdp))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn play(&self, frame: Bytes, duration: Duration) -> Result<(), MediaError> {
        self.played.lock().push((frame, duration));
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`FakePeer`]s and keeps their event senders so tests can act
/// as the browser.
#[derive(Default)]
pub struct FakeFactory {
    pub peers: Mutex<Vec<(Arc<FakePeer>, PeerEvents)>>,
}

impl FakeFactory {
    pub fn peer(&self, i: usize) -> (Arc<FakePeer>, PeerEvents) {
        self.peers.lock()[i].clone()
    }

    pub async fn wait_peers(&self, n: usize) {
        wait_for(|| self.peers.lock().len() >= n).await;
    }
}

#[async_trait]
impl PeerFactory for FakeFactory {
    async fn create(
        &self,
        events: PeerEvents,
    ) -> Result<Arc<dyn MediaPeer>, MediaError> {
        let peer = Arc::new(FakePeer::default());
        self.peers.lock().push((peer.clone(), events));
        Ok(peer)
    }
}
