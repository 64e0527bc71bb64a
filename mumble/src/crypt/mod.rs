//! CryptSetup bookkeeping.
//!
//! The server drives nonce negotiation with three shapes of `CryptSetup`:
//! a full re-key (key + both nonces), a bare server nonce (resync response),
//! and an empty message (asking for our client nonce). Whatever the shape, an
//! acknowledgement never carries an all-zero client nonce once a real one has
//! been seen; the server treats a zero nonce as an unauthenticated client and
//! eventually drops the connection.

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use crate::proto::msgs;

pub use ocb2::{DecryptError, PacketStats};

use ocb2::{Ocb2, BLOCK_SIZE, KEY_SIZE};

mod ocb2;

pub type Nonce = [u8; BLOCK_SIZE];

const ZERO_NONCE: Nonce = [0; BLOCK_SIZE];
const RESYNC_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error, Eq, PartialEq)]
pub enum CryptError {
    #[error("no UDP transport established")]
    NoTransport,
    #[error(transparent)]
    Decrypt(#[from] DecryptError),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SetupKind {
    FullRekey,
    ServerNonce,
    ResyncRequest,
}

pub struct CryptState {
    udp: bool,
    key: Option<[u8; KEY_SIZE]>,
    client_nonce: Option<Nonce>,
    server_nonce: Option<Nonce>,
    transport: Option<Ocb2>,
    transport_since: Option<Instant>,
    last_request: Option<Instant>,
    resyncs: u32,
    desyncs: u32,
}

impl CryptState {
    /// `udp` selects whether full re-keys set up an OCB2 transport for real
    /// UDP datagrams. In TCP-only mode only the nonces are tracked.
    pub fn new(udp: bool) -> Self {
        CryptState {
            udp,
            key: None,
            client_nonce: None,
            server_nonce: None,
            transport: None,
            transport_since: None,
            last_request: None,
            resyncs: 0,
            desyncs: 0,
        }
    }

    pub fn client_nonce(&self) -> Option<Nonce> {
        self.client_nonce
    }

    pub fn server_nonce(&self) -> Option<Nonce> {
        self.server_nonce
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Number of resync requests answered.
    pub fn resyncs(&self) -> u32 {
        self.resyncs
    }

    /// Number of acknowledgements that had to fall back to a zero nonce.
    pub fn desyncs(&self) -> u32 {
        self.desyncs
    }

    pub fn stats(&self) -> PacketStats {
        self.transport.as_ref().map(|t| t.stats()).unwrap_or_default()
    }

    /// Drops the UDP transport of a dead connection. The cached nonces stay.
    pub fn reset_transport(&mut self) {
        self.transport = None;
        self.transport_since = None;
        self.last_request = None;
    }

    pub fn classify(msg: &msgs::CryptSetup) -> SetupKind {
        let client = sized::<BLOCK_SIZE>(msg.client_nonce.as_deref(), "client nonce");
        let server = sized::<BLOCK_SIZE>(msg.server_nonce.as_deref(), "server nonce");

        match (client, server) {
            (Some(_), Some(_)) => SetupKind::FullRekey,
            (None, Some(_)) => SetupKind::ServerNonce,
            _ => SetupKind::ResyncRequest,
        }
    }

    /// Processes a `CryptSetup` from the server and returns the
    /// acknowledgement to send back, if any.
    pub fn handle_setup(&mut self, msg: &msgs::CryptSetup, now: Instant) -> Option<msgs::CryptSetup> {
        let key = sized::<KEY_SIZE>(msg.key.as_deref(), "key");
        let client = sized::<BLOCK_SIZE>(msg.client_nonce.as_deref(), "client nonce");
        let server = sized::<BLOCK_SIZE>(msg.server_nonce.as_deref(), "server nonce");

        match (client, server) {
            (Some(client), Some(server)) => Some(self.full_rekey(key, client, server, now)),
            (None, Some(server)) => self.server_nonce_only(server),
            (Some(_), None) => {
                warn!("CryptSetup with a client nonce but no server nonce, treating as resync request");
                Some(self.resync_request())
            }
            (None, None) => Some(self.resync_request()),
        }
    }

    fn full_rekey(
        &mut self,
        key: Option<[u8; KEY_SIZE]>,
        client: Nonce,
        server: Nonce,
        now: Instant,
    ) -> msgs::CryptSetup {
        debug!("CryptSetup: full re-key");

        if key.is_some() {
            self.key = key;
        }

        self.remember_client_nonce(client);
        self.server_nonce = Some(server);

        if self.udp {
            // a zeroed client nonce never reaches the transport once one is known
            let encrypt_iv = self.client_nonce.unwrap_or(client);

            match self.key {
                Some(key) => {
                    self.transport = Some(Ocb2::new(key, encrypt_iv, server));
                    self.transport_since = Some(now);
                }
                None => warn!("CryptSetup re-key without a key, UDP transport not set up"),
            }
        }

        self.ack(client)
    }

    fn server_nonce_only(&mut self, server: Nonce) -> Option<msgs::CryptSetup> {
        self.server_nonce = Some(server);

        match &mut self.transport {
            Some(transport) => {
                debug!("CryptSetup: server nonce resync");
                transport.set_decrypt_iv(server);
                None
            }
            None => {
                debug!("CryptSetup: server nonce without transport, acknowledging cached client nonce");
                Some(self.ack(ZERO_NONCE))
            }
        }
    }

    fn resync_request(&mut self) -> msgs::CryptSetup {
        self.resyncs += 1;

        if let Some(transport) = &self.transport {
            let nonce = transport.encrypt_iv();
            self.remember_client_nonce(nonce);
        }

        debug!("CryptSetup: resync request #{}", self.resyncs);
        self.ack(ZERO_NONCE)
    }

    fn remember_client_nonce(&mut self, nonce: Nonce) {
        if nonce == ZERO_NONCE {
            if self.client_nonce.is_some() {
                warn!("Ignoring all-zero client nonce, keeping the cached one");
            }
            return;
        }

        self.client_nonce = Some(nonce);
    }

    /// Builds an acknowledgement, preferring the live transport IV, then the
    /// cached nonce, then `proposed`, and only then zeros.
    fn ack(&mut self, proposed: Nonce) -> msgs::CryptSetup {
        let nonce = self
            .transport
            .as_ref()
            .map(Ocb2::encrypt_iv)
            .filter(|iv| *iv != ZERO_NONCE)
            .or(self.client_nonce)
            .unwrap_or(proposed);

        if nonce == ZERO_NONCE {
            self.desyncs += 1;
            warn!("No client nonce negotiated yet, acknowledging CryptSetup with a zero nonce");
        } else if self.client_nonce.is_none() {
            info!("First client nonce negotiated");
        }

        msgs::CryptSetup {
            key: None,
            client_nonce: Some(nonce.to_vec()),
            server_nonce: None,
        }
    }

    pub fn encrypt(&mut self, plain: &[u8]) -> Result<Vec<u8>, CryptError> {
        match &mut self.transport {
            Some(t) => Ok(t.encrypt(plain)),
            None => Err(CryptError::NoTransport),
        }
    }

    pub fn decrypt(&mut self, data: &[u8], now: Instant) -> Result<Vec<u8>, CryptError> {
        match &mut self.transport {
            Some(t) => Ok(t.decrypt(data, now)?),
            None => Err(CryptError::NoTransport),
        }
    }

    /// Whether the UDP path has gone bad long enough that we should ask the
    /// server for a fresh server nonce. Rate-limited to one request per
    /// [`RESYNC_INTERVAL`]; a `true` return arms the limiter.
    pub fn should_request_resync(&mut self, now: Instant) -> bool {
        let transport = match &self.transport {
            Some(t) => t,
            None => return false,
        };

        let last_good = transport.last_good().or(self.transport_since);
        let stale = last_good.map_or(true, |t| now.duration_since(t) > RESYNC_INTERVAL);
        let may_ask = self
            .last_request
            .map_or(true, |t| now.duration_since(t) > RESYNC_INTERVAL);

        if stale && may_ask {
            self.last_request = Some(now);
            true
        } else {
            false
        }
    }
}

fn sized<const N: usize>(data: Option<&[u8]>, what: &str) -> Option<[u8; N]> {
    let data = data?;

    match <[u8; N]>::try_from(data) {
        Ok(v) => Some(v),
        Err(_) => {
            if !data.is_empty() {
                warn!("Ignoring CryptSetup {} of invalid size {}", what, data.len());
            }
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rekey(key: u8, client: u8, server: u8) -> msgs::CryptSetup {
        msgs::CryptSetup {
            key: Some(vec![key; KEY_SIZE]),
            client_nonce: Some(vec![client; BLOCK_SIZE]),
            server_nonce: Some(vec![server; BLOCK_SIZE]),
        }
    }

    fn server_only(server: u8) -> msgs::CryptSetup {
        msgs::CryptSetup {
            server_nonce: Some(vec![server; BLOCK_SIZE]),
            ..Default::default()
        }
    }

    fn ack_nonce(ack: &msgs::CryptSetup) -> Vec<u8> {
        assert!(ack.key.is_none());
        assert!(ack.server_nonce.is_none());
        ack.client_nonce.clone().unwrap()
    }

    #[test]
    fn full_rekey_acknowledges_server_supplied_client_nonce() {
        let mut cs = CryptState::new(false);
        let ack = cs.handle_setup(&rekey(1, 0x11, 0x22), Instant::now()).unwrap();

        assert_eq!(ack_nonce(&ack), vec![0x11; 16]);
        assert_eq!(cs.client_nonce(), Some([0x11; 16]));
        assert_eq!(cs.server_nonce(), Some([0x22; 16]));
        assert!(!cs.has_transport());
    }

    #[test]
    fn resync_request_without_any_nonce_falls_back_to_zero() {
        let mut cs = CryptState::new(false);
        let ack = cs.handle_setup(&msgs::CryptSetup::default(), Instant::now()).unwrap();

        assert_eq!(ack_nonce(&ack), vec![0; 16]);
        assert_eq!(cs.desyncs(), 1);
    }

    #[test]
    fn resync_request_uses_cached_nonce() {
        let mut cs = CryptState::new(false);
        let now = Instant::now();
        cs.handle_setup(&rekey(1, 0x33, 0x44), now);

        let ack = cs.handle_setup(&msgs::CryptSetup::default(), now).unwrap();
        assert_eq!(ack_nonce(&ack), vec![0x33; 16]);
        assert_eq!(cs.resyncs(), 1);
        assert_eq!(cs.desyncs(), 0);
    }

    #[test]
    fn tcp_only_server_nonce_acknowledged_with_cached_client_nonce() {
        let mut cs = CryptState::new(false);
        let now = Instant::now();
        let n: Vec<u8> = (1..=16).collect();

        cs.handle_setup(
            &msgs::CryptSetup {
                key: Some(vec![9; 16]),
                client_nonce: Some(n.clone()),
                server_nonce: Some(vec![5; 16]),
            },
            now,
        );

        let ack = cs.handle_setup(&server_only(0x77), now).unwrap();
        assert_eq!(ack_nonce(&ack), n);
        assert_eq!(cs.server_nonce(), Some([0x77; 16]));
    }

    #[test]
    fn server_nonce_updates_existing_transport_silently() {
        let mut cs = CryptState::new(true);
        let now = Instant::now();
        cs.handle_setup(&rekey(1, 0x11, 0x22), now);
        assert!(cs.has_transport());

        assert_eq!(cs.handle_setup(&server_only(0x99), now), None);
        assert_eq!(cs.server_nonce(), Some([0x99; 16]));
    }

    #[test]
    fn zero_client_nonce_never_replaces_known_one() {
        let mut cs = CryptState::new(false);
        let now = Instant::now();
        cs.handle_setup(&rekey(1, 0x42, 0x01), now);

        let ack = cs.handle_setup(&rekey(1, 0x00, 0x02), now).unwrap();
        assert_eq!(ack_nonce(&ack), vec![0x42; 16]);
        assert_eq!(cs.client_nonce(), Some([0x42; 16]));
    }

    #[test]
    fn udp_rekey_with_zero_client_nonce_keeps_known_nonce() {
        let mut cs = CryptState::new(true);
        let now = Instant::now();
        cs.handle_setup(&rekey(1, 0x42, 0x01), now);

        let ack = cs.handle_setup(&rekey(1, 0x00, 0x02), now).unwrap();
        assert_eq!(ack_nonce(&ack), vec![0x42; 16]);
        assert_eq!(cs.client_nonce(), Some([0x42; 16]));
        assert!(cs.has_transport());

        // the transport still encrypts with the known nonce
        let mut server = CryptState::new(true);
        server.handle_setup(&rekey(1, 0x02, 0x42), now);
        let enc = cs.encrypt(b"voice").unwrap();
        assert_eq!(server.decrypt(&enc, now).unwrap(), b"voice");

        let ack = cs.handle_setup(&msgs::CryptSetup::default(), now).unwrap();
        assert!(ack_nonce(&ack).iter().any(|&b| b != 0));
    }

    #[test]
    fn wrong_sized_nonces_are_ignored() {
        let mut cs = CryptState::new(false);
        let now = Instant::now();
        cs.handle_setup(&rekey(1, 0x42, 0x01), now);

        let bad = msgs::CryptSetup {
            key: None,
            client_nonce: Some(vec![0x55; 8]),
            server_nonce: Some(vec![0x66; 15]),
        };
        assert_eq!(CryptState::classify(&bad), SetupKind::ResyncRequest);

        let ack = cs.handle_setup(&bad, now).unwrap();
        assert_eq!(ack_nonce(&ack), vec![0x42; 16]);
        assert_eq!(cs.server_nonce(), Some([0x01; 16]));
    }

    #[test]
    fn rekey_is_idempotent() {
        let mut cs = CryptState::new(false);
        let now = Instant::now();
        let msg = rekey(3, 0x10, 0x20);

        let first = cs.handle_setup(&msg, now);
        let state = (cs.client_nonce(), cs.server_nonce());
        let second = cs.handle_setup(&msg, now);

        assert_eq!(first, second);
        assert_eq!(state, (cs.client_nonce(), cs.server_nonce()));
    }

    #[test]
    fn acks_stay_nonzero_once_a_nonce_was_seen() {
        // deterministic pseudo-random sequence over all message shapes
        let mut seed: u32 = 0x1234_5678;
        let mut next = || {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            (seed >> 16) as u8
        };

        for udp in [false, true] {
            let mut cs = CryptState::new(udp);
            let now = Instant::now();
            let mut seen = false;

            for _ in 0..500 {
                let msg = match next() % 5 {
                    0 => rekey(next(), next() % 3, next()),
                    1 => server_only(next()),
                    2 => msgs::CryptSetup::default(),
                    3 => msgs::CryptSetup {
                        client_nonce: Some(vec![next(); 4]),
                        ..Default::default()
                    },
                    _ => rekey(next(), 0, next()),
                };

                if let Some(c) = &msg.client_nonce {
                    if c.len() == 16 && msg.server_nonce.is_some() && c.iter().any(|&b| b != 0) {
                        seen = true;
                    }
                }

                if let Some(ack) = cs.handle_setup(&msg, now) {
                    let nonce = ack_nonce(&ack);
                    if seen {
                        assert!(nonce.iter().any(|&b| b != 0));
                    }
                }
            }
        }
    }

    #[test]
    fn resync_request_rate_limited() {
        let mut cs = CryptState::new(true);
        let start = Instant::now();
        cs.handle_setup(&rekey(1, 1, 2), start);

        assert!(!cs.should_request_resync(start + Duration::from_secs(1)));
        assert!(cs.should_request_resync(start + Duration::from_secs(6)));
        assert!(!cs.should_request_resync(start + Duration::from_secs(7)));
        assert!(cs.should_request_resync(start + Duration::from_secs(12)));
    }

    #[test]
    fn transport_round_trip_through_state() {
        let mut client = CryptState::new(true);
        let mut server = CryptState::new(true);
        let now = Instant::now();

        client.handle_setup(&rekey(8, 0x01, 0x02), now);
        server.handle_setup(&rekey(8, 0x02, 0x01), now);

        let enc = client.encrypt(b"voice").unwrap();
        assert_eq!(server.decrypt(&enc, now).unwrap(), b"voice");
        assert_eq!(server.stats().good, 1);

        client.reset_transport();
        assert_eq!(client.encrypt(b"x"), Err(CryptError::NoTransport));
        assert_eq!(client.client_nonce(), Some([0x01; 16]));
    }
}
