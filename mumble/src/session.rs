//! The upstream session as a socket-free state machine.
//!
//! Every input (a control frame, a UDP datagram, a command from the bridge,
//! a ping timer tick) returns the list of [`Output`]s it caused. The task in
//! [`crate::tasks`] owns the sockets and carries the outputs out.

use std::collections::{BTreeSet, VecDeque};
use std::time::Instant;

use bytes::Bytes;
use log::{debug, error, info, warn};

use crate::control::{ControlPacket, RawPacket};
use crate::crypt::CryptState;
use crate::event::{AudioFrame, Event};
use crate::proto::msgs;
use crate::proto::msgs::reject::RejectType;
use crate::proto::msgs::voice_target::Target;
use crate::server_state::ServerState;
use crate::voice::{Audio, AudioHeader, Ping as UdpPing, VoicePacket};
use crate::{version_packet, Error, MumbleConfig, ProtocolError, TransportError};

const MAX_VOICE_TARGETS: u32 = 30;
const MAX_OUTSTANDING_PINGS: usize = 16;
const MAX_UDP_UNANSWERED: u32 = 3;
const MAX_CONSECUTIVE_VIOLATIONS: u32 = 10;

/// Mumble's `ClientType::BOT`.
const CLIENT_TYPE_BOT: i32 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Synced,
    /// Pings went unanswered. Left only by reconnecting.
    Degraded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// One Opus frame to send into `channel`.
    Audio {
        channel: u32,
        payload: Bytes,
        terminator: bool,
    },
    Listen(u32),
    Unlisten(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Control(ControlPacket),
    /// An encrypted datagram for the server's UDP port.
    Udp(Vec<u8>),
    Event(Event),
    Reconnect,
}

pub struct Session {
    username: String,
    password: Option<String>,
    udp: bool,
    max_missed_pings: u32,

    state: ConnectionState,
    crypt: CryptState,
    server: ServerState,
    listening: BTreeSet<u32>,
    targets: VoiceTargets,
    frame_number: u64,

    epoch: Instant,
    last_timestamp: u64,
    outstanding: VecDeque<u64>,
    pong_since_tick: bool,
    missed: u32,
    last_ping_sent: Option<Instant>,
    last_pong: Option<Instant>,

    udp_verified: bool,
    udp_outstanding: Option<u64>,
    udp_unanswered: u32,

    violations: u32,
    tcp_packets: u32,
    udp_packets: u32,

    out: Vec<Output>,
}

impl Session {
    pub fn new(config: &MumbleConfig, now: Instant) -> Self {
        Session {
            username: config.username.clone(),
            password: config.password.clone(),
            udp: !config.tcp_only,
            max_missed_pings: config.max_missed_pings.max(1),
            state: ConnectionState::Disconnected,
            crypt: CryptState::new(!config.tcp_only),
            server: ServerState::new(),
            listening: BTreeSet::new(),
            targets: VoiceTargets::default(),
            frame_number: 0,
            epoch: now,
            last_timestamp: 0,
            outstanding: VecDeque::new(),
            pong_since_tick: false,
            missed: 0,
            last_ping_sent: None,
            last_pong: None,
            udp_verified: false,
            udp_outstanding: None,
            udp_unanswered: 0,
            violations: 0,
            tcp_packets: 0,
            udp_packets: 0,
            out: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn crypt(&self) -> &CryptState {
        &self.crypt
    }

    pub fn server(&self) -> &ServerState {
        &self.server
    }

    pub fn is_listening(&self, channel: u32) -> bool {
        self.listening.contains(&channel)
    }

    pub fn udp_verified(&self) -> bool {
        self.udp_verified
    }

    pub fn last_ping_sent(&self) -> Option<Instant> {
        self.last_ping_sent
    }

    pub fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }

    pub fn on_connecting(&mut self) -> Vec<Output> {
        self.set_state(ConnectionState::Connecting);
        self.take()
    }

    /// The TLS connection is up: introduce ourselves and ping right away.
    pub fn on_connect(&mut self, now: Instant) -> Vec<Output> {
        self.reset_connection();
        self.set_state(ConnectionState::Handshaking);

        self.send(version_packet());
        self.send(msgs::Authenticate {
            username: Some(self.username.clone()),
            password: self.password.clone(),
            opus: Some(true),
            client_type: Some(CLIENT_TYPE_BOT),
            ..Default::default()
        });
        self.send_ping(now);

        self.take()
    }

    pub fn on_disconnect(&mut self) -> Vec<Output> {
        self.crypt.reset_transport();
        self.udp_verified = false;
        self.set_state(ConnectionState::Disconnected);
        self.take()
    }

    pub fn on_frame(&mut self, raw: RawPacket, now: Instant) -> Result<Vec<Output>, Error> {
        match ControlPacket::try_from(raw) {
            Ok(packet) => {
                self.violations = 0;
                self.handle_control(packet, now)?;
            }
            Err(e) => self.violation(e.into())?,
        }

        Ok(self.take())
    }

    pub fn on_udp(&mut self, data: &[u8], now: Instant) -> Vec<Output> {
        match self.crypt.decrypt(data, now) {
            Ok(plain) => {
                self.udp_packets = self.udp_packets.wrapping_add(1);

                match VoicePacket::decode(Bytes::from(plain)) {
                    Ok(VoicePacket::Audio(audio)) => self.handle_audio(audio),
                    Ok(VoicePacket::Ping(ping)) => self.handle_udp_ping(ping),
                    Err(e) => warn!("Dropping malformed UDP datagram: {}", e),
                }
            }
            Err(e) => {
                debug!("Dropping UDP datagram: {}", e);

                if self.crypt.should_request_resync(now) {
                    info!("UDP decryption failing, requesting crypt resync");
                    self.send(msgs::CryptSetup::default());
                }
            }
        }

        self.take()
    }

    pub fn on_command(&mut self, command: Command) -> Vec<Output> {
        match command {
            Command::Audio {
                channel,
                payload,
                terminator,
            } => self.transmit(channel, payload, terminator),
            Command::Listen(channel) => {
                if self.listening.insert(channel) {
                    self.send_listening(vec![channel], vec![]);
                }
            }
            Command::Unlisten(channel) => {
                if self.listening.remove(&channel) {
                    self.send_listening(vec![], vec![channel]);
                }
            }
        }

        self.take()
    }

    pub fn on_ping_tick(&mut self, now: Instant) -> Vec<Output> {
        match self.state {
            ConnectionState::Handshaking | ConnectionState::Synced => {}
            _ => return self.take(),
        }

        if self.pong_since_tick {
            self.missed = 0;
        } else {
            self.missed += 1;
            warn!("No ping reply for {} interval(s)", self.missed);
        }
        self.pong_since_tick = false;

        if self.missed >= self.max_missed_pings {
            error!("Voice server stopped answering pings, reconnecting");
            self.set_state(ConnectionState::Degraded);
            self.out.push(Output::Reconnect);
            return self.take();
        }

        self.send_ping(now);

        if self.udp && self.crypt.has_transport() {
            if self.udp_outstanding.is_some() {
                self.udp_unanswered += 1;

                if self.udp_unanswered >= MAX_UDP_UNANSWERED && self.udp_verified {
                    warn!("UDP pings unanswered, tunnelling voice over TCP");
                    self.udp_verified = false;
                }
            }

            self.send_udp_ping(now);
        }

        self.take()
    }

    fn handle_control(&mut self, packet: ControlPacket, now: Instant) -> Result<(), Error> {
        match packet {
            ControlPacket::Version(msg) => {
                info!(
                    "Server is running {} on {} {}",
                    msg.release.as_deref().unwrap_or("unknown"),
                    msg.os.as_deref().unwrap_or("unknown"),
                    msg.os_version.as_deref().unwrap_or("")
                );
            }
            ControlPacket::UdpTunnel(data) => {
                self.tcp_packets = self.tcp_packets.wrapping_add(1);

                match VoicePacket::decode(data) {
                    Ok(VoicePacket::Audio(audio)) => self.handle_audio(audio),
                    Ok(VoicePacket::Ping(_)) => {}
                    Err(e) => self.violation(e.into())?,
                }
            }
            ControlPacket::Ping(msg) => self.handle_ping(msg, now),
            ControlPacket::Reject(msg) => {
                let kind = match msg.r#type.map(RejectType::try_from) {
                    Some(Ok(t)) => format!("{:?}", t),
                    _ => "unknown".to_string(),
                };
                let reason = msg.reason.unwrap_or_default();

                error!("Connection rejected by server: {} {}", kind, reason);
                return Err(TransportError::Rejected { kind, reason }.into());
            }
            ControlPacket::ServerSync(msg) => self.handle_server_sync(msg, now),
            ControlPacket::CryptSetup(msg) => {
                if let Some(ack) = self.crypt.handle_setup(&msg, now) {
                    self.send(ack);
                }

                if self.udp && self.crypt.has_transport() && self.udp_outstanding.is_none() {
                    self.send_udp_ping(now);
                }
            }
            ControlPacket::ChannelState(msg) => {
                if let Some(ev) = self.server.update_channel(msg) {
                    self.emit(ev);
                }
            }
            ControlPacket::ChannelRemove(msg) => {
                self.targets.forget(msg.channel_id);

                if let Some(ev) = self.server.remove_channel(msg.channel_id) {
                    self.emit(ev);
                }
            }
            ControlPacket::UserState(msg) => {
                if let Some(ev) = self.server.update_user(msg) {
                    self.emit(ev);
                }
            }
            ControlPacket::UserRemove(msg) => {
                if Some(msg.session) == self.server.own_session() {
                    warn!(
                        "Removed from server: {}",
                        msg.reason.as_deref().unwrap_or("no reason given")
                    );
                }

                if let Some(ev) = self.server.remove_user(msg.session) {
                    self.emit(ev);
                }
            }
            ControlPacket::TextMessage(msg) => {
                info!("Message from {:?}: {}", msg.actor, msg.message);
            }
            ControlPacket::CodecVersion(msg) => {
                if msg.opus != Some(true) {
                    warn!("Server does not advertise Opus support");
                }
            }
            ControlPacket::ServerConfig(msg) => self.server.update_server_config(&msg),
            ControlPacket::Other { kind, .. } => {
                debug!("Ignoring message type {}", kind);
            }
            x => {
                debug!("Unexpected packet from server: {:?}", x);
            }
        }

        Ok(())
    }

    fn handle_ping(&mut self, msg: msgs::Ping, now: Instant) {
        match msg.timestamp {
            Some(ts) if self.outstanding.contains(&ts) => {
                while let Some(t) = self.outstanding.pop_front() {
                    if t == ts {
                        break;
                    }
                }

                self.pong_since_tick = true;
                self.missed = 0;
                self.last_pong = Some(now);
            }
            timestamp => {
                self.send(msgs::Ping {
                    timestamp,
                    ..Default::default()
                });
            }
        }
    }

    fn handle_server_sync(&mut self, msg: msgs::ServerSync, now: Instant) {
        let session = match msg.session {
            Some(s) => s,
            None => {
                warn!("ServerSync without a session id");
                return;
            }
        };

        if let Some(text) = &msg.welcome_text {
            info!("Server says: {}", text);
        }
        info!(
            "Session id {}, max bandwidth {:?}, permissions {:X}",
            session,
            msg.max_bandwidth,
            msg.permissions.unwrap_or_default()
        );

        self.server.set_own_session(session);

        if self.state != ConnectionState::Handshaking {
            return;
        }

        self.send_ping(now);

        if !self.listening.is_empty() {
            self.send(msgs::UserState {
                session: Some(session),
                listening_channel_add: self.listening.iter().copied().collect(),
                ..Default::default()
            });
        }

        self.set_state(ConnectionState::Synced);
        self.emit(Event::Synced { session });
    }

    fn handle_audio(&mut self, audio: Audio) {
        if self.state != ConnectionState::Synced {
            debug!("Dropping incoming audio while {:?}", self.state);
            return;
        }

        let sender = audio.sender_session;
        let channel = match self.server.user(sender) {
            Some(user) => user.channel(),
            None => {
                debug!("Dropping audio from unknown session {}", sender);
                return;
            }
        };

        let position = audio.position();

        self.emit(Event::Audio(AudioFrame {
            sender,
            channel,
            frame_number: audio.frame_number,
            payload: audio.opus_data,
            position,
            terminator: audio.is_terminator,
        }));
    }

    fn handle_udp_ping(&mut self, ping: UdpPing) {
        if Some(ping.timestamp) != self.udp_outstanding {
            return;
        }

        self.udp_outstanding = None;
        self.udp_unanswered = 0;

        if !self.udp_verified {
            info!("UDP path verified");
            self.udp_verified = true;
        }
    }

    fn transmit(&mut self, channel: u32, payload: Bytes, terminator: bool) {
        if self.state != ConnectionState::Synced {
            debug!("Dropping outgoing audio while {:?}", self.state);
            return;
        }

        let target = if self.server.own_channel() == Some(channel) {
            0
        } else {
            let (id, fresh) = self.targets.resolve(channel);

            if fresh {
                debug!("Registering voice target {} for channel {}", id, channel);
                self.send(msgs::VoiceTarget {
                    id: Some(id),
                    targets: vec![Target {
                        channel_id: Some(channel),
                        ..Default::default()
                    }],
                });
            }

            id
        };

        let frame_number = self.frame_number;
        self.frame_number += 1;

        self.send_voice(VoicePacket::Audio(Audio {
            header: Some(AudioHeader::Target(target)),
            frame_number,
            opus_data: payload,
            is_terminator: terminator,
            ..Default::default()
        }));
    }

    fn send_listening(&mut self, add: Vec<u32>, remove: Vec<u32>) {
        if self.state != ConnectionState::Synced {
            return;
        }

        let session = match self.server.own_session() {
            Some(s) => s,
            None => return,
        };

        self.send(msgs::UserState {
            session: Some(session),
            listening_channel_add: add,
            listening_channel_remove: remove,
            ..Default::default()
        });
    }

    fn send_voice(&mut self, packet: VoicePacket) {
        let data = packet.encode();

        if self.udp_verified {
            match self.crypt.encrypt(&data) {
                Ok(datagram) => {
                    self.out.push(Output::Udp(datagram));
                    return;
                }
                Err(e) => debug!("Falling back to TCP tunnel: {}", e),
            }
        }

        self.send(ControlPacket::UdpTunnel(data));
    }

    fn send_ping(&mut self, now: Instant) {
        let timestamp = self.next_timestamp(now);

        if self.outstanding.len() == MAX_OUTSTANDING_PINGS {
            self.outstanding.pop_front();
        }
        self.outstanding.push_back(timestamp);
        self.last_ping_sent = Some(now);

        let stats = self.crypt.stats();

        self.send(msgs::Ping {
            timestamp: Some(timestamp),
            good: Some(stats.good),
            late: Some(stats.late),
            lost: Some(stats.lost),
            resync: Some(self.crypt.resyncs()),
            udp_packets: Some(self.udp_packets),
            tcp_packets: Some(self.tcp_packets),
            ..Default::default()
        });
    }

    fn send_udp_ping(&mut self, now: Instant) {
        let timestamp = self.next_timestamp(now);
        let data = VoicePacket::Ping(UdpPing {
            timestamp,
            ..Default::default()
        })
        .encode();

        if let Ok(datagram) = self.crypt.encrypt(&data) {
            self.udp_outstanding = Some(timestamp);
            self.out.push(Output::Udp(datagram));
        }
    }

    /// Milliseconds since the session was created, strictly increasing so
    /// every outstanding ping can be told apart.
    fn next_timestamp(&mut self, now: Instant) -> u64 {
        let ms = now.saturating_duration_since(self.epoch).as_millis() as u64;
        let ts = ms.max(self.last_timestamp + 1);
        self.last_timestamp = ts;
        ts
    }

    fn violation(&mut self, e: ProtocolError) -> Result<(), Error> {
        warn!("Dropping malformed frame: {}", e);
        self.violations += 1;

        if self.violations >= MAX_CONSECUTIVE_VIOLATIONS {
            Err(ProtocolError::Repeated(self.violations).into())
        } else {
            Ok(())
        }
    }

    fn reset_connection(&mut self) {
        self.server = ServerState::new();
        self.targets = VoiceTargets::default();
        self.outstanding.clear();
        self.pong_since_tick = false;
        self.missed = 0;
        self.udp_verified = false;
        self.udp_outstanding = None;
        self.udp_unanswered = 0;
        self.violations = 0;
        self.tcp_packets = 0;
        self.udp_packets = 0;
        self.out.clear();
        self.crypt.reset_transport();
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("Upstream session {:?} -> {:?}", self.state, state);
            self.state = state;
            self.emit(Event::StateChanged(state));
        }
    }

    fn send(&mut self, packet: impl Into<ControlPacket>) {
        self.out.push(Output::Control(packet.into()));
    }

    fn emit(&mut self, event: Event) {
        self.out.push(Output::Event(event));
    }

    fn take(&mut self) -> Vec<Output> {
        std::mem::take(&mut self.out)
    }
}

/// Voice target slots (ids 1..=30) registered on the current connection,
/// oldest allocation first.
#[derive(Debug, Default)]
struct VoiceTargets {
    slots: VecDeque<(u32, u32)>,
}

impl VoiceTargets {
    /// Returns the target id for `channel` and whether it was newly
    /// allocated and still has to be registered with the server.
    fn resolve(&mut self, channel: u32) -> (u32, bool) {
        if let Some(&(id, _)) = self.slots.iter().find(|(_, c)| *c == channel) {
            return (id, false);
        }

        let free = (1..=MAX_VOICE_TARGETS).find(|id| !self.slots.iter().any(|(i, _)| i == id));

        let id = match free {
            Some(id) => id,
            None => match self.slots.pop_front() {
                Some((id, _)) => id,
                None => 1,
            },
        };

        self.slots.push_back((id, channel));
        (id, true)
    }

    fn forget(&mut self, channel: u32) {
        self.slots.retain(|(_, c)| *c != channel);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    use crate::control::ControlCodec;
    use crate::event::UserUpdated;

    use super::*;

    const OWN: u32 = 1;
    const OWN_CHANNEL: u32 = 0;
    const DISPATCH: u32 = 5;

    fn config(tcp_only: bool) -> MumbleConfig {
        let mut config = MumbleConfig::new("localhost", "bridge");
        config.tcp_only = tcp_only;
        config
    }

    fn raw(packet: impl Into<ControlPacket>) -> RawPacket {
        let mut buf = BytesMut::new();
        ControlCodec::new().encode(packet.into(), &mut buf).unwrap();
        ControlCodec::new().decode(&mut buf).unwrap().unwrap()
    }

    fn controls(out: &[Output]) -> Vec<ControlPacket> {
        out.iter()
            .filter_map(|o| match o {
                Output::Control(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    fn events(out: &[Output]) -> Vec<Event> {
        out.iter()
            .filter_map(|o| match o {
                Output::Event(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    fn ping_timestamps(out: &[Output]) -> Vec<u64> {
        controls(out)
            .into_iter()
            .filter_map(|p| match p {
                ControlPacket::Ping(p) => p.timestamp,
                _ => None,
            })
            .collect()
    }

    fn user(session: u32, name: &str, channel: u32) -> msgs::UserState {
        msgs::UserState {
            session: Some(session),
            name: Some(name.to_string()),
            channel_id: Some(channel),
            ..Default::default()
        }
    }

    fn pong(session: &mut Session, out: &[Output], now: Instant) {
        for ts in ping_timestamps(out) {
            let reply = msgs::Ping {
                timestamp: Some(ts),
                ..Default::default()
            };
            let echo = session.on_frame(raw(reply), now).unwrap();
            assert!(controls(&echo).is_empty());
        }
    }

    fn synced(tcp_only: bool, now: Instant) -> Session {
        let mut s = Session::new(&config(tcp_only), now);
        s.on_connecting();
        s.on_connect(now);

        for packet in [
            ControlPacket::from(msgs::ChannelState {
                channel_id: Some(OWN_CHANNEL),
                name: Some("Root".to_string()),
                ..Default::default()
            }),
            ControlPacket::from(msgs::ChannelState {
                channel_id: Some(DISPATCH),
                name: Some("Dispatch".to_string()),
                parent: Some(0),
                ..Default::default()
            }),
            ControlPacket::from(user(OWN, "bridge", OWN_CHANNEL)),
            ControlPacket::from(user(2, "alice", DISPATCH)),
            ControlPacket::from(msgs::ServerSync {
                session: Some(OWN),
                ..Default::default()
            }),
        ] {
            s.on_frame(raw(packet), now).unwrap();
        }

        assert_eq!(s.state(), ConnectionState::Synced);
        s
    }

    #[test]
    fn connect_sends_version_auth_and_immediate_ping() {
        let now = Instant::now();
        let mut s = Session::new(&config(true), now);

        let out = s.on_connect(now);
        let packets = controls(&out);

        assert!(matches!(packets[0], ControlPacket::Version(_)));
        match &packets[1] {
            ControlPacket::Authenticate(a) => {
                assert_eq!(a.username.as_deref(), Some("bridge"));
                assert_eq!(a.opus, Some(true));
            }
            p => panic!("expected Authenticate, got {:?}", p),
        }
        assert!(matches!(packets[2], ControlPacket::Ping(_)));
        assert_eq!(s.state(), ConnectionState::Handshaking);
        assert_eq!(s.last_ping_sent(), Some(now));
    }

    #[test]
    fn server_sync_pings_before_entering_synced() {
        let now = Instant::now();
        let mut s = Session::new(&config(true), now);
        s.on_connect(now);

        let out = s
            .on_frame(
                raw(msgs::ServerSync {
                    session: Some(OWN),
                    ..Default::default()
                }),
                now,
            )
            .unwrap();

        let ping = out
            .iter()
            .position(|o| matches!(o, Output::Control(ControlPacket::Ping(_))))
            .unwrap();
        let synced = out
            .iter()
            .position(|o| *o == Output::Event(Event::StateChanged(ConnectionState::Synced)))
            .unwrap();

        assert!(ping < synced);
        assert!(events(&out).contains(&Event::Synced { session: OWN }));
    }

    #[test]
    fn server_ping_is_echoed_with_same_timestamp() {
        let now = Instant::now();
        let mut s = synced(true, now);

        let out = s
            .on_frame(
                raw(msgs::Ping {
                    timestamp: Some(123_456_789),
                    ..Default::default()
                }),
                now,
            )
            .unwrap();

        assert_eq!(
            controls(&out),
            vec![ControlPacket::Ping(msgs::Ping {
                timestamp: Some(123_456_789),
                ..Default::default()
            })]
        );
    }

    #[test]
    fn reply_to_own_ping_is_not_echoed() {
        let now = Instant::now();
        let mut s = Session::new(&config(true), now);
        let out = s.on_connect(now);

        pong(&mut s, &out, now);
        assert_eq!(s.last_pong(), Some(now));
    }

    #[test]
    fn three_missed_intervals_degrade_exactly_once() {
        let start = Instant::now();
        let mut s = synced(true, start);
        let interval = Duration::from_secs(5);

        let mut reconnects = 0;
        let mut degraded = 0;

        for i in 1..=6 {
            let out = s.on_ping_tick(start + interval * i);
            reconnects += out.iter().filter(|o| **o == Output::Reconnect).count();
            degraded += events(&out)
                .iter()
                .filter(|e| **e == Event::StateChanged(ConnectionState::Degraded))
                .count();

            if i < 3 {
                assert_eq!(s.state(), ConnectionState::Synced);
            }
        }

        assert_eq!(s.state(), ConnectionState::Degraded);
        assert_eq!(reconnects, 1);
        assert_eq!(degraded, 1);
    }

    #[test]
    fn pong_keeps_session_alive() {
        let start = Instant::now();
        let mut s = synced(true, start);
        let interval = Duration::from_secs(5);

        for i in 1..=10 {
            let now = start + interval * i;
            let out = s.on_ping_tick(now);
            assert!(!out.contains(&Output::Reconnect));
            pong(&mut s, &out, now);
        }

        assert_eq!(s.state(), ConnectionState::Synced);
    }

    #[test]
    fn malformed_frame_is_dropped() {
        let now = Instant::now();
        let mut s = synced(true, now);

        let bad = RawPacket {
            kind: crate::control::kind::USER_STATE,
            payload: Bytes::from_static(&[0x0a, 0xff, 0xff]),
        };

        let out = s.on_frame(bad, now).unwrap();
        assert!(out.is_empty());
        assert_eq!(s.state(), ConnectionState::Synced);
    }

    #[test]
    fn repeated_malformed_frames_are_fatal() {
        let now = Instant::now();
        let mut s = synced(true, now);

        let bad = RawPacket {
            kind: crate::control::kind::PING,
            payload: Bytes::from_static(&[0x08]),
        };

        for _ in 1..MAX_CONSECUTIVE_VIOLATIONS {
            assert!(s.on_frame(bad.clone(), now).is_ok());
        }

        assert!(matches!(
            s.on_frame(bad, now),
            Err(Error::Protocol(ProtocolError::Repeated(_)))
        ));
    }

    #[test]
    fn reject_is_a_transport_error() {
        let now = Instant::now();
        let mut s = Session::new(&config(true), now);
        s.on_connect(now);

        let err = s
            .on_frame(
                raw(msgs::Reject {
                    r#type: Some(RejectType::WrongServerPw as i32),
                    reason: Some("nope".to_string()),
                }),
                now,
            )
            .unwrap_err();

        match err {
            Error::Transport(TransportError::Rejected { kind, reason }) => {
                assert_eq!(kind, "WrongServerPw");
                assert_eq!(reason, "nope");
            }
            e => panic!("unexpected error {:?}", e),
        }
    }

    #[test]
    fn tcp_only_resync_acknowledges_cached_nonce() {
        let now = Instant::now();
        let mut s = synced(true, now);
        let n: Vec<u8> = (100..116).collect();

        s.on_frame(
            raw(msgs::CryptSetup {
                key: Some(vec![7; 16]),
                client_nonce: Some(n.clone()),
                server_nonce: Some(vec![8; 16]),
            }),
            now,
        )
        .unwrap();

        let out = s
            .on_frame(
                raw(msgs::CryptSetup {
                    server_nonce: Some(vec![9; 16]),
                    ..Default::default()
                }),
                now,
            )
            .unwrap();

        assert_eq!(
            controls(&out),
            vec![ControlPacket::CryptSetup(msgs::CryptSetup {
                key: None,
                client_nonce: Some(n),
                server_nonce: None,
            })]
        );
        assert!(out.iter().all(|o| !matches!(o, Output::Udp(_))));
    }

    #[test]
    fn upstream_audio_is_attributed_to_sender_channel() {
        let now = Instant::now();
        let mut s = synced(true, now);

        let datagram = VoicePacket::Audio(Audio {
            header: Some(AudioHeader::Context(0)),
            sender_session: 2,
            frame_number: 77,
            opus_data: Bytes::from_static(&[0x78, 1, 2]),
            ..Default::default()
        })
        .encode();

        let out = s.on_frame(raw(ControlPacket::UdpTunnel(datagram.clone())), now).unwrap();
        assert_eq!(
            events(&out),
            vec![Event::Audio(AudioFrame {
                sender: 2,
                channel: DISPATCH,
                frame_number: 77,
                payload: Bytes::from_static(&[0x78, 1, 2]),
                position: None,
                terminator: false,
            })]
        );

        // stop forwarding once degraded
        for i in 1..=3 {
            s.on_ping_tick(now + Duration::from_secs(5 * i));
        }
        let out = s.on_frame(raw(ControlPacket::UdpTunnel(datagram)), now).unwrap();
        assert!(events(&out).is_empty());
    }

    #[test]
    fn own_user_updates_are_not_reported_after_sync() {
        let now = Instant::now();
        let mut s = synced(true, now);

        let out = s.on_frame(raw(user(OWN, "bridge", DISPATCH)), now).unwrap();
        assert!(events(&out).is_empty());
        assert_eq!(s.server().own_channel(), Some(DISPATCH));

        let out = s.on_frame(raw(user(3, "bob", DISPATCH)), now).unwrap();
        assert_eq!(
            events(&out),
            vec![Event::UserUpdated(UserUpdated {
                session: 3,
                name: "bob".to_string(),
                channel: DISPATCH,
                old_channel: None,
            })]
        );
    }

    fn sent_audio(out: &[Output]) -> Vec<Audio> {
        controls(out)
            .into_iter()
            .filter_map(|p| match p {
                ControlPacket::UdpTunnel(data) => match VoicePacket::decode(data).unwrap() {
                    VoicePacket::Audio(a) => Some(a),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    fn audio_command(channel: u32) -> Command {
        Command::Audio {
            channel,
            payload: Bytes::from_static(&[0xfc, 0xff]),
            terminator: false,
        }
    }

    #[test]
    fn transmit_targets_own_channel_directly() {
        let now = Instant::now();
        let mut s = synced(true, now);

        let out = s.on_command(audio_command(OWN_CHANNEL));
        let audio = sent_audio(&out);

        assert_eq!(controls(&out).len(), 1);
        assert_eq!(audio[0].target(), Some(0));
        assert_eq!(audio[0].frame_number, 0);
    }

    #[test]
    fn transmit_registers_voice_target_once() {
        let now = Instant::now();
        let mut s = synced(true, now);

        let out = s.on_command(audio_command(DISPATCH));
        let packets = controls(&out);
        match &packets[0] {
            ControlPacket::VoiceTarget(t) => {
                assert_eq!(t.id, Some(1));
                assert_eq!(t.targets[0].channel_id, Some(DISPATCH));
            }
            p => panic!("expected VoiceTarget, got {:?}", p),
        }
        assert_eq!(sent_audio(&out)[0].target(), Some(1));

        let out = s.on_command(audio_command(DISPATCH));
        assert_eq!(controls(&out).len(), 1);
        let audio = sent_audio(&out);
        assert_eq!(audio[0].target(), Some(1));
        assert_eq!(audio[0].frame_number, 1);
    }

    #[test]
    fn voice_targets_reuse_least_recently_allocated() {
        let mut targets = VoiceTargets::default();

        for ch in 0..MAX_VOICE_TARGETS {
            assert_eq!(targets.resolve(100 + ch), (ch + 1, true));
        }

        assert_eq!(targets.resolve(100), (1, false));
        assert_eq!(targets.resolve(500), (1, true));
        assert_eq!(targets.resolve(501), (2, true));

        targets.forget(105);
        assert_eq!(targets.resolve(502), (6, true));
    }

    #[test]
    fn audio_dropped_until_synced() {
        let now = Instant::now();
        let mut s = Session::new(&config(true), now);
        s.on_connect(now);

        assert!(s.on_command(audio_command(OWN_CHANNEL)).is_empty());
    }

    #[test]
    fn listening_set_survives_reconnect() {
        let now = Instant::now();
        let mut s = synced(true, now);

        let out = s.on_command(Command::Listen(DISPATCH));
        assert_eq!(
            controls(&out),
            vec![ControlPacket::UserState(msgs::UserState {
                session: Some(OWN),
                listening_channel_add: vec![DISPATCH],
                ..Default::default()
            })]
        );
        assert!(s.on_command(Command::Listen(DISPATCH)).is_empty());

        s.on_disconnect();
        s.on_connecting();
        s.on_connect(now);

        let out = s
            .on_frame(
                raw(msgs::ServerSync {
                    session: Some(4),
                    ..Default::default()
                }),
                now,
            )
            .unwrap();

        assert!(controls(&out).contains(&ControlPacket::UserState(msgs::UserState {
            session: Some(4),
            listening_channel_add: vec![DISPATCH],
            ..Default::default()
        })));

        let out = s.on_command(Command::Unlisten(DISPATCH));
        assert_eq!(
            controls(&out),
            vec![ControlPacket::UserState(msgs::UserState {
                session: Some(4),
                listening_channel_remove: vec![DISPATCH],
                ..Default::default()
            })]
        );
        assert!(!s.is_listening(DISPATCH));
    }

    #[test]
    fn udp_used_after_ping_reply() {
        let now = Instant::now();
        let mut s = synced(false, now);
        let mut server = CryptState::new(true);

        let out = s
            .on_frame(
                raw(msgs::CryptSetup {
                    key: Some(vec![3; 16]),
                    client_nonce: Some(vec![1; 16]),
                    server_nonce: Some(vec![2; 16]),
                }),
                now,
            )
            .unwrap();
        server.handle_setup(
            &msgs::CryptSetup {
                key: Some(vec![3; 16]),
                client_nonce: Some(vec![2; 16]),
                server_nonce: Some(vec![1; 16]),
            },
            now,
        );

        // audio still tunnelled before verification
        assert_eq!(sent_audio(&s.on_command(audio_command(OWN_CHANNEL))).len(), 1);

        let probe = out
            .iter()
            .find_map(|o| match o {
                Output::Udp(d) => Some(d.clone()),
                _ => None,
            })
            .unwrap();
        let plain = server.decrypt(&probe, now).unwrap();
        let reply = server.encrypt(&plain).unwrap();

        assert!(s.on_udp(&reply, now).is_empty());
        assert!(s.udp_verified());

        let out = s.on_command(audio_command(OWN_CHANNEL));
        let datagram = match &out[..] {
            [Output::Udp(d)] => d.clone(),
            o => panic!("expected a single datagram, got {:?}", o),
        };
        match VoicePacket::decode(Bytes::from(server.decrypt(&datagram, now).unwrap())).unwrap() {
            VoicePacket::Audio(a) => assert_eq!(a.target(), Some(0)),
            p => panic!("unexpected {:?}", p),
        }
    }
}
