use std::future::pending;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, MissedTickBehavior};
use tokio_util::codec::Framed;

use crate::connect;
use crate::control::{ControlCodec, ControlPacket};
use crate::event::Event;
use crate::session::{Command, ConnectionState, Output, Session};
use crate::{Error, MumbleConfig, TransportError};

const AUDIO_QUEUE: usize = 64;
const MAX_DATAGRAM: usize = 1024;

/// Handle for feeding commands into the upstream task. Cloneable; the task
/// shuts down once every handle is gone.
#[derive(Debug, Clone)]
pub struct UpstreamHandle {
    control_tx: mpsc::UnboundedSender<Command>,
    audio_tx: mpsc::Sender<Command>,
}

impl UpstreamHandle {
    /// Creates a handle that isn't attached to a running task, together with
    /// the receiving ends of its queues.
    pub fn detached() -> (
        Self,
        mpsc::UnboundedReceiver<Command>,
        mpsc::Receiver<Command>,
    ) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE);

        (
            UpstreamHandle {
                control_tx,
                audio_tx,
            },
            control_rx,
            audio_rx,
        )
    }

    /// Queues one Opus frame for `channel`. Never blocks; a full queue drops
    /// the frame.
    pub fn send_audio(&self, channel: u32, payload: Bytes, terminator: bool) -> bool {
        let command = Command::Audio {
            channel,
            payload,
            terminator,
        };

        match self.audio_tx.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping outgoing frame for channel {}: {}", channel, e);
                false
            }
        }
    }

    pub fn listen(&self, channel: u32) {
        let _ = self.control_tx.send(Command::Listen(channel));
    }

    pub fn unlisten(&self, channel: u32) {
        let _ = self.control_tx.send(Command::Unlisten(channel));
    }
}

/// Starts the task that owns the upstream connection.
pub fn spawn(
    config: MumbleConfig,
) -> (
    UpstreamHandle,
    mpsc::UnboundedReceiver<Event>,
    JoinHandle<Result<(), Error>>,
) {
    let (handle, control_rx, audio_rx) = UpstreamHandle::detached();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(run(config, control_rx, audio_rx, event_tx));

    (handle, event_rx, task)
}

struct Commands {
    control: mpsc::UnboundedReceiver<Command>,
    audio: mpsc::Receiver<Command>,
}

enum Exit {
    Shutdown,
    Reconnect,
}

async fn run(
    config: MumbleConfig,
    control: mpsc::UnboundedReceiver<Command>,
    audio: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<Event>,
) -> Result<(), Error> {
    let mut session = Session::new(&config, Instant::now());
    let mut commands = Commands { control, audio };
    let mut failures = 0;

    loop {
        forward_events(session.on_connecting(), &events);

        let mut synced = false;
        let result = run_connection(&config, &mut session, &mut commands, &events, &mut synced).await;

        forward_events(session.on_disconnect(), &events);

        match result {
            Ok(Exit::Shutdown) => break,
            Ok(Exit::Reconnect) => {}
            Err(e) => error!("Upstream connection failed: {}", e),
        }

        if synced {
            failures = 0;
        }

        failures += 1;

        if failures > config.reconnect_attempts {
            error!("Giving up after {} reconnect attempts", config.reconnect_attempts);
            let _ = events.send(Event::Outage);
            return Err(Error::Outage(config.reconnect_attempts));
        }

        let delay = backoff(failures, config.reconnect_max_delay);
        info!("Reconnecting in {:?} (attempt {})", delay, failures);

        if let Exit::Shutdown = wait(delay, &mut session, &mut commands, &events).await {
            break;
        }
    }

    debug!("upstream exit");
    Ok(())
}

fn backoff(attempt: u32, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_secs(1 << exp).min(max)
}

/// Sleeps out the reconnect delay while still taking commands, so listen
/// changes made during an outage are applied after the next sync.
async fn wait(
    delay: Duration,
    session: &mut Session,
    commands: &mut Commands,
    events: &mpsc::UnboundedSender<Event>,
) -> Exit {
    let timer = sleep(delay);
    tokio::pin!(timer);

    loop {
        select! {
            _ = &mut timer => return Exit::Reconnect,
            cmd = commands.control.recv() => match cmd {
                Some(cmd) => forward_events(session.on_command(cmd), events),
                None => return Exit::Shutdown,
            },
            cmd = commands.audio.recv() => if cmd.is_none() {
                return Exit::Shutdown;
            },
        }
    }
}

fn forward_events(outputs: Vec<Output>, events: &mpsc::UnboundedSender<Event>) {
    for output in outputs {
        if let Output::Event(ev) = output {
            let _ = events.send(ev);
        }
    }
}

async fn run_connection(
    config: &MumbleConfig,
    session: &mut Session,
    commands: &mut Commands,
    events: &mpsc::UnboundedSender<Event>,
    synced: &mut bool,
) -> Result<Exit, Error> {
    let stream = connect::connect(config).await?;
    let peer = stream.get_ref().0.peer_addr().map_err(TransportError::from)?;

    let udp = if config.tcp_only {
        info!("UDP disabled, tunnelling voice over TCP");
        None
    } else {
        match open_udp(peer).await {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!("Failed to open UDP socket, tunnelling voice over TCP: {}", e);
                None
            }
        }
    };

    let (mut tcp_tx, mut tcp_rx) = Framed::new(stream, ControlCodec::new()).split();
    let mut link = Link {
        tcp: &mut tcp_tx,
        udp: udp.as_ref(),
        events,
    };

    if link.dispatch(session.on_connect(Instant::now())).await? {
        return Ok(Exit::Reconnect);
    }

    let mut ping_timer = interval_at(
        tokio::time::Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut buf = vec![0; MAX_DATAGRAM];

    loop {
        let outputs = select! {
            frame = tcp_rx.next() => match frame {
                Some(Ok(raw)) => session.on_frame(raw, Instant::now())?,
                Some(Err(e)) => return Err(TransportError::Io(e).into()),
                None => return Err(TransportError::Closed.into()),
            },
            len = recv_udp(udp.as_ref(), &mut buf) => match len {
                Ok(len) => session.on_udp(&buf[..len], Instant::now()),
                Err(e) => {
                    debug!("UDP receive failed: {}", e);
                    continue;
                }
            },
            cmd = commands.control.recv() => match cmd {
                Some(cmd) => session.on_command(cmd),
                None => return Ok(Exit::Shutdown),
            },
            cmd = commands.audio.recv() => match cmd {
                Some(cmd) => session.on_command(cmd),
                None => return Ok(Exit::Shutdown),
            },
            _ = ping_timer.tick() => session.on_ping_tick(Instant::now()),
        };

        if session.state() == ConnectionState::Synced {
            *synced = true;
        }

        if link.dispatch(outputs).await? {
            return Ok(Exit::Reconnect);
        }
    }
}

async fn open_udp(peer: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = if peer.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };

    let socket = UdpSocket::bind(local).await?;
    socket.connect(peer).await?;
    Ok(socket)
}

async fn recv_udp(socket: Option<&UdpSocket>, buf: &mut [u8]) -> io::Result<usize> {
    match socket {
        Some(socket) => socket.recv(buf).await,
        None => pending().await,
    }
}

/// The write side of one connection.
struct Link<'a, S> {
    tcp: &'a mut SplitSink<Framed<S, ControlCodec>, ControlPacket>,
    udp: Option<&'a UdpSocket>,
    events: &'a mpsc::UnboundedSender<Event>,
}

impl<'a, S> Link<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Carries out the session's outputs. Returns `true` when the session
    /// asked for a reconnect.
    async fn dispatch(&mut self, outputs: Vec<Output>) -> Result<bool, Error> {
        let mut reconnect = false;

        for output in outputs {
            match output {
                Output::Control(packet) => {
                    self.tcp.feed(packet).await.map_err(TransportError::from)?;
                }
                Output::Udp(datagram) => match self.udp {
                    Some(socket) => {
                        if let Err(e) = socket.send(&datagram).await {
                            debug!("UDP send failed: {}", e);
                        }
                    }
                    None => debug!("Dropping datagram, no UDP socket"),
                },
                Output::Event(ev) => {
                    let _ = self.events.send(ev);
                }
                Output::Reconnect => reconnect = true,
            }
        }

        self.tcp.flush().await.map_err(TransportError::from)?;

        Ok(reconnect)
    }
}
