use std::io;
use std::path::PathBuf;
use std::time::Duration;

use sysinfo::{System, SystemExt};
use thiserror::Error;

pub use crate::control::{ControlCodec, ControlPacket, RawPacket};
pub use crate::crypt::CryptState;
pub use crate::event::{AudioFrame, Event, UserUpdated};
pub use crate::session::{Command, ConnectionState, Output, Session};
pub use crate::tasks::{spawn, UpstreamHandle};

use crate::control::DecodePayloadError;
use crate::proto::msgs;
use crate::voice::VoiceDecodeError;

pub mod control;
pub mod crypt;
pub mod event;
pub mod proto;
pub mod server_state;
pub mod voice;

mod connect;
mod session;
mod tasks;

const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version 1.5.0 in the legacy `major << 16 | minor << 8 | patch`
/// encoding.
const VERSION_V1: u32 = 0x0001_0500;
/// Protocol version 1.5.0 in the 64-bit `major << 48 | minor << 32 | patch << 16`
/// encoding.
const VERSION_V2: u64 = 1 << 48 | 5 << 32;

#[derive(Debug, Clone)]
pub struct MumbleConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub certfile: Option<PathBuf>,
    pub accept_invalid_certs: bool,
    /// Tunnel all voice over the TCP control connection.
    pub tcp_only: bool,
    pub ping_interval: Duration,
    pub max_missed_pings: u32,
    pub reconnect_attempts: u32,
    pub reconnect_max_delay: Duration,
}

impl MumbleConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        MumbleConfig {
            host: host.into(),
            port: 64738,
            username: username.into(),
            password: None,
            certfile: None,
            accept_invalid_certs: false,
            tcp_only: false,
            ping_interval: Duration::from_secs(5),
            max_missed_pings: 3,
            reconnect_attempts: 10,
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("voice server unreachable after {0} reconnect attempts")]
    Outage(u32),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
    #[error("invalid server name '{0}'")]
    InvalidServerName(String),
    #[error("client certificate: {0}")]
    Certificate(String),
    #[error("connection closed by server")]
    Closed,
    #[error("connection rejected by server ({kind}): {reason}")]
    Rejected { kind: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Control(#[from] DecodePayloadError),
    #[error(transparent)]
    Voice(#[from] VoiceDecodeError),
    #[error("{0} consecutive malformed frames")]
    Repeated(u32),
}

fn version_packet() -> msgs::Version {
    let info = System::new();

    msgs::Version {
        version_v1: Some(VERSION_V1),
        version_v2: Some(VERSION_V2),
        release: Some(format!("voice-bridge {}", CRATE_VERSION)),
        os: Some(info.name().unwrap_or_else(|| "unknown".to_string())),
        os_version: Some(format!(
            "{}; {}",
            info.os_version().unwrap_or_else(|| "unknown".to_string()),
            info.kernel_version()
                .unwrap_or_else(|| "unknown".to_string())
        )),
    }
}
