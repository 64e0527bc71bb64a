use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::proto::msgs;

const HEADER_LEN: usize = 6;
const MAX_PAYLOAD_LEN: usize = 8 * 1024 * 1024;

pub mod kind {
    pub const VERSION: u16 = 0;
    pub const UDP_TUNNEL: u16 = 1;
    pub const AUTHENTICATE: u16 = 2;
    pub const PING: u16 = 3;
    pub const REJECT: u16 = 4;
    pub const SERVER_SYNC: u16 = 5;
    pub const CHANNEL_REMOVE: u16 = 6;
    pub const CHANNEL_STATE: u16 = 7;
    pub const USER_REMOVE: u16 = 8;
    pub const USER_STATE: u16 = 9;
    pub const TEXT_MESSAGE: u16 = 11;
    pub const CRYPT_SETUP: u16 = 15;
    pub const VOICE_TARGET: u16 = 19;
    pub const CODEC_VERSION: u16 = 21;
    pub const SERVER_CONFIG: u16 = 24;
}

/// A control frame as it came off the wire, before the payload is decoded.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RawPacket {
    pub kind: u16,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlPacket {
    Version(msgs::Version),
    /// A voice datagram tunnelled over TCP. The payload is the bare datagram, not
    /// a protobuf message.
    UdpTunnel(Bytes),
    Authenticate(msgs::Authenticate),
    Ping(msgs::Ping),
    Reject(msgs::Reject),
    ServerSync(msgs::ServerSync),
    ChannelRemove(msgs::ChannelRemove),
    ChannelState(msgs::ChannelState),
    UserRemove(msgs::UserRemove),
    UserState(msgs::UserState),
    TextMessage(msgs::TextMessage),
    CryptSetup(msgs::CryptSetup),
    VoiceTarget(msgs::VoiceTarget),
    CodecVersion(msgs::CodecVersion),
    ServerConfig(msgs::ServerConfig),
    Other { kind: u16, payload: Bytes },
}

#[derive(Debug, Error)]
#[error("malformed payload for message type {kind}: {source}")]
pub struct DecodePayloadError {
    pub kind: u16,
    #[source]
    pub source: prost::DecodeError,
}

impl ControlPacket {
    pub fn kind(&self) -> u16 {
        match self {
            ControlPacket::Version(_) => kind::VERSION,
            ControlPacket::UdpTunnel(_) => kind::UDP_TUNNEL,
            ControlPacket::Authenticate(_) => kind::AUTHENTICATE,
            ControlPacket::Ping(_) => kind::PING,
            ControlPacket::Reject(_) => kind::REJECT,
            ControlPacket::ServerSync(_) => kind::SERVER_SYNC,
            ControlPacket::ChannelRemove(_) => kind::CHANNEL_REMOVE,
            ControlPacket::ChannelState(_) => kind::CHANNEL_STATE,
            ControlPacket::UserRemove(_) => kind::USER_REMOVE,
            ControlPacket::UserState(_) => kind::USER_STATE,
            ControlPacket::TextMessage(_) => kind::TEXT_MESSAGE,
            ControlPacket::CryptSetup(_) => kind::CRYPT_SETUP,
            ControlPacket::VoiceTarget(_) => kind::VOICE_TARGET,
            ControlPacket::CodecVersion(_) => kind::CODEC_VERSION,
            ControlPacket::ServerConfig(_) => kind::SERVER_CONFIG,
            ControlPacket::Other { kind, .. } => *kind,
        }
    }

    fn encode_payload(&self, dst: &mut BytesMut) {
        // Encoding into a BytesMut only fails on insufficient capacity, and
        // BytesMut grows on demand.
        let _ = match self {
            ControlPacket::Version(m) => m.encode(dst),
            ControlPacket::UdpTunnel(b) => {
                dst.put_slice(b);
                Ok(())
            }
            ControlPacket::Authenticate(m) => m.encode(dst),
            ControlPacket::Ping(m) => m.encode(dst),
            ControlPacket::Reject(m) => m.encode(dst),
            ControlPacket::ServerSync(m) => m.encode(dst),
            ControlPacket::ChannelRemove(m) => m.encode(dst),
            ControlPacket::ChannelState(m) => m.encode(dst),
            ControlPacket::UserRemove(m) => m.encode(dst),
            ControlPacket::UserState(m) => m.encode(dst),
            ControlPacket::TextMessage(m) => m.encode(dst),
            ControlPacket::CryptSetup(m) => m.encode(dst),
            ControlPacket::VoiceTarget(m) => m.encode(dst),
            ControlPacket::CodecVersion(m) => m.encode(dst),
            ControlPacket::ServerConfig(m) => m.encode(dst),
            ControlPacket::Other { payload, .. } => {
                dst.put_slice(payload);
                Ok(())
            }
        };
    }

    fn encoded_len(&self) -> usize {
        match self {
            ControlPacket::Version(m) => m.encoded_len(),
            ControlPacket::UdpTunnel(b) => b.len(),
            ControlPacket::Authenticate(m) => m.encoded_len(),
            ControlPacket::Ping(m) => m.encoded_len(),
            ControlPacket::Reject(m) => m.encoded_len(),
            ControlPacket::ServerSync(m) => m.encoded_len(),
            ControlPacket::ChannelRemove(m) => m.encoded_len(),
            ControlPacket::ChannelState(m) => m.encoded_len(),
            ControlPacket::UserRemove(m) => m.encoded_len(),
            ControlPacket::UserState(m) => m.encoded_len(),
            ControlPacket::TextMessage(m) => m.encoded_len(),
            ControlPacket::CryptSetup(m) => m.encoded_len(),
            ControlPacket::VoiceTarget(m) => m.encoded_len(),
            ControlPacket::CodecVersion(m) => m.encoded_len(),
            ControlPacket::ServerConfig(m) => m.encoded_len(),
            ControlPacket::Other { payload, .. } => payload.len(),
        }
    }
}

impl TryFrom<RawPacket> for ControlPacket {
    type Error = DecodePayloadError;

    fn try_from(raw: RawPacket) -> Result<Self, Self::Error> {
        let RawPacket { kind, payload } = raw;
        let err = |source| DecodePayloadError { kind, source };

        let packet = match kind {
            kind::VERSION => ControlPacket::Version(msgs::Version::decode(payload).map_err(err)?),
            kind::UDP_TUNNEL => ControlPacket::UdpTunnel(payload),
            kind::AUTHENTICATE => {
                ControlPacket::Authenticate(msgs::Authenticate::decode(payload).map_err(err)?)
            }
            kind::PING => ControlPacket::Ping(msgs::Ping::decode(payload).map_err(err)?),
            kind::REJECT => ControlPacket::Reject(msgs::Reject::decode(payload).map_err(err)?),
            kind::SERVER_SYNC => {
                ControlPacket::ServerSync(msgs::ServerSync::decode(payload).map_err(err)?)
            }
            kind::CHANNEL_REMOVE => {
                ControlPacket::ChannelRemove(msgs::ChannelRemove::decode(payload).map_err(err)?)
            }
            kind::CHANNEL_STATE => {
                ControlPacket::ChannelState(msgs::ChannelState::decode(payload).map_err(err)?)
            }
            kind::USER_REMOVE => {
                ControlPacket::UserRemove(msgs::UserRemove::decode(payload).map_err(err)?)
            }
            kind::USER_STATE => {
                ControlPacket::UserState(msgs::UserState::decode(payload).map_err(err)?)
            }
            kind::TEXT_MESSAGE => {
                ControlPacket::TextMessage(msgs::TextMessage::decode(payload).map_err(err)?)
            }
            kind::CRYPT_SETUP => {
                ControlPacket::CryptSetup(msgs::CryptSetup::decode(payload).map_err(err)?)
            }
            kind::VOICE_TARGET => {
                ControlPacket::VoiceTarget(msgs::VoiceTarget::decode(payload).map_err(err)?)
            }
            kind::CODEC_VERSION => {
                ControlPacket::CodecVersion(msgs::CodecVersion::decode(payload).map_err(err)?)
            }
            kind::SERVER_CONFIG => {
                ControlPacket::ServerConfig(msgs::ServerConfig::decode(payload).map_err(err)?)
            }
            kind => ControlPacket::Other { kind, payload },
        };

        Ok(packet)
    }
}

macro_rules! packet_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<msgs::$variant> for ControlPacket {
                fn from(msg: msgs::$variant) -> Self {
                    ControlPacket::$variant(msg)
                }
            }
        )*
    };
}

packet_from!(
    Version,
    Authenticate,
    Ping,
    Reject,
    ServerSync,
    ChannelRemove,
    ChannelState,
    UserRemove,
    UserState,
    TextMessage,
    CryptSetup,
    VoiceTarget,
    CodecVersion,
    ServerConfig,
);

/// Frames the TCP control channel: 2-byte big-endian type tag, 4-byte big-endian
/// payload length, payload.
///
/// Decoding stops at the frame boundary; payloads are decoded separately with
/// [`ControlPacket::try_from`] so a single malformed message doesn't poison the
/// stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct ControlCodec;

impl ControlCodec {
    pub fn new() -> Self {
        ControlCodec
    }
}

impl Decoder for ControlCodec {
    type Item = RawPacket;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = u16::from_be_bytes([src[0], src[1]]);
        let len = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;

        if len > MAX_PAYLOAD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("control frame of type {} too large ({} bytes)", kind, len),
            ));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();

        Ok(Some(RawPacket { kind, payload }))
    }
}

impl Encoder<ControlPacket> for ControlCodec {
    type Error = io::Error;

    fn encode(&mut self, item: ControlPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.encoded_len();

        if len > MAX_PAYLOAD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("control frame of type {} too large ({} bytes)", item.kind(), len),
            ));
        }

        dst.reserve(HEADER_LEN + len);
        dst.put_u16(item.kind());
        dst.put_u32(len as u32);
        item.encode_payload(dst);

        Ok(())
    }
}
