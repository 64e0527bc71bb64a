use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

pub use crate::proto::udp::audio::Header as AudioHeader;
pub use crate::proto::udp::{Audio, Ping};

const TYPE_AUDIO: u8 = 0;
const TYPE_PING: u8 = 1;

/// Audio contexts the server puts in [`AudioHeader::Context`].
pub mod context {
    pub const NORMAL: u32 = 0;
    pub const SHOUT: u32 = 1;
    pub const WHISPER: u32 = 2;
    pub const LISTEN: u32 = 3;
}

/// A MumbleUDP datagram. The same bytes travel over real UDP (after
/// encryption) or inside a TCP `UDPTunnel` frame.
#[derive(Debug, Clone, PartialEq)]
pub enum VoicePacket {
    Audio(Audio),
    Ping(Ping),
}

#[derive(Debug, Error)]
pub enum VoiceDecodeError {
    #[error("empty voice datagram")]
    Empty,
    #[error("unknown voice datagram type {0}")]
    UnknownType(u8),
    #[error("malformed voice datagram: {0}")]
    Malformed(#[from] prost::DecodeError),
}

impl VoicePacket {
    pub fn decode(mut buf: Bytes) -> Result<Self, VoiceDecodeError> {
        if buf.is_empty() {
            return Err(VoiceDecodeError::Empty);
        }

        match buf.get_u8() {
            TYPE_AUDIO => Ok(VoicePacket::Audio(Audio::decode(buf)?)),
            TYPE_PING => Ok(VoicePacket::Ping(Ping::decode(buf)?)),
            other => Err(VoiceDecodeError::UnknownType(other)),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.encoded_len());

        match self {
            VoicePacket::Audio(a) => {
                buf.put_u8(TYPE_AUDIO);
                let _ = a.encode(&mut buf);
            }
            VoicePacket::Ping(p) => {
                buf.put_u8(TYPE_PING);
                let _ = p.encode(&mut buf);
            }
        }

        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        match self {
            VoicePacket::Audio(a) => a.encoded_len(),
            VoicePacket::Ping(p) => p.encoded_len(),
        }
    }
}

impl Audio {
    pub fn position(&self) -> Option<[f32; 3]> {
        match self.positional_data[..] {
            [x, y, z] => Some([x, y, z]),
            _ => None,
        }
    }

    pub fn target(&self) -> Option<u32> {
        match self.header {
            Some(AudioHeader::Target(t)) => Some(t),
            _ => None,
        }
    }

    pub fn context(&self) -> Option<u32> {
        match self.header {
            Some(AudioHeader::Context(c)) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn audio_round_trip_with_position() {
        let audio = Audio {
            header: Some(AudioHeader::Context(context::LISTEN)),
            sender_session: 42,
            frame_number: u64::MAX - 7,
            opus_data: Bytes::from_static(&[0xfc, 0x01, 0x02, 0x03]),
            positional_data: vec![1.5, -2.25, 1024.0],
            volume_adjustment: 0.5,
            is_terminator: true,
        };

        let packet = VoicePacket::Audio(audio.clone());
        let decoded = VoicePacket::decode(packet.encode()).unwrap();

        assert_eq!(decoded, packet);
        match decoded {
            VoicePacket::Audio(a) => {
                assert_eq!(a.position(), Some([1.5, -2.25, 1024.0]));
                assert_eq!(a.context(), Some(context::LISTEN));
                assert_eq!(a.target(), None);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn audio_wire_types() {
        let audio = Audio {
            header: Some(AudioHeader::Target(2)),
            frame_number: 1,
            positional_data: vec![0.0, 0.0, 0.0],
            volume_adjustment: 1.0,
            is_terminator: true,
            ..Default::default()
        };

        let bytes = VoicePacket::Audio(audio).encode();

        assert_eq!(bytes[0], 0);
        // target: field 1 varint
        assert_eq!(&bytes[1..3], &[0x08, 0x02]);
        // frame_number: field 4 varint
        assert_eq!(&bytes[3..5], &[0x20, 0x01]);
        // positional_data: field 6 packed, 3 * fixed32
        assert_eq!(&bytes[5..7], &[0x32, 12]);
        // volume_adjustment: field 7 fixed32
        assert_eq!(bytes[19], 0x3d);
        assert_eq!(&bytes[20..24], &1.0f32.to_le_bytes());
        // is_terminator: field 16 varint, two-byte key
        assert_eq!(&bytes[24..], &[0x80, 0x01, 0x01]);
    }

    #[test]
    fn ping_round_trip() {
        let ping = VoicePacket::Ping(Ping {
            timestamp: 1_700_000_000_123,
            request_extended_information: true,
            ..Default::default()
        });

        let bytes = ping.encode();
        assert_eq!(bytes[0], 1);
        assert_eq!(VoicePacket::decode(bytes).unwrap(), ping);
    }

    #[test]
    fn rejects_unknown_type() {
        let err = VoicePacket::decode(Bytes::from_static(&[0x20, 0x00])).unwrap_err();
        assert!(matches!(err, VoiceDecodeError::UnknownType(0x20)));
        assert!(matches!(
            VoicePacket::decode(Bytes::new()).unwrap_err(),
            VoiceDecodeError::Empty
        ));
    }
}
