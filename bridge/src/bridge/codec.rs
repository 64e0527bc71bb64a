use std::time::Duration;

use bytes::Bytes;

const DEFAULT_FRAME: Duration = Duration::from_millis(20);

/// Converts audio between the codec negotiated with the browser and the one
/// spoken upstream.
pub trait CodecAdapter: Send + Sync {
    /// Browser frame to upstream frame. `None` drops the frame.
    fn to_upstream(&self, frame: Bytes) -> Option<Bytes>;

    /// Upstream frame to browser frame plus its playback duration.
    fn to_browser(&self, frame: Bytes) -> Option<(Bytes, Duration)>;
}

/// Both sides speak 48 kHz Opus, so frames pass through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpusPassthrough;

impl CodecAdapter for OpusPassthrough {
    fn to_upstream(&self, frame: Bytes) -> Option<Bytes> {
        if frame.is_empty() {
            return None;
        }

        Some(frame)
    }

    fn to_browser(&self, frame: Bytes) -> Option<(Bytes, Duration)> {
        let duration = opus_packet_duration(&frame)?;
        Some((frame, duration))
    }
}

/// Playback duration of an Opus packet, read from its TOC byte
/// (RFC 6716, section 3.1). Falls back to 20 ms for truncated code 3
/// packets.
pub fn opus_packet_duration(packet: &[u8]) -> Option<Duration> {
    let toc = *packet.first()?;
    let config = toc >> 3;

    // in units of 0.5 ms
    let frame = match config {
        0..=11 => [20, 40, 80, 120][(config & 3) as usize],
        12..=15 => [20, 40][(config & 1) as usize],
        _ => [5, 10, 20, 40][(config & 3) as usize],
    };

    let frames = match toc & 3 {
        0 => 1,
        1 | 2 => 2,
        _ => match packet.get(1) {
            Some(b) => (b & 0x3f) as u32,
            None => return Some(DEFAULT_FRAME),
        },
    };

    if frames == 0 {
        return Some(DEFAULT_FRAME);
    }

    Some(Duration::from_micros(frame * 500 * frames as u64))
}
