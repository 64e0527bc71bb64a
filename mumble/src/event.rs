use bytes::Bytes;

use crate::session::ConnectionState;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StateChanged(ConnectionState),
    /// The server finished sending its initial state. `session` is our own
    /// session id, which must never be listed as a participant.
    Synced { session: u32 },
    ChannelUpdated { channel: u32, name: String },
    ChannelRemoved { channel: u32 },
    UserUpdated(UserUpdated),
    UserRemoved { session: u32 },
    Audio(AudioFrame),
    /// Reconnect attempts are exhausted; the upstream task is about to exit.
    Outage,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UserUpdated {
    pub session: u32,
    pub name: String,
    pub channel: u32,
    pub old_channel: Option<u32>,
}

/// One voice frame received from the server, attributed to the channel its
/// sender currently sits in.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub sender: u32,
    pub channel: u32,
    pub frame_number: u64,
    pub payload: Bytes,
    pub position: Option<[f32; 3]>,
    pub terminator: bool,
}
