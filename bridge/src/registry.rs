use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;

use crate::queue::FrameQueue;

#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ParticipantId {
    /// An in-game user, by upstream session id.
    Upstream(u32),
    Dispatcher(String),
}

impl ParticipantId {
    pub fn is_dispatcher(&self) -> bool {
        matches!(self, ParticipantId::Dispatcher(_))
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantId::Upstream(session) => write!(f, "upstream:{}", session),
            ParticipantId::Dispatcher(id) => write!(f, "dispatcher:{}", id),
        }
    }
}

/// One Opus frame on its way to the members of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub sender: ParticipantId,
    pub channel: u32,
    pub frame_number: u64,
    pub payload: Bytes,
    pub terminator: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub name: String,
    pub talking: bool,
    pub joined_at: DateTime<Utc>,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub id: u32,
    pub name: Option<String>,
    pub participants: usize,
    pub stale: bool,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct JoinOutcome {
    pub previous: Option<u32>,
    /// The previous channel lost its last dispatcher.
    pub vacated: Option<u32>,
    /// The joined channel gained its first dispatcher.
    pub opened: bool,
    pub already_member: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LeaveOutcome {
    pub channel: u32,
    pub vacated: bool,
}

struct Channel {
    name: Option<String>,
    members: BTreeSet<ParticipantId>,
    /// Announced by the server, as opposed to created by a dispatcher join.
    upstream: bool,
    stale: bool,
}

struct Participant {
    name: String,
    talking: bool,
    joined_at: DateTime<Utc>,
    channel: u32,
    stale: bool,
    sink: Option<Arc<FrameQueue>>,
}

#[derive(Default)]
struct Tables {
    channels: BTreeMap<u32, Channel>,
    participants: HashMap<ParticipantId, Participant>,
}

/// Process-wide table of channels and their occupants. Every operation runs
/// under one lock, so membership changes and audio routing never interleave.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<Tables>>,
}

impl Channel {
    fn implicit() -> Self {
        Channel {
            name: None,
            members: BTreeSet::new(),
            upstream: false,
            stale: false,
        }
    }

    fn dispatchers(&self) -> usize {
        self.members.iter().filter(|m| m.is_dispatcher()).count()
    }
}

impl Tables {
    /// Removes `id` from its channel, dropping the channel if it was only
    /// created implicitly and is now empty.
    fn detach(&mut self, id: &ParticipantId, channel: u32) -> bool {
        let mut vacated = false;

        if let Some(ch) = self.channels.get_mut(&channel) {
            ch.members.remove(id);
            vacated = id.is_dispatcher() && ch.dispatchers() == 0;

            if !ch.upstream && ch.members.is_empty() {
                self.channels.remove(&channel);
            }
        }

        vacated
    }
}

impl Registry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Puts `id` into `channel`, leaving its previous channel first. Joining
    /// the channel one is already in only refreshes the name and sink.
    pub fn join(
        &self,
        id: ParticipantId,
        name: &str,
        channel: u32,
        sink: Option<Arc<FrameQueue>>,
    ) -> JoinOutcome {
        let mut t = self.inner.lock();
        let mut outcome = JoinOutcome::default();

        if let Some(p) = t.participants.get_mut(&id) {
            p.name = name.to_string();
            p.stale = false;
            if sink.is_some() {
                p.sink = sink.clone();
            }

            if p.channel == channel {
                outcome.already_member = true;
                return outcome;
            }

            let previous = p.channel;
            outcome.previous = Some(previous);
            if t.detach(&id, previous) {
                outcome.vacated = Some(previous);
            }
        }

        let ch = t.channels.entry(channel).or_insert_with(Channel::implicit);
        outcome.opened = id.is_dispatcher() && ch.dispatchers() == 0;
        ch.members.insert(id.clone());

        match t.participants.get_mut(&id) {
            Some(p) => {
                p.channel = channel;
                p.talking = false;
                p.joined_at = Utc::now();
            }
            None => {
                t.participants.insert(
                    id.clone(),
                    Participant {
                        name: name.to_string(),
                        talking: false,
                        joined_at: Utc::now(),
                        channel,
                        stale: false,
                        sink,
                    },
                );
            }
        }

        debug!("{} joined channel {}", id, channel);
        outcome
    }

    pub fn leave(&self, id: &ParticipantId) -> Option<LeaveOutcome> {
        let mut t = self.inner.lock();
        let p = t.participants.remove(id)?;
        let vacated = t.detach(id, p.channel);

        debug!("{} left channel {}", id, p.channel);
        Some(LeaveOutcome {
            channel: p.channel,
            vacated,
        })
    }

    /// Hands `frame` to every member of its channel that has a playback
    /// queue, except the sender. Never blocks on a slow consumer. Returns the
    /// number of queues the frame went to.
    pub fn route_audio(&self, frame: Frame) -> usize {
        let mut t = self.inner.lock();

        if let Some(p) = t.participants.get_mut(&frame.sender) {
            p.talking = !frame.terminator;
        }

        let t = &*t;
        let ch = match t.channels.get(&frame.channel) {
            Some(ch) => ch,
            None => return 0,
        };

        let mut delivered = 0;

        for member in ch.members.iter().filter(|&m| *m != frame.sender) {
            let sink = match t.participants.get(member).and_then(|p| p.sink.as_ref()) {
                Some(sink) => sink,
                None => continue,
            };

            if !sink.push(frame.clone()) {
                debug!("Playback queue of {} full, dropped oldest frame", member);
            }
            delivered += 1;
        }

        delivered
    }

    pub fn channel_of(&self, id: &ParticipantId) -> Option<u32> {
        self.inner.lock().participants.get(id).map(|p| p.channel)
    }

    /// `None` if the channel doesn't exist.
    pub fn list_participants(&self, channel: u32) -> Option<Vec<ParticipantInfo>> {
        let t = self.inner.lock();
        let ch = t.channels.get(&channel)?;

        let list = ch
            .members
            .iter()
            .filter_map(|id| {
                let p = t.participants.get(id)?;
                Some(ParticipantInfo {
                    id: id.clone(),
                    name: p.name.clone(),
                    talking: p.talking,
                    joined_at: p.joined_at,
                    stale: p.stale,
                })
            })
            .collect();

        Some(list)
    }

    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        self.inner
            .lock()
            .channels
            .iter()
            .map(|(&id, ch)| ChannelInfo {
                id,
                name: ch.name.clone(),
                participants: ch.members.len(),
                stale: ch.stale,
            })
            .collect()
    }

    /// Records a channel announced by the server.
    pub fn upsert_channel(&self, id: u32, name: &str) {
        let mut t = self.inner.lock();
        let ch = t.channels.entry(id).or_insert_with(Channel::implicit);
        ch.name = Some(name.to_string());
        ch.upstream = true;
        ch.stale = false;
    }

    /// The server removed a channel. Its in-game occupants go with it; if
    /// dispatchers are still inside, the channel stays as a dispatcher-only
    /// channel.
    pub fn remove_channel(&self, id: u32) {
        let mut t = self.inner.lock();
        let t = &mut *t;

        let ch = match t.channels.get_mut(&id) {
            Some(ch) => ch,
            None => return,
        };

        let upstream: Vec<_> = ch
            .members
            .iter()
            .filter(|m| !m.is_dispatcher())
            .cloned()
            .collect();

        for member in &upstream {
            ch.members.remove(member);
            t.participants.remove(member);
        }

        if ch.members.is_empty() {
            t.channels.remove(&id);
        } else {
            ch.upstream = false;
            ch.stale = false;
        }
    }

    /// Flags everything the upstream session reported as stale. Stale
    /// entries are kept until [`Registry::purge_stale`] or until the next
    /// session reports them again.
    pub fn mark_stale(&self) {
        let mut t = self.inner.lock();

        for (id, p) in t.participants.iter_mut() {
            if !id.is_dispatcher() {
                p.stale = true;
            }
        }

        for ch in t.channels.values_mut() {
            if ch.upstream {
                ch.stale = true;
            }
        }
    }

    /// Drops every entry still flagged stale.
    pub fn purge_stale(&self) {
        let mut t = self.inner.lock();
        let t = &mut *t;

        let stale: Vec<_> = t
            .participants
            .iter()
            .filter(|(_, p)| p.stale)
            .map(|(id, p)| (id.clone(), p.channel))
            .collect();

        for (id, channel) in stale {
            t.participants.remove(&id);
            if let Some(ch) = t.channels.get_mut(&channel) {
                ch.members.remove(&id);
            }
        }

        t.channels.retain(|_, ch| {
            if !ch.stale {
                return true;
            }

            ch.stale = false;
            ch.upstream = false;
            !ch.members.is_empty()
        });
    }
}
