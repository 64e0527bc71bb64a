use std::collections::HashMap;

use crate::event::{Event, UserUpdated};
use crate::proto::msgs;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Channel {
    id: u32,
    name: String,
    parent: Option<u32>,
    description: String,
    max_users: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct User {
    session: u32,
    name: String,
    registered_id: Option<u32>,
    channel: u32,
}

/// Mirror of the channel tree and user list the server has announced on the
/// current connection.
#[derive(Debug, Default)]
pub struct ServerState {
    channels: HashMap<u32, Channel>,
    users: HashMap<u32, User>,
    own_session: Option<u32>,
    max_bandwidth: Option<u32>,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn parent(&self) -> Option<u32> {
        self.parent
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn max_users(&self) -> Option<u32> {
        if self.max_users != 0 {
            Some(self.max_users)
        } else {
            None
        }
    }
}

impl User {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> u32 {
        self.session
    }

    pub fn registered_id(&self) -> Option<u32> {
        self.registered_id
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }
}

impl ServerState {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn user(&self, session: u32) -> Option<&User> {
        self.users.get(&session)
    }

    pub fn channel(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn own_session(&self) -> Option<u32> {
        self.own_session
    }

    pub fn set_own_session(&mut self, session: u32) {
        self.own_session = Some(session);
    }

    /// The channel our own user sits in, once the server told us who we are.
    pub fn own_channel(&self) -> Option<u32> {
        self.own_session
            .and_then(|s| self.users.get(&s))
            .map(|u| u.channel)
    }

    pub fn max_bandwidth(&self) -> Option<u32> {
        self.max_bandwidth
    }

    /// Applies a `UserState` delta. Returns an event when the user is new or
    /// its name or channel changed, unless it is our own user.
    pub fn update_user(&mut self, state: msgs::UserState) -> Option<Event> {
        let session = state.session?;
        let mut fresh = false;

        let user = self.users.entry(session).or_insert_with(|| {
            fresh = true;
            User {
                session,
                name: String::new(),
                registered_id: None,
                channel: 0,
            }
        });

        let old_channel = user.channel;
        let mut changed = fresh;

        if let Some(name) = state.name {
            changed |= user.name != name;
            user.name = name;
        }

        if let Some(id) = state.user_id {
            user.registered_id = Some(id);
        }

        if let Some(channel) = state.channel_id {
            changed |= user.channel != channel;
            user.channel = channel;
        }

        if !changed || Some(session) == self.own_session {
            return None;
        }

        Some(Event::UserUpdated(UserUpdated {
            session,
            name: user.name.clone(),
            channel: user.channel,
            old_channel: Some(old_channel).filter(|&c| !fresh && c != user.channel),
        }))
    }

    pub fn remove_user(&mut self, session: u32) -> Option<Event> {
        self.users.remove(&session)?;

        if Some(session) == self.own_session {
            return None;
        }

        Some(Event::UserRemoved { session })
    }

    pub fn update_channel(&mut self, state: msgs::ChannelState) -> Option<Event> {
        let id = state.channel_id?;
        let mut changed = false;

        let channel = self.channels.entry(id).or_insert_with(|| {
            changed = true;
            Channel {
                id,
                name: String::new(),
                parent: None,
                description: String::new(),
                max_users: 0,
            }
        });

        if let Some(name) = state.name {
            changed |= channel.name != name;
            channel.name = name;
        }

        if let Some(parent) = state.parent {
            channel.parent = Some(parent);
        }

        if let Some(description) = state.description {
            channel.description = description;
        }

        if let Some(max_users) = state.max_users {
            channel.max_users = max_users;
        }

        if !changed {
            return None;
        }

        Some(Event::ChannelUpdated {
            channel: id,
            name: channel.name.clone(),
        })
    }

    pub fn remove_channel(&mut self, id: u32) -> Option<Event> {
        self.channels.remove(&id)?;
        Some(Event::ChannelRemoved { channel: id })
    }

    pub fn update_server_config(&mut self, config: &msgs::ServerConfig) {
        if config.max_bandwidth.is_some() {
            self.max_bandwidth = config.max_bandwidth;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn user(session: u32, name: Option<&str>, channel: Option<u32>) -> msgs::UserState {
        msgs::UserState {
            session: Some(session),
            name: name.map(str::to_string),
            channel_id: channel,
            ..Default::default()
        }
    }

    #[test]
    fn user_moves_report_old_channel() {
        let mut st = ServerState::new();

        let ev = st.update_user(user(5, Some("alice"), Some(2)));
        assert_eq!(
            ev,
            Some(Event::UserUpdated(UserUpdated {
                session: 5,
                name: "alice".to_string(),
                channel: 2,
                old_channel: None,
            }))
        );

        assert_eq!(st.update_user(user(5, None, Some(2))), None);

        let ev = st.update_user(user(5, None, Some(3)));
        assert!(matches!(
            ev,
            Some(Event::UserUpdated(UserUpdated { channel: 3, old_channel: Some(2), .. }))
        ));
    }

    #[test]
    fn own_user_is_tracked_but_not_reported() {
        let mut st = ServerState::new();
        st.set_own_session(9);

        assert_eq!(st.update_user(user(9, Some("bridge"), Some(4))), None);
        assert_eq!(st.own_channel(), Some(4));
        assert_eq!(st.remove_user(9), None);
        assert_eq!(st.own_channel(), None);
    }

    #[test]
    fn channel_updates_only_on_change() {
        let mut st = ServerState::new();
        let state = msgs::ChannelState {
            channel_id: Some(3),
            name: Some("Dispatch".to_string()),
            parent: Some(0),
            ..Default::default()
        };

        assert!(st.update_channel(state.clone()).is_some());
        assert!(st.update_channel(state).is_none());
        assert_eq!(st.channel(3).map(|c| c.name()), Some("Dispatch"));
        assert_eq!(st.remove_channel(3), Some(Event::ChannelRemoved { channel: 3 }));
        assert_eq!(st.remove_channel(3), None);
    }
}
