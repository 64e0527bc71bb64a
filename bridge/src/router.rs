use log::{debug, error, info};
use mumble::{ConnectionState, Event};
use tokio::sync::mpsc;

use crate::registry::{Frame, ParticipantId, Registry};

/// Feeds the upstream session's events into the registry until the session
/// task is gone.
pub async fn route_upstream(mut events: mpsc::UnboundedReceiver<Event>, registry: Registry) {
    while let Some(event) = events.recv().await {
        apply(&registry, event);
    }

    debug!("upstream event stream ended");
}

pub fn apply(registry: &Registry, event: Event) {
    match event {
        Event::StateChanged(state @ (ConnectionState::Degraded | ConnectionState::Disconnected)) => {
            debug!("Upstream {:?}, marking upstream entries stale", state);
            registry.mark_stale();
        }
        Event::StateChanged(_) => {}
        Event::Synced { session } => {
            // the server listed our own user before telling us who we are
            registry.leave(&ParticipantId::Upstream(session));
            registry.purge_stale();
            info!("Registry in sync with upstream, {} channels", registry.list_channels().len());
        }
        Event::ChannelUpdated { channel, name } => registry.upsert_channel(channel, &name),
        Event::ChannelRemoved { channel } => registry.remove_channel(channel),
        Event::UserUpdated(user) => {
            registry.join(ParticipantId::Upstream(user.session), &user.name, user.channel, None);
        }
        Event::UserRemoved { session } => {
            registry.leave(&ParticipantId::Upstream(session));
        }
        Event::Audio(frame) => {
            registry.route_audio(Frame {
                sender: ParticipantId::Upstream(frame.sender),
                channel: frame.channel,
                frame_number: frame.frame_number,
                payload: frame.payload,
                terminator: frame.terminator,
            });
        }
        Event::Outage => {
            error!("Voice server unreachable, dropping its channels and users");
            registry.purge_stale();
        }
    }
}
