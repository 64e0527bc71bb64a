//! Bridges browser dispatchers speaking WebRTC into channels of a Mumble
//! voice server.

pub mod bridge;
pub mod config;
pub mod queue;
pub mod registry;
pub mod router;
pub mod signaling;
