//! Transport channels to the chat service's logical endpoints.
//!
//! Each [`Endpoint`] gets exactly one [`TransportChannel`], which owns the
//! physical socket, answers keep-alives, publishes every other inbound frame
//! to the [`MessageBus`](crate::bus::MessageBus) and reconnects on its own
//! after unexpected closes.
//!
//! # Architecture
//!
//! ```text
//!   TransportChannel ──dial──► Dialer ──► (FrameSink, FrameSource)
//!         │                                    │
//!         │ send(frame)                        │ recv()
//!         ▼                                    ▼
//!     FrameSink                         read loop ──publish──► MessageBus
//!                                              │
//!                                   "{}" ──echo──► FrameSink
//! ```
//!
//! The [`Dialer`] seam is what lets the state machine run against the
//! in-memory `MemoryDialer` in tests (`test-util` feature) and
//! [`crate::ws::WsDialer`] in production.
//!
//! # State machine
//!
//! `Disconnected → Connecting → Open → Disconnected (retry) … → GaveUp`.
//! Retries follow [`ReconnectPolicy`]: fixed delay, hard attempt cap, counter
//! reset only by a successful open.

pub mod handshake;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod retry;
pub mod transport;

use async_trait::async_trait;

use crate::error::Result;
use crate::ws::WsMessage;

pub use handshake::{announce_frame, room_channel, subscribe_frame, unsubscribe_frame, user_channel};
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryDialer, MemoryServer};
pub use retry::ReconnectPolicy;
pub use transport::TransportChannel;

/// The canonical keep-alive sentinel: an empty JSON object.
pub const KEEP_ALIVE: &str = "{}";

/// Logical endpoint served by its own transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// One-on-one chat endpoint.
    Primary,
    /// Group/room messaging endpoint.
    Group,
}

impl Endpoint {
    /// Short lowercase name used in logs and errors.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Group => "group",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options needed to open (and later reopen) a connection.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    credential: String,
    edge_rollout: String,
}

impl ConnectOptions {
    /// Create options from a bare credential and rollout tag.
    #[must_use]
    pub fn new(credential: impl Into<String>, edge_rollout: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
            edge_rollout: edge_rollout.into(),
        }
    }

    /// Authorization credential (without the `Token ` prefix).
    #[must_use]
    pub fn credential(&self) -> &str {
        &self.credential
    }

    /// Edge rollout tag sent in the session cookie.
    #[must_use]
    pub fn edge_rollout(&self) -> &str {
        &self.edge_rollout
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("credential", &"<redacted>")
            .field("edge_rollout", &self.edge_rollout)
            .finish()
    }
}

/// Connection state of a transport channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; a reconnect may be scheduled.
    #[default]
    Disconnected,
    /// Dial or handshake in progress.
    Connecting,
    /// Connected and ready.
    Open,
    /// Reconnect attempts exhausted. Only an explicit `connect` resumes.
    GaveUp,
}

/// Write half of a physical connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a UTF-8 text frame.
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()>;

    /// Send a binary frame.
    async fn send_binary(&mut self, data: Vec<u8>) -> anyhow::Result<()>;

    /// Answer a transport-level ping.
    async fn send_pong(&mut self, data: Vec<u8>) -> anyhow::Result<()>;

    /// Close the connection.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Read half of a physical connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next message, or `None` once the stream has ended.
    async fn recv(&mut self) -> Option<anyhow::Result<WsMessage>>;
}

/// A freshly dialed connection.
pub type Link = (Box<dyn FrameSink>, Box<dyn FrameSource>);

/// Opens physical connections to logical endpoints.
#[async_trait]
pub trait Dialer: Send + Sync + std::fmt::Debug {
    /// Perform the transport-level handshake for `endpoint`.
    async fn dial(&self, endpoint: Endpoint, options: &ConnectOptions) -> anyhow::Result<Link>;
}

/// Anything correlated requests can be written through.
#[async_trait]
pub trait FrameSender: Send + Sync {
    /// Endpoint the frames go to.
    fn endpoint(&self) -> Endpoint;

    /// Write one serialized frame.
    async fn send(&self, frame: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::Primary.to_string(), "primary");
        assert_eq!(Endpoint::Group.to_string(), "group");
    }

    #[test]
    fn test_connect_options_debug_redacts_credential() {
        let options = ConnectOptions::new("super-secret", "60");
        let debug = format!("{options:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("60"));
    }

    #[test]
    fn test_default_state_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
