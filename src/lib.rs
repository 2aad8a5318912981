//! Neolink - session manager for a multiplexed chat WebSocket service.
//!
//! This crate keeps one long-lived connection per logical endpoint, fans
//! every inbound frame out to subscribers, and pairs outgoing commands with
//! their replies.
//!
//! # Architecture
//!
//! - **Transport channel** - owns the socket for one endpoint, answers
//!   keep-alives, reconnects on a fixed-delay policy
//! - **Message bus** - synchronous, ordered broadcast of inbound frames
//! - **Correlation engine** - pending request table with per-request deadline
//! - **Session context** - the authenticated identity, replaced wholesale
//! - **Session manager** - owns all of the above plus the HTTP collaborator
//!
//! # Modules
//!
//! - [`channel`] - Transport channels and the dial seam (plus an in-memory
//!   transport behind the `test-util` feature)
//! - [`bus`] - Message bus and inbound frames
//! - [`correlation`] - Request/reply pairing
//! - [`session`] - Identity and credential
//! - [`manager`] - Session manager
//! - [`auth`] / [`chat`] - Operations on the session manager
//! - [`config`] - Configuration loading/saving

pub mod auth;
pub mod bus;
pub mod channel;
pub mod chat;
pub mod config;
pub mod correlation;
pub mod error;
pub mod http;
pub mod manager;
pub mod session;
pub mod ws;

// Re-export commonly used types
pub use bus::{InboundFrame, MessageBus, SubscriptionId};
pub use channel::{ConnectOptions, ConnectionState, Endpoint, ReconnectPolicy, TransportChannel};
pub use chat::TurnPage;
pub use config::Config;
pub use correlation::{CorrelatedRequest, CorrelationEngine, CorrelationToken};
pub use error::{Result, SessionError};
pub use manager::SessionManager;
pub use session::{Identity, Session, SessionContext};
