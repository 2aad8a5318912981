//! Error taxonomy for the session core.
//!
//! Transport-level failures are handled inside the channel (retry or give
//! up) and only surface here when a caller is directly waiting on them.
//! Disconnects and reconnect exhaustion are state transitions, not errors;
//! see [`crate::channel::ConnectionState`].

use std::time::Duration;

use crate::channel::Endpoint;

/// Errors returned by session, channel and correlation operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// `connect` was called with no options and none were saved earlier.
    #[error("no connection options available for {0} endpoint")]
    Configuration(Endpoint),

    /// A frame was sent while the endpoint had no live connection.
    #[error("{0} endpoint is not connected")]
    NotConnected(Endpoint),

    /// No session has been established yet.
    #[error("not authenticated")]
    NotAuthenticated,

    /// No reply matched within the request deadline.
    #[error("timed out after {after:?} waiting for reply to {token}")]
    Timeout {
        /// Correlation token of the request that expired.
        token: String,
        /// Deadline that elapsed.
        after: Duration,
    },

    /// The correlation token is already held by an outstanding request.
    #[error("correlation token {0} is already outstanding")]
    DuplicateToken(String),

    /// The request was dropped because the session was torn down.
    #[error("request {0} abandoned on shutdown")]
    Abandoned(String),

    /// Dialing or writing to the socket failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The HTTP collaborator failed.
    #[error("http error: {0}")]
    Http(String),

    /// The server rejected the session token.
    #[error("invalid authentication token")]
    InvalidToken,

    /// The server answered a command with an error frame.
    #[error("server error {code}: {comment}")]
    Remote {
        /// Numeric error code from the reply.
        code: i64,
        /// Human-readable comment from the reply.
        comment: String,
    },

    /// A required argument was empty.
    #[error("{0} is required")]
    InvalidArgument(&'static str),

    /// A frame could not be encoded or a reply could not be decoded.
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T, E = SessionError> = std::result::Result<T, E>;
