//! Endpoint subscription frames.
//!
//! Right after a connection opens the channel announces itself and
//! subscribes to the user's private channel. The group endpoint reuses the
//! same subscribe/unsubscribe shape for `room:<id>` channels.

use serde_json::{json, Value};

/// Command id of the announce frame.
pub const ANNOUNCE_ID: u64 = 1;

/// Command id of the user channel subscription.
pub const USER_SUBSCRIBE_ID: u64 = 2;

/// Client name sent in the announce frame.
const CLIENT_NAME: &str = "neolink";

/// Connection-announce frame.
#[must_use]
pub fn announce_frame() -> Value {
    json!({ "connect": { "name": CLIENT_NAME }, "id": ANNOUNCE_ID })
}

/// Subscribe to `channel` under command id `id`.
#[must_use]
pub fn subscribe_frame(channel: &str, id: u64) -> Value {
    json!({ "subscribe": { "channel": channel }, "id": id })
}

/// Unsubscribe from `channel` under command id `id`.
#[must_use]
pub fn unsubscribe_frame(channel: &str, id: u64) -> Value {
    json!({ "unsubscribe": { "channel": channel }, "id": id })
}

/// Private channel name for a user.
#[must_use]
pub fn user_channel(user_id: &str) -> String {
    format!("user#{user_id}")
}

/// Channel name for a group room.
#[must_use]
pub fn room_channel(room_id: &str) -> String {
    format!("room:{room_id}")
}
