//! Chat operations built on correlated commands.
//!
//! Every socket command here follows one shape: stamp a fresh correlation
//! token into the frame, send it on the endpoint's channel and wait for the
//! reply the predicate selects. A `neo_error` frame carrying the same token
//! ends the wait too and surfaces as [`SessionError::Remote`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::channel::{room_channel, subscribe_frame, unsubscribe_frame, Endpoint};
use crate::correlation::{CorrelatedRequest, CorrelationToken};
use crate::error::{Result, SessionError};
use crate::http::RequestOptions;
use crate::manager::SessionManager;

/// Origin stamped on every chat command.
pub const ORIGIN_ID: &str = "web-next";

const ONE_ON_ONE: &str = "TYPE_ONE_ON_ONE";

const ANNOTATIONS: [&str; 11] = [
    "boring",
    "inaccurate",
    "repetitive",
    "out_of_character",
    "bad_memory",
    "long",
    "short",
    "ends_chat_early",
    "funny",
    "interesting",
    "helpful",
];

/// One page of chat history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnPage {
    /// Turns, newest first as the service returns them.
    #[serde(default)]
    pub turns: Vec<Value>,
    /// Paging metadata.
    #[serde(default)]
    pub meta: PageMeta,
}

/// Paging metadata of a [`TurnPage`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    /// Token for the next (older) page, if any.
    #[serde(default)]
    pub next_token: Option<String>,
}

impl SessionManager {
    /// Start a one-on-one chat with `character_id`.
    ///
    /// Resolves with the `add_turn` frame carrying the greeting.
    pub async fn create_conversation(&self, character_id: &str) -> Result<Value> {
        if character_id.is_empty() {
            return Err(SessionError::InvalidArgument("character id"));
        }
        let session = self.current_user()?;
        let channel = self.ensure_connected(Endpoint::Primary).await?;

        let token = CorrelationToken::generate();
        let frame = json!({
            "command": "create_chat",
            "request_id": token.as_str(),
            "payload": {
                "chat": {
                    "character_id": character_id,
                    "creator_id": session.identity.user_id,
                    "chat_id": token.as_str(),
                    "type": ONE_ON_ONE,
                    "visibility": "VISIBILITY_PRIVATE",
                },
                "chat_type": ONE_ON_ONE,
                "with_greeting": true,
            },
            "origin_id": ORIGIN_ID,
        });

        let request = CorrelatedRequest::new(token.clone(), frame, reply_to(&token, "add_turn", |_| true))
            .with_timeout(self.config.request_timeout());
        let reply = self.engine.send_and_await(&channel, request).await?;
        command_result(reply)
    }

    /// Post `text` to `chat_id` and wait for the character's final reply.
    ///
    /// Resolves with the `update_turn` frame whose first candidate is final.
    pub async fn send_message(&self, text: &str, character_id: &str, chat_id: &str) -> Result<Value> {
        if text.is_empty() {
            return Err(SessionError::InvalidArgument("message"));
        }
        if chat_id.is_empty() {
            return Err(SessionError::InvalidArgument("chat id"));
        }
        if character_id.is_empty() {
            return Err(SessionError::InvalidArgument("character id"));
        }
        let session = self.current_user()?;
        let channel = self.ensure_connected(Endpoint::Primary).await?;

        let token = CorrelationToken::generate();
        let identity = &session.identity;
        let frame = json!({
            "command": "create_and_generate_turn",
            "request_id": token.as_str(),
            "payload": {
                "chat_type": ONE_ON_ONE,
                "num_candidates": 1,
                "tts_enabled": false,
                "selected_language": "",
                "character_id": character_id,
                "user_name": identity.display_name,
                "turn": {
                    "turn_key": { "turn_id": token.as_str(), "chat_id": chat_id },
                    "author": {
                        "author_id": identity.user_id,
                        "is_human": true,
                        "name": identity.display_name,
                    },
                    "candidates": [{ "candidate_id": token.as_str(), "raw_content": text }],
                    "primary_candidate_id": token.as_str(),
                },
                "previous_annotations": empty_annotations(),
                "generate_comparison": false,
            },
            "origin_id": ORIGIN_ID,
        });

        let request = CorrelatedRequest::new(token.clone(), frame, reply_to(&token, "update_turn", is_final))
            .with_timeout(self.config.request_timeout());
        let reply = self.engine.send_and_await(&channel, request).await?;
        command_result(reply)
    }

    /// Fetch one page of history for `chat_id` over HTTP.
    pub async fn get_messages(&self, chat_id: &str, next_token: Option<&str>) -> Result<TurnPage> {
        if chat_id.is_empty() {
            return Err(SessionError::InvalidArgument("chat id"));
        }
        let neo = self.config.neo_base_url.trim_end_matches('/');
        let mut url = reqwest::Url::parse(&format!("{neo}/turns/{chat_id}/"))
            .map_err(|e| SessionError::Http(format!("invalid history url: {e}")))?;
        if let Some(token) = next_token {
            url.query_pairs_mut().append_pair("next_token", token);
        }

        let response = self
            .http
            .request(url.as_str(), RequestOptions::authorized_get())
            .await?;
        if !response.is_success() {
            return Err(SessionError::Http(format!(
                "history request failed with status {}",
                response.status
            )));
        }
        response.json()
    }

    /// Subscribe to a group room's channel.
    pub async fn join_room(&self, room_id: &str) -> Result<Value> {
        self.room_command(room_id, true).await
    }

    /// Unsubscribe from a group room's channel.
    pub async fn leave_room(&self, room_id: &str) -> Result<Value> {
        self.room_command(room_id, false).await
    }

    async fn room_command(&self, room_id: &str, join: bool) -> Result<Value> {
        if room_id.is_empty() {
            return Err(SessionError::InvalidArgument("room id"));
        }
        let channel = self.ensure_connected(Endpoint::Group).await?;

        let id = channel.next_command_id();
        let room = room_channel(room_id);
        let frame = if join {
            subscribe_frame(&room, id)
        } else {
            unsubscribe_frame(&room, id)
        };
        log::debug!("[Chat] {} {} (id {})", if join { "Joining" } else { "Leaving" }, room, id);

        let token = CorrelationToken::new(format!("{}#{}", Endpoint::Group, id));
        let request = CorrelatedRequest::new(token, frame, move |v| v["id"] == id)
            .with_timeout(self.config.request_timeout());
        let reply = self.engine.send_and_await(&channel, request).await?;
        command_result(reply)
    }
}

/// Predicate for replies to a `request_id`-carrying command.
fn reply_to(
    token: &CorrelationToken,
    command: &'static str,
    done: fn(&Value) -> bool,
) -> impl Fn(&Value) -> bool + Send + Sync + 'static {
    let token = token.as_str().to_string();
    move |v| {
        v["request_id"] == token.as_str()
            && (v["command"] == "neo_error" || (v["command"] == command && done(v)))
    }
}

fn is_final(reply: &Value) -> bool {
    reply["turn"]["candidates"][0]["is_final"] == true
}

/// Turn error replies into [`SessionError::Remote`].
fn command_result(reply: Value) -> Result<Value> {
    if reply["command"] == "neo_error" {
        return Err(SessionError::Remote {
            code: reply["error_code"].as_i64().unwrap_or_default(),
            comment: reply["comment"].as_str().unwrap_or_default().to_string(),
        });
    }
    if let Some(error) = reply.get("error").filter(|e| e.is_object()) {
        return Err(SessionError::Remote {
            code: error["code"].as_i64().unwrap_or_default(),
            comment: error["message"].as_str().unwrap_or_default().to_string(),
        });
    }
    Ok(reply)
}

fn empty_annotations() -> Value {
    let mut annotations = Map::new();
    for name in ANNOTATIONS {
        annotations.insert(name.to_string(), json!(0));
        annotations.insert(format!("not_{name}"), json!(0));
    }
    Value::Object(annotations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_predicate_requires_final_candidate() {
        let token = CorrelationToken::new("r1");
        let matches = reply_to(&token, "update_turn", is_final);

        let partial = json!({
            "command": "update_turn",
            "request_id": "r1",
            "turn": { "candidates": [{ "is_final": false }] }
        });
        let done = json!({
            "command": "update_turn",
            "request_id": "r1",
            "turn": { "candidates": [{ "is_final": true }] }
        });
        let other = json!({
            "command": "update_turn",
            "request_id": "r2",
            "turn": { "candidates": [{ "is_final": true }] }
        });

        assert!(!matches(&partial));
        assert!(matches(&done));
        assert!(!matches(&other));
    }

    #[test]
    fn test_reply_predicate_accepts_error_for_same_request() {
        let token = CorrelationToken::new("r1");
        let matches = reply_to(&token, "add_turn", |_| true);
        assert!(matches(&json!({ "command": "neo_error", "request_id": "r1" })));
        assert!(!matches(&json!({ "command": "neo_error", "request_id": "r9" })));
    }

    #[test]
    fn test_neo_error_becomes_remote() {
        let err = command_result(json!({
            "command": "neo_error",
            "request_id": "r1",
            "error_code": 429,
            "comment": "slow down"
        }))
        .unwrap_err();
        assert!(matches!(err, SessionError::Remote { code: 429, ref comment } if comment == "slow down"));
    }

    #[test]
    fn test_room_error_becomes_remote() {
        let err = command_result(json!({ "id": 3, "error": { "code": 103, "message": "permission denied" } }))
            .unwrap_err();
        assert!(matches!(err, SessionError::Remote { code: 103, .. }));
    }

    #[test]
    fn test_annotations_cover_both_polarities() {
        let annotations = empty_annotations();
        assert_eq!(annotations.as_object().unwrap().len(), 22);
        assert_eq!(annotations["not_helpful"], 0);
        assert_eq!(annotations["boring"], 0);
    }

    #[test]
    fn test_turn_page_tolerates_missing_meta() {
        let page: TurnPage = serde_json::from_value(json!({ "turns": [{ "a": 1 }] })).unwrap();
        assert_eq!(page.turns.len(), 1);
        assert!(page.meta.next_token.is_none());
    }
}
