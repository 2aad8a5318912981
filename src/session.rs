//! Authenticated identity for the process.
//!
//! A [`Session`] is built by the authentication flow and installed into the
//! [`SessionContext`] wholesale; re-authentication replaces it, nothing
//! patches it in place. Channels read it to build the user-channel
//! subscription and command builders read it to stamp actor fields.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SessionError};

/// Prefix the service puts in front of session tokens.
pub const TOKEN_PREFIX: &str = "Token ";

/// Authorization credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Build a credential from a raw session token, with or without the
    /// `Token ` prefix.
    #[must_use]
    pub fn from_session_token(raw: &str) -> Self {
        let token = raw.trim();
        Self(token.strip_prefix(TOKEN_PREFIX).unwrap_or(token).to_string())
    }

    /// The bare token.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the token is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Who the process is acting as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Numeric user id, rendered as text.
    pub user_id: String,
    /// Display name stamped on outgoing turns.
    pub display_name: String,
}

impl Identity {
    /// Extract the identity from a `/chat/user/` profile response.
    ///
    /// The id may arrive as a number or a string; the display name falls
    /// back from `username` to `name`.
    pub fn from_profile(profile: &Value) -> Result<Self> {
        let user = profile.get("user").unwrap_or(profile);
        let user_id = match user.get("id") {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => return Err(SessionError::Http("user profile has no id".to_string())),
        };
        let display_name = user
            .get("username")
            .and_then(Value::as_str)
            .or_else(|| user.get("name").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            user_id,
            display_name,
        })
    }
}

/// One authenticated session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Acting user.
    pub identity: Identity,
    /// Credential used for HTTP and socket authorization.
    pub credential: Credential,
    /// Raw profile as returned by the service.
    pub profile: Value,
}

/// Holder of the current [`Session`], shared by every component.
#[derive(Debug, Default)]
pub struct SessionContext {
    current: RwLock<Option<Arc<Session>>>,
}

impl SessionContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotAuthenticated`] if no session has been
    /// established.
    pub fn current_user(&self) -> Result<Arc<Session>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SessionError::NotAuthenticated)
    }

    /// Identity of the current session.
    pub fn identity(&self) -> Result<Identity> {
        Ok(self.current_user()?.identity.clone())
    }

    /// Replace the session wholesale.
    pub fn establish(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        log::info!(
            "[Session] Established for user {} ({})",
            session.identity.user_id,
            session.identity.display_name
        );
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&session));
        session
    }

    /// Forget the current session.
    pub fn clear(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Whether a session is established.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session(id: &str, name: &str) -> Session {
        Session {
            identity: Identity {
                user_id: id.to_string(),
                display_name: name.to_string(),
            },
            credential: Credential::from_session_token("tok"),
            profile: Value::Null,
        }
    }

    #[test]
    fn test_current_user_before_auth_fails() {
        let ctx = SessionContext::new();
        assert!(matches!(ctx.current_user(), Err(SessionError::NotAuthenticated)));
        assert!(!ctx.is_authenticated());
    }

    #[test]
    fn test_establish_replaces_whole_session() {
        let ctx = SessionContext::new();
        ctx.establish(session("1", "alice"));
        ctx.establish(session("2", "bob"));

        let current = ctx.current_user().unwrap();
        assert_eq!(current.identity.user_id, "2");
        assert_eq!(current.identity.display_name, "bob");

        ctx.clear();
        assert!(ctx.current_user().is_err());
    }

    #[test]
    fn test_credential_strips_prefix() {
        assert_eq!(Credential::from_session_token("Token abc").expose(), "abc");
        assert_eq!(Credential::from_session_token("abc").expose(), "abc");
        assert!(!format!("{:?}", Credential::from_session_token("abc")).contains("abc"));
    }

    #[test]
    fn test_identity_from_profile_numeric_id() {
        let profile = json!({ "user": { "id": 4242, "username": "neo" } });
        let identity = Identity::from_profile(&profile).unwrap();
        assert_eq!(identity.user_id, "4242");
        assert_eq!(identity.display_name, "neo");
    }

    #[test]
    fn test_identity_from_profile_name_fallback() {
        let profile = json!({ "user": { "id": "77", "name": "Trinity" } });
        let identity = Identity::from_profile(&profile).unwrap();
        assert_eq!(identity.user_id, "77");
        assert_eq!(identity.display_name, "Trinity");
    }

    #[test]
    fn test_identity_from_profile_without_id_fails() {
        assert!(Identity::from_profile(&json!({ "user": {} })).is_err());
    }
}
