//! Session token authentication.
//!
//! 1. Strip an optional `Token ` prefix and install the token on the HTTP client
//! 2. Validate it against `/chat/user/settings/` (non-2xx means invalid)
//! 3. Load `/chat/user/` and derive the [`Identity`]
//! 4. Replace the session context wholesale; if the user or credential
//!    changed, reopen every live channel under the new session
//! 5. Open the primary endpoint with the credential

use std::sync::Arc;

use serde_json::Value;

use crate::channel::{ConnectOptions, Endpoint};
use crate::error::{Result, SessionError};
use crate::http::RequestOptions;
use crate::manager::SessionManager;
use crate::session::{Credential, Identity, Session};

impl SessionManager {
    /// Authenticate with a session token and connect the primary endpoint.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidArgument`] for an empty token.
    /// - [`SessionError::InvalidToken`] if the service rejects the token.
    /// - [`SessionError::Http`] if the profile cannot be loaded.
    /// - Any error from connecting the primary endpoint.
    pub async fn authenticate(&self, token: &str) -> Result<Arc<Session>> {
        let credential = Credential::from_session_token(token);
        if credential.is_empty() {
            return Err(SessionError::InvalidArgument("session token"));
        }
        self.http.update_token(credential.expose());

        let api = self.config.api_base_url.trim_end_matches('/');
        let settings = self
            .http
            .request(&format!("{api}/chat/user/settings/"), RequestOptions::authorized_get())
            .await?;
        if !settings.is_success() {
            log::warn!("[Auth] Token rejected (status {})", settings.status);
            return Err(SessionError::InvalidToken);
        }

        let profile = self.load_profile(api).await?;
        let identity = Identity::from_profile(&profile)?;
        let previous = self.session.current_user().ok();
        let session = self.session.establish(Session {
            identity,
            credential: credential.clone(),
            profile,
        });

        let options = ConnectOptions::new(credential.expose(), self.config.edge_rollout.clone());
        let switched = previous.is_some_and(|p| {
            p.identity.user_id != session.identity.user_id
                || p.credential.expose() != session.credential.expose()
        });
        if switched {
            self.reopen_live_channels(&options).await?;
        }
        self.connect(Endpoint::Primary, Some(options)).await?;
        log::info!("[Auth] Authenticated as {}", session.identity.display_name);
        Ok(session)
    }

    async fn load_profile(&self, api: &str) -> Result<Value> {
        let response = self
            .http
            .request(&format!("{api}/chat/user/"), RequestOptions::authorized_get())
            .await?;
        if !response.is_success() {
            return Err(SessionError::Http(format!(
                "profile request failed with status {}",
                response.status
            )));
        }
        response.json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryDialer;
    use crate::config::Config;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn manager_for(server: &MockServer, dialer: &MemoryDialer) -> SessionManager {
        let config = Config {
            api_base_url: server.uri(),
            ..Config::default()
        };
        SessionManager::with_dialer(config, Arc::new(dialer.clone())).unwrap()
    }

    #[tokio::test]
    async fn test_rejected_token_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/user/settings/"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let dialer = MemoryDialer::new();
        let manager = manager_for(&server, &dialer).await;

        let err = manager.authenticate("Token bad").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidToken));
        assert!(manager.current_user().is_err());
        assert_eq!(dialer.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_profile_without_id_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/user/settings/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/chat/user/"))
            .and(header("authorization", "Token good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "user": {} })))
            .mount(&server)
            .await;
        let manager = manager_for(&server, &MemoryDialer::new()).await;

        assert!(matches!(
            manager.authenticate("good").await,
            Err(SessionError::Http(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_token_rejected_before_any_request() {
        let server = MockServer::start().await;
        let manager = manager_for(&server, &MemoryDialer::new()).await;
        assert!(matches!(
            manager.authenticate("  ").await,
            Err(SessionError::InvalidArgument(_))
        ));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }
}
