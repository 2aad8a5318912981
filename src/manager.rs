//! Session manager: the one object that owns every long-lived piece.
//!
//! ```text
//!   SessionManager
//!     ├── Config
//!     ├── SessionContext     (current identity + credential)
//!     ├── MessageBus         (all inbound frames, every endpoint)
//!     ├── CorrelationEngine  (pending request table over the bus)
//!     ├── HttpClient         (auth + history)
//!     └── TransportChannel × Endpoint (created lazily, one per endpoint)
//! ```
//!
//! Construct one on startup and call [`SessionManager::shutdown`] when done.
//! Separate managers share nothing, so tests can run isolated sessions side
//! by side.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::bus::{InboundFrame, MessageBus, SubscriptionId};
use crate::channel::{ConnectOptions, Dialer, Endpoint, TransportChannel};
use crate::config::Config;
use crate::correlation::{CorrelatedRequest, CorrelationEngine};
use crate::error::Result;
use crate::http::HttpClient;
use crate::session::{Session, SessionContext};
use crate::ws::WsDialer;

/// Owner of the session, the bus, the correlation engine and the channels.
pub struct SessionManager {
    pub(crate) config: Config,
    pub(crate) session: Arc<SessionContext>,
    pub(crate) bus: MessageBus,
    pub(crate) engine: CorrelationEngine,
    pub(crate) http: HttpClient,
    dialer: Arc<dyn Dialer>,
    channels: Mutex<HashMap<Endpoint, TransportChannel>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("authenticated", &self.session.is_authenticated())
            .field("bus", &self.bus)
            .field("engine", &self.engine)
            .field("dialer", &self.dialer)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Manager that dials real WebSocket endpoints from `config`.
    pub fn new(config: Config) -> Result<Self> {
        let dialer = Arc::new(WsDialer::from_config(&config));
        Self::with_dialer(config, dialer)
    }

    /// Manager that opens connections through `dialer`.
    pub fn with_dialer(config: Config, dialer: Arc<dyn Dialer>) -> Result<Self> {
        let bus = MessageBus::new();
        Ok(Self {
            engine: CorrelationEngine::new(bus.clone()),
            http: HttpClient::new()?,
            session: Arc::new(SessionContext::new()),
            channels: Mutex::new(HashMap::new()),
            config,
            bus,
            dialer,
        })
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared session context.
    #[must_use]
    pub fn session_context(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// The bus every channel publishes to.
    #[must_use]
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// The pending request table.
    #[must_use]
    pub fn engine(&self) -> &CorrelationEngine {
        &self.engine
    }

    /// The HTTP collaborator.
    #[must_use]
    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// The single channel for `endpoint`, created on first use.
    pub fn channel(&self, endpoint: Endpoint) -> TransportChannel {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(endpoint)
            .or_insert_with(|| {
                log::debug!("[Manager] Creating {} channel", endpoint);
                TransportChannel::new(
                    endpoint,
                    Arc::clone(&self.dialer),
                    self.bus.clone(),
                    Arc::clone(&self.session),
                    self.config.reconnect_policy(),
                )
            })
            .clone()
    }

    /// Open `endpoint`, saving `options` for later reconnects.
    pub async fn connect(&self, endpoint: Endpoint, options: Option<ConnectOptions>) -> Result<()> {
        self.channel(endpoint).connect(options).await
    }

    /// Open `endpoint` if needed, falling back to the session credential
    /// when the channel has no saved options.
    pub async fn ensure_connected(&self, endpoint: Endpoint) -> Result<TransportChannel> {
        let channel = self.channel(endpoint);
        if channel.is_open() {
            return Ok(channel);
        }
        let options = match channel.saved_options() {
            Some(_) => None,
            None => self.session_options(),
        };
        channel.connect(options).await?;
        Ok(channel)
    }

    fn session_options(&self) -> Option<ConnectOptions> {
        self.session
            .current_user()
            .ok()
            .map(|s| ConnectOptions::new(s.credential.expose(), self.config.edge_rollout.clone()))
    }

    /// Write a raw frame to `endpoint`.
    pub async fn send(&self, endpoint: Endpoint, frame: &str) -> Result<()> {
        self.channel(endpoint).send(frame).await
    }

    /// Send `request` on `endpoint` and wait for its reply.
    pub async fn send_and_await(&self, endpoint: Endpoint, request: CorrelatedRequest) -> Result<Value> {
        let channel = self.channel(endpoint);
        self.engine.send_and_await(&channel, request).await
    }

    /// The authenticated session.
    pub fn current_user(&self) -> Result<Arc<Session>> {
        self.session.current_user()
    }

    /// Listen to every inbound frame, solicited or not.
    pub fn on_frame<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&InboundFrame) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(handler)
    }

    /// Remove a listener added with [`Self::on_frame`].
    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Close every channel (no more automatic reconnects) and fail every
    /// pending request with `Abandoned`.
    pub async fn shutdown(&self) {
        let abandoned = self.engine.abandon_all();
        for channel in self.all_channels() {
            channel.close().await;
        }
        log::info!("[Manager] Shut down ({} pending request(s) abandoned)", abandoned);
    }

    /// Close and reopen every live channel with `options`, so no socket
    /// stays authenticated and subscribed as a previous user.
    pub(crate) async fn reopen_live_channels(&self, options: &ConnectOptions) -> Result<()> {
        for channel in self.all_channels() {
            if channel.is_open() {
                log::info!("[Manager] Reopening {} channel for the new session", channel.endpoint());
                channel.close().await;
                channel.connect(Some(options.clone())).await?;
            }
        }
        Ok(())
    }

    fn all_channels(&self) -> Vec<TransportChannel> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
