//! Transport channel: one live connection per logical endpoint.
//!
//! # Protocol
//!
//! - `connect` dials through the [`Dialer`], sends the announce frame and the
//!   `user#<id>` subscription, then spawns the read loop. Dial and handshake
//!   together are bounded by the policy's connect timeout
//! - The read loop echoes the `{}` keep-alive in the frame type it arrived
//!   in and publishes everything else
//!   to the [`MessageBus`] in arrival order
//! - An unexpected close schedules a reconnect after the policy delay using
//!   the saved options; after the attempt cap the channel gives up until an
//!   explicit `connect`
//!
//! # Single-flight
//!
//! Every open (explicit or scheduled) runs under `connect_lock`. A second
//! `connect` waits for the first and then finds the channel already open.
//!
//! In-flight correlated requests are not failed on disconnect. They keep
//! waiting for their own deadline, since a reply can still arrive after the
//! reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use super::handshake::{announce_frame, subscribe_frame, user_channel, USER_SUBSCRIBE_ID};
use super::{
    ConnectOptions, ConnectionState, Dialer, Endpoint, FrameSender, FrameSink, FrameSource,
    ReconnectPolicy, KEEP_ALIVE,
};
use crate::bus::{InboundFrame, MessageBus};
use crate::error::{Result, SessionError};
use crate::session::SessionContext;
use crate::ws::WsMessage;

type SharedSink = Arc<AsyncMutex<Box<dyn FrameSink>>>;

/// Owner of the connection to one [`Endpoint`].
///
/// Cheap to clone; clones drive the same connection.
#[derive(Clone)]
pub struct TransportChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    endpoint: Endpoint,
    dialer: Arc<dyn Dialer>,
    bus: MessageBus,
    session: Arc<SessionContext>,
    policy: ReconnectPolicy,
    /// Serializes every open of this endpoint.
    connect_lock: AsyncMutex<()>,
    link: Mutex<LinkState>,
    next_command_id: AtomicU64,
}

#[derive(Default)]
struct LinkState {
    state: ConnectionState,
    attempts: u32,
    saved_options: Option<ConnectOptions>,
    sink: Option<SharedSink>,
    reader: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    retry_pending: bool,
    /// Bumped on every open and on close; stale read loops compare against it.
    generation: u64,
    shut_down: bool,
}

impl std::fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let link = self.inner.link();
        f.debug_struct("TransportChannel")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &link.state)
            .field("attempts", &link.attempts)
            .finish_non_exhaustive()
    }
}

impl TransportChannel {
    /// Create a disconnected channel for `endpoint`.
    #[must_use]
    pub fn new(
        endpoint: Endpoint,
        dialer: Arc<dyn Dialer>,
        bus: MessageBus,
        session: Arc<SessionContext>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                endpoint,
                dialer,
                bus,
                session,
                policy,
                connect_lock: AsyncMutex::new(()),
                link: Mutex::new(LinkState::default()),
                next_command_id: AtomicU64::new(USER_SUBSCRIBE_ID + 1),
            }),
        }
    }

    /// Endpoint this channel serves.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.link().state
    }

    /// Whether a live connection exists.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Consecutive reconnect attempts since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.link().attempts
    }

    /// Options remembered for reconnects.
    #[must_use]
    pub fn saved_options(&self) -> Option<ConnectOptions> {
        self.inner.link().saved_options.clone()
    }

    /// Allocate a command id for an ad-hoc correlated command.
    pub fn next_command_id(&self) -> u64 {
        self.inner.next_command_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Open the connection, or return at once if it is already open.
    ///
    /// `options`, when given, replace the saved options used by later
    /// reconnects. Completes after the dial and the handshake frames.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Configuration`] if no options are given or saved.
    /// - [`SessionError::Transport`] if the dial or handshake fails or
    ///   exceeds the connect timeout; a reconnect is still scheduled per the
    ///   policy.
    pub async fn connect(&self, options: Option<ConnectOptions>) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        let options = {
            let mut link = self.inner.link();
            if let Some(options) = options {
                link.saved_options = Some(options);
            }
            if link.state == ConnectionState::Open {
                log::debug!("[Transport:{}] Already connected", self.inner.endpoint);
                return Ok(());
            }
            link.shut_down = false;
            link.saved_options.clone()
        };
        let options = options.ok_or(SessionError::Configuration(self.inner.endpoint))?;
        self.inner.open(options).await
    }

    /// Write one text frame to the live connection.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] if no connection is live,
    /// [`SessionError::Transport`] if the write fails.
    pub async fn send(&self, frame: &str) -> Result<()> {
        let sink = self
            .inner
            .link()
            .sink
            .clone()
            .ok_or(SessionError::NotConnected(self.inner.endpoint))?;
        let result = sink.lock().await.send_text(frame).await;
        result.map_err(|e| SessionError::Transport(format!("{e:#}")))
    }

    /// Serialize and send a structured frame.
    pub async fn send_json(&self, frame: &Value) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.send(&text).await
    }

    /// Tear down the connection and stop automatic reconnects.
    ///
    /// A later explicit [`Self::connect`] reopens the channel.
    pub async fn close(&self) {
        let (sink, reader, retry) = {
            let mut link = self.inner.link();
            link.shut_down = true;
            link.retry_pending = false;
            link.generation += 1;
            link.state = ConnectionState::Disconnected;
            (link.sink.take(), link.reader.take(), link.retry.take())
        };
        if let Some(retry) = retry {
            retry.abort();
        }
        if let Some(reader) = reader {
            reader.abort();
        }
        if let Some(sink) = sink {
            if let Err(e) = sink.lock().await.close().await {
                log::debug!("[Transport:{}] Close failed: {:#}", self.inner.endpoint, e);
            }
        }
        log::info!("[Transport:{}] Closed", self.inner.endpoint);
    }
}

#[async_trait]
impl FrameSender for TransportChannel {
    fn endpoint(&self) -> Endpoint {
        self.inner.endpoint
    }

    async fn send(&self, frame: &str) -> Result<()> {
        TransportChannel::send(self, frame).await
    }
}

impl ChannelInner {
    fn link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dial, handshake and start the read loop. Caller holds `connect_lock`.
    async fn open(self: &Arc<Self>, options: ConnectOptions) -> Result<()> {
        self.link().state = ConnectionState::Connecting;
        log::info!("[Transport:{}] Connecting", self.endpoint);

        let bound = self.policy.connect_timeout;
        let established = match tokio::time::timeout(bound, self.establish(&options)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("no handshake within {:?}", bound)),
        };
        let (sink, source) = match established {
            Ok(link) => link,
            Err(e) => {
                log::warn!("[Transport:{}] Connection failed: {:#}", self.endpoint, e);
                self.link().state = ConnectionState::Disconnected;
                self.schedule_reconnect();
                return Err(SessionError::Transport(format!("{e:#}")));
            }
        };

        let opened = {
            let mut link = self.link();
            if link.shut_down {
                false
            } else {
                link.generation += 1;
                link.state = ConnectionState::Open;
                link.attempts = 0;
                link.sink = Some(Arc::clone(&sink));
                let reader = tokio::spawn(read_loop(
                    Arc::downgrade(self),
                    self.endpoint,
                    self.bus.clone(),
                    link.generation,
                    source,
                    Arc::clone(&sink),
                ));
                if let Some(stale) = link.reader.replace(reader) {
                    stale.abort();
                }
                true
            }
        };

        if !opened {
            // Closed while dialing.
            let _ = sink.lock().await.close().await;
            return Err(SessionError::NotConnected(self.endpoint));
        }

        log::info!("[Transport:{}] Connected", self.endpoint);
        Ok(())
    }

    async fn establish(
        &self,
        options: &ConnectOptions,
    ) -> anyhow::Result<(SharedSink, Box<dyn FrameSource>)> {
        let (sink, source) = self.dialer.dial(self.endpoint, options).await?;
        let sink: SharedSink = Arc::new(AsyncMutex::new(sink));
        if let Err(e) = self.send_handshake(&sink).await {
            let _ = sink.lock().await.close().await;
            return Err(e.context("handshake failed"));
        }
        Ok((sink, source))
    }

    async fn send_handshake(&self, sink: &SharedSink) -> anyhow::Result<()> {
        let mut sink = sink.lock().await;
        sink.send_text(&announce_frame().to_string()).await?;
        match self.session.identity() {
            Ok(identity) => {
                let frame = subscribe_frame(&user_channel(&identity.user_id), USER_SUBSCRIBE_ID);
                sink.send_text(&frame.to_string()).await?;
            }
            Err(_) => {
                log::debug!(
                    "[Transport:{}] No identity yet, skipping user channel subscription",
                    self.endpoint
                );
            }
        }
        Ok(())
    }

    /// Called by the read loop of `generation` when its connection ends.
    fn on_closed(self: &Arc<Self>, generation: u64) {
        {
            let mut link = self.link();
            if link.generation != generation || link.shut_down {
                return;
            }
            link.sink = None;
            link.reader = None;
            link.state = ConnectionState::Disconnected;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut link = self.link();
        if link.shut_down {
            return;
        }
        if link.retry_pending {
            log::debug!("[Transport:{}] Reconnect already scheduled", self.endpoint);
            return;
        }
        let Some(delay) = self.policy.next_delay(link.attempts) else {
            link.state = ConnectionState::GaveUp;
            log::warn!(
                "[Transport:{}] Max reconnection attempts ({}) reached. Giving up.",
                self.endpoint,
                self.policy.max_attempts
            );
            return;
        };

        link.attempts += 1;
        link.retry_pending = true;
        log::info!(
            "[Transport:{}] Attempting to reconnect in {}s (attempt {}/{})",
            self.endpoint,
            delay.as_secs_f32(),
            link.attempts,
            self.policy.max_attempts
        );

        let weak = Arc::downgrade(self);
        link.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.reconnect().await;
            }
        }));
    }

    fn reconnect(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            let _guard = self.connect_lock.lock().await;
            let options = {
                let mut link = self.link();
                link.retry_pending = false;
                if link.shut_down || link.state == ConnectionState::Open {
                    return;
                }
                link.saved_options.clone()
            };
            let Some(options) = options else {
                log::warn!("[Transport:{}] No saved options to reconnect with", self.endpoint);
                return;
            };
            if let Err(e) = self.open(options).await {
                log::debug!("[Transport:{}] Reconnect attempt failed: {}", self.endpoint, e);
            }
        }
        .boxed()
    }
}

async fn read_loop(
    inner: Weak<ChannelInner>,
    endpoint: Endpoint,
    bus: MessageBus,
    generation: u64,
    mut source: Box<dyn FrameSource>,
    sink: SharedSink,
) {
    let reason = loop {
        match source.recv().await {
            Some(Ok(WsMessage::Text(text))) => {
                if text == KEEP_ALIVE {
                    if let Err(e) = echo_keep_alive(&sink, WsMessage::Text(text)).await {
                        break format!("keep-alive echo failed: {e:#}");
                    }
                    continue;
                }
                bus.publish(&InboundFrame::new(endpoint, Bytes::from(text)));
            }
            Some(Ok(WsMessage::Binary(data))) => {
                if data == KEEP_ALIVE.as_bytes() {
                    if let Err(e) = echo_keep_alive(&sink, WsMessage::Binary(data)).await {
                        break format!("keep-alive echo failed: {e:#}");
                    }
                    continue;
                }
                bus.publish(&InboundFrame::new(endpoint, Bytes::from(data)));
            }
            Some(Ok(WsMessage::Ping(data))) => {
                let result = sink.lock().await.send_pong(data).await;
                if let Err(e) = result {
                    log::debug!("[Transport:{}] Pong failed: {:#}", endpoint, e);
                }
            }
            Some(Ok(WsMessage::Pong(_))) => {}
            Some(Ok(WsMessage::Close { code, reason })) => {
                break format!("code {code}, reason {reason:?}");
            }
            Some(Err(e)) => break format!("{e:#}"),
            None => break "stream ended".to_string(),
        }
    };

    log::info!("[Transport:{}] Disconnected ({})", endpoint, reason);
    if let Some(inner) = inner.upgrade() {
        inner.on_closed(generation);
    }
}

async fn echo_keep_alive(sink: &SharedSink, frame: WsMessage) -> anyhow::Result<()> {
    log::trace!("Echoing keep-alive");
    let mut sink = sink.lock().await;
    match frame {
        WsMessage::Binary(data) => sink.send_binary(data).await,
        _ => sink.send_text(KEEP_ALIVE).await,
    }
}
