//! In-memory transport.
//!
//! [`MemoryDialer`] hands out connections backed by unbounded channels
//! instead of sockets. Each successful dial yields a [`MemoryServer`] handle
//! standing in for the remote side: it can push frames to the client, drop
//! the connection, and inspect what the client wrote. Used to drive the
//! channel state machine under a paused tokio clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ConnectOptions, Dialer, Endpoint, FrameSink, FrameSource, Link};
use crate::ws::WsMessage;

/// Dialer whose connections live entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryDialer {
    inner: Arc<Mutex<DialerState>>,
}

#[derive(Debug, Default)]
struct DialerState {
    dials: Vec<(Endpoint, ConnectOptions)>,
    scripted_failures: VecDeque<String>,
    fail_always: bool,
    dial_delay: Option<Duration>,
    servers: Vec<MemoryServer>,
}

impl MemoryDialer {
    /// Create a dialer where every dial succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DialerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` dials fail.
    pub fn fail_next(&self, count: usize) {
        let mut state = self.state();
        for n in 0..count {
            state
                .scripted_failures
                .push_back(format!("scripted dial failure #{}", n + 1));
        }
    }

    /// Make every dial fail until switched off again.
    pub fn fail_always(&self, fail: bool) {
        self.state().fail_always = fail;
    }

    /// Delay every dial by `delay` before it resolves.
    pub fn set_dial_delay(&self, delay: Duration) {
        self.state().dial_delay = Some(delay);
    }

    /// Total dials attempted, successful or not.
    #[must_use]
    pub fn dial_count(&self) -> usize {
        self.state().dials.len()
    }

    /// Dials attempted against `endpoint`.
    #[must_use]
    pub fn dial_count_for(&self, endpoint: Endpoint) -> usize {
        self.state()
            .dials
            .iter()
            .filter(|(ep, _)| *ep == endpoint)
            .count()
    }

    /// Every dial in order, with the options it used.
    #[must_use]
    pub fn dials(&self) -> Vec<(Endpoint, ConnectOptions)> {
        self.state().dials.clone()
    }

    /// Remote handles of every successful dial, oldest first.
    #[must_use]
    pub fn servers(&self) -> Vec<MemoryServer> {
        self.state().servers.clone()
    }

    /// Remote handle of the most recent successful dial to `endpoint`.
    #[must_use]
    pub fn last_server(&self, endpoint: Endpoint) -> Option<MemoryServer> {
        self.state()
            .servers
            .iter()
            .rev()
            .find(|s| s.endpoint == endpoint)
            .cloned()
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, endpoint: Endpoint, options: &ConnectOptions) -> anyhow::Result<Link> {
        let delay = {
            let mut state = self.state();
            state.dials.push((endpoint, options.clone()));
            state.dial_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(reason) = state.scripted_failures.pop_front() {
            return Err(anyhow!(reason));
        }
        if state.fail_always {
            return Err(anyhow!("dial refused"));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_binary = Arc::new(Mutex::new(Vec::new()));
        let open = Arc::new(AtomicBool::new(true));

        state.servers.push(MemoryServer {
            endpoint,
            inbound: inbound_tx,
            sent: Arc::clone(&sent),
            sent_binary: Arc::clone(&sent_binary),
            open: Arc::clone(&open),
        });

        Ok((
            Box::new(MemorySink {
                sent,
                sent_binary,
                open,
            }),
            Box::new(MemorySource { inbound: inbound_rx }),
        ))
    }
}

/// Remote side of one in-memory connection.
#[derive(Debug, Clone)]
pub struct MemoryServer {
    endpoint: Endpoint,
    inbound: mpsc::UnboundedSender<anyhow::Result<WsMessage>>,
    sent: Arc<Mutex<Vec<String>>>,
    sent_binary: Arc<Mutex<Vec<Vec<u8>>>>,
    open: Arc<AtomicBool>,
}

impl MemoryServer {
    /// Endpoint this connection was dialed for.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Deliver a text frame to the client.
    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.inbound.send(Ok(WsMessage::Text(text.into())));
    }

    /// Deliver an arbitrary message to the client.
    pub fn push(&self, message: WsMessage) {
        let _ = self.inbound.send(Ok(message));
    }

    /// Close the connection from the remote side.
    pub fn close(&self, code: u16, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.inbound.send(Ok(WsMessage::Close {
            code,
            reason: reason.to_string(),
        }));
    }

    /// Fail the connection with a read error.
    pub fn fail(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.inbound.send(Err(anyhow!("{reason}")));
    }

    /// Text frames the client has written, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Binary frames the client has written, in order.
    #[must_use]
    pub fn sent_binary(&self) -> Vec<Vec<u8>> {
        self.sent_binary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the connection is still up from the remote's view.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct MemorySink {
    sent: Arc<Mutex<Vec<String>>>,
    sent_binary: Arc<Mutex<Vec<Vec<u8>>>>,
    open: Arc<AtomicBool>,
}

impl MemorySink {
    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("connection closed"))
        }
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        self.ensure_open()?;
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text.to_string());
        Ok(())
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> anyhow::Result<()> {
        self.ensure_open()?;
        self.sent_binary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data);
        Ok(())
    }

    async fn send_pong(&mut self, _data: Vec<u8>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MemorySource {
    inbound: mpsc::UnboundedReceiver<anyhow::Result<WsMessage>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Option<anyhow::Result<WsMessage>> {
        self.inbound.recv().await
    }
}
