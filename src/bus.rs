//! Process-wide broadcast of inbound frames.
//!
//! Every frame a transport channel reads (keep-alives excepted) is handed to
//! [`MessageBus::publish`], which calls each subscriber synchronously, in
//! registration order, on the publishing task.
//!
//! # Design Principle: "Subscribe once. React always."
//!
//! Handlers should be fast; they run inside the channel's read loop. A
//! handler that returns an error or panics is logged and skipped; delivery
//! continues with the next subscriber and the read loop is unaffected.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use bytes::Bytes;
use serde_json::Value;

use crate::channel::Endpoint;

/// One inbound frame as read from a transport channel.
///
/// The frame is transient: it exists for a single publish pass. Structured
/// decoding happens lazily, at most once, and the `claimed` flag lets the
/// correlation engine enforce "at most one pending request per frame"
/// across independent subscribers.
#[derive(Debug)]
pub struct InboundFrame {
    endpoint: Endpoint,
    raw: Bytes,
    decoded: OnceLock<Option<Value>>,
    claimed: AtomicBool,
}

impl InboundFrame {
    /// Wrap raw frame bytes received on `endpoint`.
    #[must_use]
    pub fn new(endpoint: Endpoint, raw: impl Into<Bytes>) -> Self {
        Self {
            endpoint,
            raw: raw.into(),
            decoded: OnceLock::new(),
            claimed: AtomicBool::new(false),
        }
    }

    /// Endpoint the frame arrived on.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Frame bytes, verbatim.
    #[must_use]
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Frame as UTF-8 text, if it is valid UTF-8.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.raw).ok()
    }

    /// Best-effort structured decode. `None` if the frame is not JSON.
    pub fn json(&self) -> Option<&Value> {
        self.decoded
            .get_or_init(|| serde_json::from_slice(&self.raw).ok())
            .as_ref()
    }

    /// `command` discriminator, when present.
    pub fn command(&self) -> Option<&str> {
        self.json()?.get("command")?.as_str()
    }

    /// Whether a pending request has already taken this frame.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Take the frame for one pending request. Returns `false` if another
    /// request got there first.
    pub fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Subscriber callback.
pub type FrameHandler = Arc<dyn Fn(&InboundFrame) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`MessageBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

#[derive(Default)]
struct Registry {
    handlers: Vec<(SubscriptionId, FrameHandler)>,
    next_id: u64,
}

/// Typed broadcast point for inbound frames.
///
/// Cheap to clone; clones share one subscriber list.
#[derive(Clone, Default)]
pub struct MessageBus {
    registry: Arc<RwLock<Registry>>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl MessageBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. It sees every frame published from now on.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&InboundFrame) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry.handlers.push((id, Arc::new(handler)));
        log::trace!("[Bus] Registered {}", id);
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let before = registry.handlers.len();
        registry.handlers.retain(|(sid, _)| *sid != id);
        let removed = registry.handlers.len() != before;
        if removed {
            log::trace!("[Bus] Unregistered {}", id);
        }
        removed
    }

    /// Deliver `frame` to every subscriber registered at the time of the
    /// call. Returns how many handlers completed without error.
    pub fn publish(&self, frame: &InboundFrame) -> usize {
        // Snapshot so handlers may subscribe/unsubscribe without deadlocking.
        let handlers: Vec<(SubscriptionId, FrameHandler)> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .clone();

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    log::warn!("[Bus] Handler {} failed on {} frame: {:#}", id, frame.endpoint(), e);
                }
                Err(_) => {
                    log::error!("[Bus] Handler {} panicked on {} frame", id, frame.endpoint());
                }
            }
        }
        delivered
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .len()
    }

    /// Whether `id` is still registered.
    #[must_use]
    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .iter()
            .any(|(sid, _)| *sid == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn frame(text: &str) -> InboundFrame {
        InboundFrame::new(Endpoint::Primary, text.as_bytes().to_vec())
    }

    #[test]
    fn test_publish_in_registration_order() {
        let bus = MessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_| {
                seen.lock().unwrap().push(n);
                Ok(())
            });
        }

        assert_eq!(bus.publish(&frame("{\"a\":1}")), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        let bus = MessageBus::new();
        let reached = Arc::new(AtomicBool::new(false));

        bus.subscribe(|_| anyhow::bail!("boom"));
        bus.subscribe(|_| panic!("handler panic"));
        let flag = Arc::clone(&reached);
        bus.subscribe(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(bus.publish(&frame("x")), 1);
        assert!(reached.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unsubscribe_removes_handler() {
        let bus = MessageBus::new();
        let id = bus.subscribe(|_| Ok(()));
        assert!(bus.is_subscribed(id));
        assert!(bus.unsubscribe(id));
        assert!(!bus.is_subscribed(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish(&frame("x")), 0);
    }

    #[test]
    fn test_handler_may_unsubscribe_itself_during_publish() {
        let bus = MessageBus::new();
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let inner_bus = bus.clone();
        let inner_slot = Arc::clone(&slot);
        let id = bus.subscribe(move |_| {
            if let Some(id) = *inner_slot.lock().unwrap() {
                inner_bus.unsubscribe(id);
            }
            Ok(())
        });
        *slot.lock().unwrap() = Some(id);

        bus.publish(&frame("x"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_frame_decoding_is_best_effort() {
        let good = frame(r#"{"command":"add_turn"}"#);
        assert_eq!(good.command(), Some("add_turn"));

        let bad = frame("not json");
        assert!(bad.json().is_none());
        assert_eq!(bad.as_text(), Some("not json"));
    }

    #[test]
    fn test_frame_claimed_once() {
        let f = frame("{}");
        assert!(!f.is_claimed());
        assert!(f.try_claim());
        assert!(!f.try_claim());
        assert!(f.is_claimed());
    }
}
