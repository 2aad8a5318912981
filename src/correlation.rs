//! Request/reply pairing over the broadcast bus.
//!
//! A correlated request is a frame sent on a channel plus a predicate that
//! recognizes its reply among everything later published on the
//! [`MessageBus`]. Each outstanding request owns:
//!
//! - an entry in the pending table, keyed by its [`CorrelationToken`]
//! - a transient bus subscription that evaluates the predicate
//! - a resolution slot holding the one-shot sender
//!
//! Whoever takes the sender out of the slot settles the request: the bus
//! handler on a match, or the waiter when the deadline fires. The loser sees
//! an empty slot and does nothing. The subscription and table entry are
//! removed exactly once by a drop guard, however the wait ends.
//!
//! Requests are not serialized. Several may be outstanding at once and a
//! frame resolves at most one of them: the first matching handler in
//! registration order claims it. Only frames that arrived on the endpoint
//! the request was sent to are offered to its predicate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::bus::{InboundFrame, MessageBus, SubscriptionId};
use crate::channel::{Endpoint, FrameSender};
use crate::error::{Result, SessionError};

/// Deadline applied when a request does not set its own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Identifier placed in an outgoing command and echoed by its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    /// Fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap a caller-chosen token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Token text as placed in frames.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reply recognizer. Receives the decoded form of each frame published by
/// the request's own endpoint.
pub type MatchPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Outgoing frame plus everything needed to wait for its reply.
pub struct CorrelatedRequest {
    token: CorrelationToken,
    frame: Value,
    predicate: MatchPredicate,
    timeout: Duration,
}

impl CorrelatedRequest {
    /// Build a request with the default deadline.
    pub fn new<P>(token: CorrelationToken, frame: Value, predicate: P) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            token,
            frame,
            predicate: Arc::new(predicate),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Token identifying this request.
    #[must_use]
    pub fn token(&self) -> &CorrelationToken {
        &self.token
    }

    /// Deadline measured from registration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for CorrelatedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelatedRequest")
            .field("token", &self.token)
            .field("frame", &self.frame)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

type ResolutionSlot = Arc<Mutex<Option<oneshot::Sender<Value>>>>;

struct Pending {
    endpoint: Endpoint,
    subscription: SubscriptionId,
    slot: ResolutionSlot,
}

/// Table of outstanding correlated requests.
///
/// Cheap to clone; clones share one table.
#[derive(Clone)]
pub struct CorrelationEngine {
    bus: MessageBus,
    pending: Arc<Mutex<HashMap<CorrelationToken, Pending>>>,
}

impl std::fmt::Debug for CorrelationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationEngine")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl CorrelationEngine {
    /// Create an engine that listens on `bus`.
    #[must_use]
    pub fn new(bus: MessageBus) -> Self {
        Self {
            bus,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<CorrelationToken, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `request` through `sender` and wait for the first published frame
    /// its predicate accepts.
    ///
    /// # Errors
    ///
    /// - [`SessionError::DuplicateToken`] if the token is already outstanding.
    /// - Whatever `sender.send` fails with, typically
    ///   [`SessionError::NotConnected`].
    /// - [`SessionError::Timeout`] if nothing matched before the deadline.
    /// - [`SessionError::Abandoned`] if [`Self::abandon_all`] ran first.
    pub async fn send_and_await(
        &self,
        sender: &dyn FrameSender,
        request: CorrelatedRequest,
    ) -> Result<Value> {
        let CorrelatedRequest {
            token,
            frame,
            predicate,
            timeout,
        } = request;
        let text = serde_json::to_string(&frame)?;
        let deadline = tokio::time::Instant::now() + timeout;

        let (tx, mut rx) = oneshot::channel();
        let slot: ResolutionSlot = Arc::new(Mutex::new(Some(tx)));
        let subscription = self.register(&token, sender.endpoint(), predicate, &slot)?;
        let _guard = PendingGuard {
            engine: self,
            token: &token,
            subscription,
        };

        sender.send(&text).await?;
        log::debug!("[Correlation] Sent {} on {}", token, sender.endpoint());

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SessionError::Abandoned(token.to_string())),
            Err(_) => {
                // Deadline fired; settle unless a match already did.
                let expired = lock_slot(&slot).take().is_some();
                if expired {
                    log::debug!("[Correlation] {} timed out after {:?}", token, timeout);
                    Err(SessionError::Timeout {
                        token: token.to_string(),
                        after: timeout,
                    })
                } else {
                    rx.try_recv()
                        .map_err(|_| SessionError::Abandoned(token.to_string()))
                }
            }
        }
    }

    fn register(
        &self,
        token: &CorrelationToken,
        endpoint: Endpoint,
        predicate: MatchPredicate,
        slot: &ResolutionSlot,
    ) -> Result<SubscriptionId> {
        let mut pending = self.pending();
        if pending.contains_key(token) {
            return Err(SessionError::DuplicateToken(token.to_string()));
        }

        let handler_slot = Arc::clone(slot);
        let handler_token = token.clone();
        let subscription = self.bus.subscribe(move |frame: &InboundFrame| {
            if frame.endpoint() == endpoint {
                resolve_if_matching(frame, &predicate, &handler_slot, &handler_token);
            }
            Ok(())
        });

        pending.insert(
            token.clone(),
            Pending {
                endpoint,
                subscription,
                slot: Arc::clone(slot),
            },
        );
        Ok(subscription)
    }

    /// Fail every outstanding request with [`SessionError::Abandoned`].
    ///
    /// Returns how many were abandoned.
    pub fn abandon_all(&self) -> usize {
        let drained: Vec<(CorrelationToken, Pending)> = self.pending().drain().collect();
        for (token, pending) in &drained {
            self.bus.unsubscribe(pending.subscription);
            // Dropping the sender wakes the waiter with a receive error.
            drop(lock_slot(&pending.slot).take());
            log::debug!("[Correlation] Abandoned {} on {}", token, pending.endpoint);
        }
        if !drained.is_empty() {
            log::info!("[Correlation] Abandoned {} pending request(s)", drained.len());
        }
        drained.len()
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pending().len()
    }

    /// Whether `token` is held by an outstanding request.
    #[must_use]
    pub fn is_outstanding(&self, token: &CorrelationToken) -> bool {
        self.pending().contains_key(token)
    }
}

fn lock_slot(slot: &ResolutionSlot) -> MutexGuard<'_, Option<oneshot::Sender<Value>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn resolve_if_matching(
    frame: &InboundFrame,
    predicate: &MatchPredicate,
    slot: &ResolutionSlot,
    token: &CorrelationToken,
) {
    if frame.is_claimed() {
        return;
    }
    let Some(value) = frame.json() else {
        return;
    };
    if !predicate(value) {
        return;
    }

    let mut slot = lock_slot(slot);
    if slot.is_none() || !frame.try_claim() {
        return;
    }
    if let Some(tx) = slot.take() {
        let _ = tx.send(value.clone());
        log::debug!("[Correlation] Resolved {}", token);
    }
}

/// Unsubscribes and forgets a request when its wait ends, whichever way.
struct PendingGuard<'a> {
    engine: &'a CorrelationEngine,
    token: &'a CorrelationToken,
    subscription: SubscriptionId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.engine.bus.unsubscribe(self.subscription);
        let mut pending = self.engine.pending();
        if pending
            .get(self.token)
            .is_some_and(|p| p.subscription == self.subscription)
        {
            pending.remove(self.token);
        }
    }
}
