//! Pending-call registry.
//!
//! Maps correlation identifiers to the oneshot destination the caller is
//! waiting on. Every entry leaves the table exactly once, through one of:
//!
//! - `resolve`: a matching reply arrived and is delivered
//! - `evict`: the caller gave up; nothing is delivered
//! - expiry: the per-entry timer fired; `Timeout` is delivered
//! - `close`: the session tore down; `SessionClosed` is delivered
//!
//! All four take the same mutex to remove the entry, so exactly one of them
//! wins per id. Delivery happens after the lock is released.

use crate::envelope::{CallId, Envelope};
use crate::error::{BridgeError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What a waiting caller eventually receives.
pub type ReplyOutcome = Result<Envelope>;

/// The reply destination of one pending call.
pub type ReplySender = oneshot::Sender<ReplyOutcome>;

struct PendingCall {
    reply: ReplySender,
    created_at: Instant,
    expiry: AbortHandle,
}

impl PendingCall {
    /// Stop the expiry timer and hand back the reply destination.
    fn finish(self) -> (ReplySender, Duration) {
        self.expiry.abort();
        (self.reply, self.created_at.elapsed())
    }
}

#[derive(Default)]
struct RegistryState {
    calls: HashMap<CallId, PendingCall>,
    closed: bool,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    timeout: Duration,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self, id: &CallId) -> Option<PendingCall> {
        self.lock().calls.remove(id)
    }

    fn expire(&self, id: &CallId) {
        if let Some(call) = self.take(id) {
            let (reply, age) = call.finish();
            warn!("Pending call {} expired after {:?}", id, age);
            let _ = reply.send(Err(BridgeError::Timeout(self.timeout)));
        }
    }
}

/// Concurrency-safe table of calls awaiting a reply.
///
/// Cloning is cheap and yields a handle to the same table.
#[derive(Clone)]
pub struct PendingRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for PendingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("PendingRegistry")
            .field("pending", &state.calls.len())
            .field("closed", &state.closed)
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

impl PendingRegistry {
    /// Create a registry whose entries expire after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState::default()),
                timeout,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Store a pending call and schedule its expiry.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, id: CallId, reply: ReplySender) -> Result<()> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(BridgeError::SessionClosed);
        }
        if state.calls.contains_key(&id) {
            return Err(BridgeError::DuplicateId {
                id: id.as_str().to_string(),
            });
        }

        // The timer cannot observe the table before the insert below: it
        // needs the lock we are holding.
        let expiry = spawn_expiry(Arc::downgrade(&self.inner), id.clone(), self.inner.timeout);
        state.calls.insert(
            id,
            PendingCall {
                reply,
                created_at: Instant::now(),
                expiry,
            },
        );
        Ok(())
    }

    /// Deliver a reply to the matching pending call.
    ///
    /// Returns false when no call is pending under `id`; the caller treats
    /// the envelope as unsolicited.
    pub fn resolve(&self, id: &CallId, envelope: Envelope) -> bool {
        let Some(call) = self.inner.take(id) else {
            return false;
        };
        let (reply, age) = call.finish();
        if reply.send(Ok(envelope)).is_err() {
            debug!("Reply for {} arrived after its caller left ({:?})", id, age);
        }
        true
    }

    /// Remove a pending call without delivering anything.
    ///
    /// Whoever evicts is responsible for telling the caller why.
    pub fn evict(&self, id: &CallId) -> bool {
        match self.inner.take(id) {
            Some(call) => {
                drop(call.finish());
                true
            }
            None => false,
        }
    }

    /// Tear down: refuse new registrations and resolve every pending call
    /// with `SessionClosed`.
    ///
    /// Returns how many calls were resolved. A second call returns 0.
    pub fn close(&self) -> usize {
        let drained: Vec<(CallId, PendingCall)> = {
            let mut state = self.inner.lock();
            state.closed = true;
            state.calls.drain().collect()
        };
        let count = drained.len();
        for (id, call) in drained {
            let (reply, _) = call.finish();
            debug!("Closing pending call {}", id);
            let _ = reply.send(Err(BridgeError::SessionClosed));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.inner.lock().calls.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn spawn_expiry(registry: Weak<RegistryInner>, id: CallId, timeout: Duration) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(registry) = registry.upgrade() {
            registry.expire(&id);
        }
    })
    .abort_handle()
}
