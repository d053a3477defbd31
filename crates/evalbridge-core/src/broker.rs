//! Correlation broker: the one way producers talk to the peer.
//!
//! The HTTP eval endpoint, the change feed and the keepalive loop all submit
//! through here, so every caller gets the same reply/timeout/cancel/close
//! semantics.
//!
//! The broker keeps an explicit reference to the active session. Attaching a
//! new session replaces (and shuts down) the previous one.

use crate::cancel::CallContext;
use crate::config::SessionSettings;
use crate::envelope::{CallId, Envelope};
use crate::error::{BridgeError, Result};
use crate::registry::ReplyOutcome;
use crate::session::{Session, SessionHandle, SessionId, SessionReport};
use crate::transport::{EnvelopeSink, EnvelopeSource};
use std::sync::{PoisonError, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Routes submissions to the currently active session.
#[derive(Debug, Default)]
pub struct Broker {
    current: RwLock<Option<SessionHandle>>,
    settings: SessionSettings,
}

impl Broker {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            current: RwLock::new(None),
            settings,
        }
    }

    /// Settings applied to sessions started through [`Broker::serve`].
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// The active session, if any.
    pub fn current(&self) -> Option<SessionHandle> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn has_session(&self) -> bool {
        self.current().is_some_and(|s| !s.is_closed())
    }

    /// Make `session` the active one.
    ///
    /// The session it replaces, if any, is shut down and returned.
    pub fn attach(&self, session: SessionHandle) -> Option<SessionHandle> {
        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(session);
        if let Some(previous) = &previous {
            info!("Replacing {} with a new connection", previous.id());
            previous.shutdown();
        }
        previous
    }

    /// Forget `id` if it is still the active session.
    pub fn detach(&self, id: SessionId) -> bool {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|s| s.id() == id) {
            *current = None;
            true
        } else {
            false
        }
    }

    /// Shut down the active session, if any.
    pub fn shutdown(&self) {
        let current = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = current {
            session.shutdown();
        }
    }

    /// Run a session on the given connection halves until it ends.
    ///
    /// The session is the active one for its whole life unless a newer
    /// connection replaces it.
    pub async fn serve<S, R>(&self, sink: S, source: R) -> SessionReport
    where
        S: EnvelopeSink,
        R: EnvelopeSource,
    {
        let session = Session::new(sink, source, self.settings.clone());
        let id = session.id();
        self.attach(session.handle());
        let report = session.run().await;
        self.detach(id);
        report
    }

    /// Send `envelope` to the peer and wait for the correlated reply.
    ///
    /// The envelope must not carry `_id`: the broker assigns it.
    pub async fn submit(&self, envelope: Envelope, ctx: &CallContext) -> Result<Envelope> {
        let session = self.current().ok_or(BridgeError::NoActiveSession)?;
        submit_to(&session, envelope, ctx).await
    }

    /// Submit `{message_type: "eval", code}`.
    pub async fn eval(&self, code: impl Into<String>, ctx: &CallContext) -> Result<Envelope> {
        self.submit(Envelope::eval(code), ctx).await
    }
}

/// Correlated submit on one specific session.
pub(crate) async fn submit_to(
    session: &SessionHandle,
    mut envelope: Envelope,
    ctx: &CallContext,
) -> Result<Envelope> {
    if envelope.has_id() {
        return Err(BridgeError::MalformedEnvelope {
            message: format!("outbound envelope already carries {}", Envelope::ID_KEY),
        });
    }

    let id = CallId::generate();
    envelope.set_call_id(&id);
    let (reply_tx, mut reply_rx) = oneshot::channel();
    session.registry().register(id.clone(), reply_tx)?;

    let queued = tokio::select! {
        biased;
        queued = session.outbound().send(envelope) => queued.is_ok(),
        _ = ctx.done() => return abandon(session, &id, &mut reply_rx).await,
    };
    if !queued {
        // Outbound loop is gone; teardown may already have resolved the call.
        session.registry().evict(&id);
        return Err(BridgeError::SessionClosed);
    }

    let outcome = tokio::select! {
        biased;
        outcome = &mut reply_rx => Some(outcome),
        _ = ctx.done() => None,
    };
    match outcome {
        Some(Ok(outcome)) => outcome,
        Some(Err(_)) => Err(BridgeError::SessionClosed),
        None => abandon(session, &id, &mut reply_rx).await,
    }
}

/// The caller's context fired: drop the pending call.
///
/// If another path won the removal race it owns the sender and is about to
/// deliver, so its outcome is awaited and returned instead of `Cancelled`.
async fn abandon(
    session: &SessionHandle,
    id: &CallId,
    reply_rx: &mut oneshot::Receiver<ReplyOutcome>,
) -> Result<Envelope> {
    if session.registry().evict(id) {
        debug!("Call {} abandoned by caller", id);
        return Err(BridgeError::Cancelled);
    }
    match reply_rx.await {
        Ok(outcome) => outcome,
        Err(_) => Err(BridgeError::SessionClosed),
    }
}
