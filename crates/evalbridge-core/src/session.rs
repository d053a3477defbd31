//! One peer connection and the three loops that drive it.
//!
//! - **outbound**: drains the hand-off queue and writes envelopes in FIFO order
//! - **inbound**: reads envelopes and resolves the matching pending calls
//! - **keepalive**: pings the peer through the normal submit path
//!
//! The loops share one cancellation scope. Whichever loop ends first cancels
//! it; the supervisor in [`Session::run`] waits for all three, then resolves
//! every still-pending call with `SessionClosed` and closes the connection.
//! Cleanup runs once, in one place, whatever triggered it.

use crate::broker::submit_to;
use crate::cancel::{CallContext, CancellationToken};
use crate::config::SessionSettings;
use crate::envelope::Envelope;
use crate::error::{BridgeError, Result};
use crate::registry::PendingRegistry;
use crate::transport::{EnvelopeSink, EnvelopeSource};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Which of the three loops ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLoop {
    Outbound,
    Inbound,
    Keepalive,
}

impl fmt::Display for SessionLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionLoop::Outbound => write!(f, "outbound"),
            SessionLoop::Inbound => write!(f, "inbound"),
            SessionLoop::Keepalive => write!(f, "keepalive"),
        }
    }
}

/// Cheap, cloneable reference to a running session.
///
/// This is what the broker routes submissions to.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    registry: PendingRegistry,
    outbound: mpsc::Sender<Envelope>,
    scope: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn registry(&self) -> &PendingRegistry {
        &self.registry
    }

    pub(crate) fn outbound(&self) -> &mpsc::Sender<Envelope> {
        &self.outbound
    }

    /// Whether the session's scope has been cancelled.
    pub fn is_closed(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Ask the session to tear down. Pending calls resolve with `SessionClosed`.
    pub fn shutdown(&self) {
        if self.scope.cancel() {
            info!("{} shutdown requested", self.id);
        }
    }

    /// Submit an envelope on this session and wait for the correlated reply.
    pub async fn submit(&self, envelope: Envelope, ctx: &CallContext) -> Result<Envelope> {
        submit_to(self, envelope, ctx).await
    }
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionReport {
    pub id: SessionId,
    /// Loop that cancelled the scope, `None` when shut down from outside.
    pub trigger: Option<SessionLoop>,
    /// Failure that ended the session, `None` for a requested shutdown.
    pub error: Option<BridgeError>,
    /// Pending calls resolved with `SessionClosed` during teardown.
    pub closed_calls: usize,
    pub duration: Duration,
}

/// A session bound to one connection, not yet running.
pub struct Session<S, R> {
    handle: SessionHandle,
    sink: S,
    source: R,
    outbound_rx: mpsc::Receiver<Envelope>,
    settings: SessionSettings,
}

/// Result of one loop: `Ok` when it stopped because the scope was cancelled.
type LoopResult = Result<()>;

struct LoopExit {
    which: SessionLoop,
    result: LoopResult,
    /// True for the loop whose exit cancelled the scope.
    triggered: bool,
}

impl<S, R> Session<S, R>
where
    S: EnvelopeSink,
    R: EnvelopeSource,
{
    pub fn new(sink: S, source: R, settings: SessionSettings) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(settings.outbound_capacity.max(1));
        let handle = SessionHandle {
            id: SessionId::next(),
            registry: PendingRegistry::new(settings.pending_timeout),
            outbound,
            scope: CancellationToken::new(),
        };
        Self {
            handle,
            sink,
            source,
            outbound_rx,
            settings,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn id(&self) -> SessionId {
        self.handle.id
    }

    /// Run the three loops until the first one ends, then tear down.
    pub async fn run(self) -> SessionReport {
        let Session {
            handle,
            sink,
            source,
            outbound_rx,
            settings,
        } = self;
        let started = Instant::now();
        let id = handle.id;
        let scope = handle.scope.clone();
        info!("{} started", id);

        let outbound = tokio::spawn({
            let scope = scope.clone();
            async move {
                let _guard = ScopeGuard(scope.clone());
                let (sink, result) = outbound_loop(id, sink, outbound_rx, scope.clone()).await;
                let triggered = scope.cancel();
                (
                    sink,
                    LoopExit {
                        which: SessionLoop::Outbound,
                        result,
                        triggered,
                    },
                )
            }
        });
        let inbound = supervised(
            SessionLoop::Inbound,
            scope.clone(),
            inbound_loop(id, source, handle.registry.clone(), scope.clone()),
        );
        let keepalive = supervised(
            SessionLoop::Keepalive,
            scope.clone(),
            keepalive_loop(handle.clone(), settings.clone()),
        );

        let (outbound, inbound, keepalive) = tokio::join!(outbound, inbound, keepalive);

        let (mut sink, outbound_exit) = match outbound {
            Ok((sink, exit)) => (Some(sink), exit),
            Err(e) => (None, panicked(SessionLoop::Outbound, e)),
        };
        let exits = [
            outbound_exit,
            inbound.unwrap_or_else(|e| panicked(SessionLoop::Inbound, e)),
            keepalive.unwrap_or_else(|e| panicked(SessionLoop::Keepalive, e)),
        ];

        let mut trigger = None;
        let mut failure = None;
        for exit in exits {
            if let Err(e) = &exit.result {
                debug!("{} {} loop ended: {}", id, exit.which, e);
            }
            if exit.triggered {
                trigger = Some(exit.which);
                failure = exit.result.err();
            }
        }

        let closed_calls = handle.registry.close();
        if let Some(sink) = sink.as_mut() {
            if let Err(e) = sink.close().await {
                debug!("{} close: {}", id, e);
            }
        }

        match (&trigger, &failure) {
            (Some(which), Some(err)) => {
                warn!("{} ended by {} loop: {}", id, which, err)
            }
            _ => info!("{} closed", id),
        }
        if closed_calls > 0 {
            info!("{} resolved {} pending calls with SessionClosed", id, closed_calls);
        }

        SessionReport {
            id,
            trigger,
            error: failure,
            closed_calls,
            duration: started.elapsed(),
        }
    }
}

fn supervised<F>(which: SessionLoop, scope: CancellationToken, work: F) -> JoinHandle<LoopExit>
where
    F: std::future::Future<Output = LoopResult> + Send + 'static,
{
    tokio::spawn(async move {
        let _guard = ScopeGuard(scope.clone());
        let result = work.await;
        let triggered = scope.cancel();
        LoopExit {
            which,
            result,
            triggered,
        }
    })
}

/// Cancels the scope when a loop task unwinds, so siblings never wait on a
/// panicked loop.
struct ScopeGuard(CancellationToken);

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn panicked(which: SessionLoop, err: tokio::task::JoinError) -> LoopExit {
    error!("{} loop panicked: {}", which, err);
    LoopExit {
        which,
        result: Err(BridgeError::Other(format!("{} loop panicked", which))),
        triggered: false,
    }
}

/// Sole writer of the connection. Hands the sink back for the final close.
async fn outbound_loop<S: EnvelopeSink>(
    id: SessionId,
    mut sink: S,
    mut queue: mpsc::Receiver<Envelope>,
    scope: CancellationToken,
) -> (S, LoopResult) {
    loop {
        let envelope = tokio::select! {
            biased;
            _ = scope.cancelled() => return (sink, Ok(())),
            next = queue.recv() => match next {
                Some(envelope) => envelope,
                None => return (sink, Ok(())),
            },
        };

        debug!(
            session = %id,
            call_id = ?envelope.get(Envelope::ID_KEY),
            message_type = envelope.message_type().unwrap_or("-"),
            "ws-send"
        );

        let written = tokio::select! {
            biased;
            _ = scope.cancelled() => return (sink, Ok(())),
            written = sink.send(&envelope) => written,
        };
        if let Err(e) = written {
            let err = match e {
                BridgeError::WriteFailure { .. } => e,
                other => BridgeError::WriteFailure {
                    message: other.to_string(),
                },
            };
            return (sink, Err(err));
        }
    }
}

/// Sole reader of the connection.
async fn inbound_loop<R: EnvelopeSource>(
    id: SessionId,
    mut source: R,
    registry: PendingRegistry,
    scope: CancellationToken,
) -> LoopResult {
    loop {
        let next = tokio::select! {
            biased;
            _ = scope.cancelled() => return Ok(()),
            next = source.recv() => next,
        };

        match next {
            Ok(Some(envelope)) => dispatch_inbound(id, &registry, envelope),
            Ok(None) => {
                return Err(BridgeError::ReadFailure {
                    message: "connection closed by peer".to_string(),
                })
            }
            Err(e) if e.is_session_fatal() => return Err(e),
            Err(BridgeError::MalformedEnvelope { message }) => {
                warn!("{} dropping malformed envelope: {}", id, message);
            }
            Err(e) => {
                return Err(BridgeError::ReadFailure {
                    message: e.to_string(),
                })
            }
        }
    }
}

fn dispatch_inbound(id: SessionId, registry: &PendingRegistry, envelope: Envelope) {
    debug!(
        session = %id,
        call_id = ?envelope.get(Envelope::ID_KEY),
        message_type = envelope.message_type().unwrap_or("-"),
        "ws-recv"
    );

    match envelope.call_id() {
        Ok(Some(call_id)) => {
            if !registry.resolve(&call_id, envelope) {
                debug!("{} reply for unknown call {} discarded", id, call_id);
            }
        }
        Ok(None) => {
            debug!(
                "{} unsolicited {} message",
                id,
                envelope.message_type().unwrap_or("untyped")
            );
        }
        Err(e) => warn!("{} dropping envelope: {}", id, e),
    }
}

/// Ping the peer on a fixed interval. A zero interval disables pings.
async fn keepalive_loop(handle: SessionHandle, settings: SessionSettings) -> LoopResult {
    let scope = handle.scope.clone();
    if settings.keepalive_interval.is_zero() {
        scope.cancelled().await;
        return Ok(());
    }

    let mut ticker = tokio::time::interval(settings.keepalive_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the first ping goes out one interval in.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = scope.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let ctx = CallContext::with_timeout(settings.keepalive_timeout).with_token(scope.clone());
        match submit_to(&handle, Envelope::ping(), &ctx).await {
            Ok(_) => debug!("{} pong", handle.id),
            Err(_) if scope.is_cancelled() => return Ok(()),
            Err(BridgeError::Cancelled) => {
                return Err(BridgeError::Timeout(settings.keepalive_timeout))
            }
            Err(e) => return Err(e),
        }
    }
}
