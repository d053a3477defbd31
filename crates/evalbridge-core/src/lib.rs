//! Evalbridge Core - request/reply correlation over one long-lived peer connection.
//!
//! A peer (typically an in-page agent) holds a single bidirectional message
//! connection. Local callers submit JSON envelopes, each tagged with a fresh
//! `_id`; the peer answers by echoing that `_id`, and the reply is routed back
//! to the caller that is waiting on it. Every submission ends with exactly one
//! outcome: a reply, a timeout, a cancellation, or a session-closed error.
//!
//! The crate has no HTTP or WebSocket layer of its own; adapters implement
//! [`EnvelopeSink`] and [`EnvelopeSource`] and hand them to [`Broker::serve`].
//!
//! # Example
//!
//! ```rust,ignore
//! use evalbridge_core::{Broker, CallContext, SessionSettings};
//! use std::time::Duration;
//!
//! let broker = Broker::new(SessionSettings::default());
//! // elsewhere: broker.serve(sink, source).await;
//!
//! let ctx = CallContext::with_timeout(Duration::from_secs(30));
//! let reply = broker.eval("document.title", &ctx).await?;
//! println!("{}", reply.result());
//! ```

pub mod broker;
pub mod cancel;
pub mod config;
pub mod envelope;
pub mod error;
pub mod feed;
pub mod registry;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use broker::Broker;
pub use cancel::{CallContext, CancellationToken};
pub use config::{BridgeConfig, FeedConfig, FeedSettings, ServerConfig, SessionSettings};
pub use envelope::{CallId, Envelope};
pub use error::{BridgeError, Result};
pub use feed::ChangeFeed;
pub use registry::PendingRegistry;
pub use session::{Session, SessionHandle, SessionId, SessionLoop, SessionReport};
pub use transport::{EnvelopeSink, EnvelopeSource};
