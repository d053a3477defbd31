//! Centralized configuration for evalbridge.
//!
//! Every default lives here as an associated constant. Components take a
//! settings struct built from these constants and overridable at runtime.

use std::time::Duration;

/// Correlation and session timing.
pub struct BridgeConfig;

impl BridgeConfig {
    /// How long an unclaimed pending call is kept before it resolves with `Timeout`.
    pub const PENDING_CALL_TIMEOUT: Duration = Duration::from_secs(15 * 60);
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
    /// How long a keepalive ping may wait for its reply.
    pub const KEEPALIVE_REPLY_TIMEOUT: Duration = Duration::from_secs(60);
    /// Capacity of the hand-off queue between producers and the outbound loop.
    pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;
}

/// Change feed configuration.
pub struct FeedConfig;

impl FeedConfig {
    pub const RESCAN_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_PATTERN: &'static str = "./*.js";
}

/// HTTP/WebSocket endpoint configuration.
pub struct ServerConfig;

impl ServerConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 1337;
    pub const EVAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const WS_PATH: &'static str = "/ws";
    pub const EVAL_PATH: &'static str = "/eval";
    pub const HEALTH_PATH: &'static str = "/health";
    /// Largest WebSocket frame accepted from the peer.
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
}

/// Runtime settings for one session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub pending_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub outbound_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            pending_timeout: BridgeConfig::PENDING_CALL_TIMEOUT,
            keepalive_interval: BridgeConfig::KEEPALIVE_INTERVAL,
            keepalive_timeout: BridgeConfig::KEEPALIVE_REPLY_TIMEOUT,
            outbound_capacity: BridgeConfig::OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

impl SessionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = timeout;
        self
    }

    /// Set the outbound queue capacity. Zero is bumped to one.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }
}

/// Runtime settings for the change feed.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub pattern: String,
    pub rescan_interval: Duration,
    /// Upper bound for each fire-and-forget eval submission.
    pub submit_timeout: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            pattern: FeedConfig::DEFAULT_PATTERN.to_string(),
            rescan_interval: FeedConfig::RESCAN_INTERVAL,
            submit_timeout: BridgeConfig::PENDING_CALL_TIMEOUT,
        }
    }
}

impl FeedSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    pub fn with_rescan_interval(mut self, interval: Duration) -> Self {
        self.rescan_interval = interval;
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }
}
