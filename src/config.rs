//! Public engine configuration.
//!
//! This type intentionally contains no transport-specific concepts
//! (socket options, TLS, listen addresses). The transport layer is an
//! external collaborator; this config covers only the protocol engine's
//! timing and policy knobs.

use std::time::Duration;

/// Timing and policy configuration shared by client, server, and channels.
#[derive(Debug, Clone)]
pub struct SockConfig {
    /// How long an outbound correlated call waits for its RETURN before
    /// resolving to [`CallOutcome::TimedOut`](crate::CallOutcome::TimedOut).
    ///
    /// Default: 30 seconds.
    pub return_timeout: Duration,

    /// How long a call issued while disconnected waits for the client to
    /// reach CONNECTED before the reconnect-or-fail policy kicks in.
    ///
    /// Default: 7.5 seconds.
    pub connect_guard_timeout: Duration,

    /// Bound on each awaited handshake step.
    ///
    /// Default: 6.5 seconds.
    pub handshake_step_timeout: Duration,

    /// Delay before the client sends the first handshake packet, giving the
    /// freshly opened transport time to settle.
    ///
    /// Default: 100 milliseconds.
    pub settle_delay: Duration,

    /// Whether the client reconnects automatically on disconnect and on an
    /// expired pre-call guard.
    ///
    /// Reconnects are immediate and unconditional, matching the reference
    /// implementation. Default: `true`.
    pub auto_reconnect: bool,

    /// Maximum number of concurrently in-flight sends during a server
    /// broadcast.
    ///
    /// Default: 100.
    pub fanout_limit: usize,
}

impl Default for SockConfig {
    fn default() -> Self {
        // ---
        Self {
            return_timeout: Duration::from_secs(30),
            connect_guard_timeout: Duration::from_millis(7500),
            handshake_step_timeout: Duration::from_millis(6500),
            settle_delay: Duration::from_millis(100),
            auto_reconnect: true,
            fanout_limit: 100,
        }
    }
}

impl SockConfig {
    /// Create a config with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-call return timeout.
    pub fn with_return_timeout(mut self, timeout: Duration) -> Self {
        self.return_timeout = timeout;
        self
    }

    /// Set the pre-call connected-guard window.
    pub fn with_connect_guard_timeout(mut self, timeout: Duration) -> Self {
        self.connect_guard_timeout = timeout;
        self
    }

    /// Set the per-step handshake bound.
    pub fn with_handshake_step_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_step_timeout = timeout;
        self
    }

    /// Set the transport settle delay before the first handshake packet.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Enable or disable automatic reconnect.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the broadcast fan-out concurrency cap.
    pub fn with_fanout_limit(mut self, limit: usize) -> Self {
        self.fanout_limit = limit;
        self
    }
}
