use std::time::Duration;

/// How the dispatcher matches replies to pending requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorrelationMode {
    /// Match on the per-call correlation id carried through the relay.
    #[default]
    PerCall,
    /// Match on the handler-type `id` only. A reply settles every pending
    /// dispatch of that type, so concurrent same-type calls can receive each
    /// other's results. Kept for compatibility with senders that strip
    /// correlation ids.
    MessageType,
}

/// Relay-level configuration for dispatch, handler execution and retention.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Default time a dispatch waits for its reply, in milliseconds.
    pub default_dispatch_timeout_ms: u64,
    /// Upper bound on a single handler invocation, in milliseconds.
    pub handler_timeout_ms: u64,
    /// Maximum concurrent handler invocations before requests are shed.
    pub max_concurrent_handlers: u32,
    /// Cap on concurrent invocations of one operation type. `None` leaves
    /// only the relay-wide cap.
    pub max_concurrent_per_type: Option<u32>,
    /// Terminal operations older than this are evicted from the store.
    pub operation_retention_ms: u64,
    /// Interval between retention sweeps, in milliseconds.
    pub sweep_interval_ms: u64,
    /// How long `stop()` waits for in-flight handlers, in milliseconds.
    pub drain_timeout_ms: u64,
    pub correlation_mode: CorrelationMode,
}

impl RelayConfig {
    #[must_use]
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.default_dispatch_timeout_ms)
    }

    #[must_use]
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_dispatch_timeout_ms: 30_000,
            handler_timeout_ms: 25_000,
            max_concurrent_handlers: 256,
            max_concurrent_per_type: None,
            operation_retention_ms: 600_000,
            sweep_interval_ms: 60_000,
            drain_timeout_ms: 5_000,
            correlation_mode: CorrelationMode::PerCall,
        }
    }
}
