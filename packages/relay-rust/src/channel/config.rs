//! Channel configuration types.

use std::time::Duration;

/// Per-endpoint configuration controlling backpressure and send timeouts.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Bounded mpsc channel capacity for deliveries queued to one endpoint.
    pub endpoint_capacity: usize,
    /// Maximum time a targeted post waits when the endpoint's queue is full.
    /// Broadcasts never wait.
    pub send_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint_capacity: 256,
            send_timeout: Duration::from_secs(5),
        }
    }
}
