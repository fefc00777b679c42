//! Endpoint identities, addressing, and delivery types shared by all transports.

use std::fmt;

use serde_json::Value;
use tokio::sync::mpsc;

/// Identifier of one subscriber on a channel, assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep-{}", self.0)
    }
}

/// Addressing for a posted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every subscriber on the channel, the sender included.
    Broadcast,
    /// A single subscriber.
    Endpoint(EndpointId),
}

/// A frame as observed by one subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Endpoint that posted the frame. Replies are addressed back to it.
    pub from: EndpointId,
    /// Untyped structured message; may be unrelated traffic.
    pub frame: Value,
}

/// One listening subscription: the assigned endpoint and its inbox.
#[derive(Debug)]
pub struct Subscription {
    pub endpoint: EndpointId,
    pub rx: mpsc::Receiver<Delivery>,
}

/// Error returned when posting a frame fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The target's queue stayed full for the whole send timeout.
    #[error("send to {0} timed out")]
    Timeout(EndpointId),
    /// The target unsubscribed; its receiver was dropped.
    #[error("endpoint {0} is closed")]
    Disconnected(EndpointId),
    /// No subscriber with this id exists.
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),
}
