//! Page-level message channel: endpoint registry, addressing, and delivery.

pub mod config;
pub mod endpoint;
pub mod page;

pub use config::ChannelConfig;
pub use endpoint::{Delivery, EndpointId, Subscription, Target, TransportError};
pub use page::PageChannel;
