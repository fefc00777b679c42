//! In-process broadcast channel modelled on a browser page's message bus.
//!
//! Every subscriber gets a bounded mpsc inbox. Broadcast frames reach all
//! subscribers (the sender included, like `window.postMessage` to self) and
//! never wait: a full inbox misses the frame. Targeted frames reach exactly
//! one subscriber and wait up to the send timeout for room. Endpoint
//! bookkeeping uses `DashMap` so posting never holds a lock across an await
//! point.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::config::ChannelConfig;
use super::endpoint::{Delivery, EndpointId, Subscription, Target, TransportError};
use crate::traits::ChannelTransport;

/// Shared in-memory channel implementing [`ChannelTransport`].
#[derive(Debug)]
pub struct PageChannel {
    endpoints: DashMap<EndpointId, mpsc::Sender<Delivery>>,
    next_id: AtomicU64,
    config: ChannelConfig,
}

impl PageChannel {
    /// Creates an empty channel.
    ///
    /// Endpoint IDs start at 1 (0 is reserved as "no endpoint").
    #[must_use]
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            endpoints: DashMap::new(),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Returns the number of live subscriptions.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    async fn deliver(
        &self,
        to: EndpointId,
        tx: &mpsc::Sender<Delivery>,
        delivery: Delivery,
    ) -> Result<(), TransportError> {
        match tokio::time::timeout(self.config.send_timeout, tx.send(delivery)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.endpoints.remove(&to);
                Err(TransportError::Disconnected(to))
            }
            Err(_) => Err(TransportError::Timeout(to)),
        }
    }
}

impl Default for PageChannel {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

#[async_trait]
impl ChannelTransport for PageChannel {
    fn subscribe(&self) -> Subscription {
        let endpoint = EndpointId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.endpoint_capacity.max(1));
        self.endpoints.insert(endpoint, tx);
        debug!(%endpoint, "channel subscription opened");
        Subscription { endpoint, rx }
    }

    fn unsubscribe(&self, endpoint: EndpointId) -> bool {
        let removed = self.endpoints.remove(&endpoint).is_some();
        if removed {
            debug!(%endpoint, "channel subscription closed");
        }
        removed
    }

    async fn post(
        &self,
        from: EndpointId,
        frame: Value,
        target: Target,
    ) -> Result<(), TransportError> {
        match target {
            Target::Endpoint(to) => {
                let tx = self
                    .endpoints
                    .get(&to)
                    .map(|entry| entry.value().clone())
                    .ok_or(TransportError::UnknownEndpoint(to))?;
                self.deliver(to, &tx, Delivery { from, frame }).await
            }
            Target::Broadcast => {
                // Snapshot first: pruning a closed endpoint while iterating would deadlock.
                let targets: Vec<(EndpointId, mpsc::Sender<Delivery>)> = self
                    .endpoints
                    .iter()
                    .map(|entry| (*entry.key(), entry.value().clone()))
                    .collect();
                for (to, tx) in targets {
                    let delivery = Delivery {
                        from,
                        frame: frame.clone(),
                    };
                    match tx.try_send(delivery) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!(%from, %to, "inbox full, broadcast frame dropped");
                        }
                        Err(TrySendError::Closed(_)) => {
                            self.endpoints.remove(&to);
                        }
                    }
                }
                Ok(())
            }
        }
    }
}
