//! Message relay: listens on the shared channel, runs registered handlers and
//! posts each result back to the endpoint that sent the request.

use std::sync::Arc;

use opsbridge_core::{peek_id, Frame, ReplyMessage, RequestMessage};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::config::RelayConfig;
use super::lifecycle::{Lifecycle, RelayState};
use super::registry::HandlerRegistry;
use super::store::OperationStore;
use super::worker::{BackgroundWorker, RetentionSweeper, SweepTask};
use crate::channel::{Delivery, EndpointId, Subscription, Target};
use crate::traits::ChannelTransport;

/// Receiving side of the bridge.
///
/// While active, every channel frame whose `id` names a registered handler is
/// handled on its own task, so a slow handler never delays other requests.
/// Frames for unknown keys, replies, and unrelated traffic are ignored.
pub struct MessageRelay {
    registry: Arc<HandlerRegistry>,
    transport: Arc<dyn ChannelTransport>,
    config: RelayConfig,
    lifecycle: Arc<Lifecycle>,
    endpoint: Option<EndpointId>,
    cancel: CancellationToken,
    listener: Option<JoinHandle<()>>,
    sweeper: Option<BackgroundWorker<RetentionSweeper>>,
}

impl MessageRelay {
    #[must_use]
    pub fn new(
        registry: Arc<HandlerRegistry>,
        transport: Arc<dyn ChannelTransport>,
        config: RelayConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            config,
            lifecycle: Arc::new(Lifecycle::new()),
            endpoint: None,
            cancel: CancellationToken::new(),
            listener: None,
            sweeper: None,
        }
    }

    /// Begin listening. Calling `start` on an active relay does nothing, so
    /// requests are never handled twice.
    pub fn start(&mut self) {
        if self.lifecycle.state() != RelayState::Inactive {
            debug!("relay already started");
            return;
        }

        let Subscription { endpoint, mut rx } = self.transport.subscribe();
        let cancel = CancellationToken::new();
        self.cancel = cancel.clone();

        let registry = Arc::clone(&self.registry);
        let transport = Arc::clone(&self.transport);
        let lifecycle = Arc::clone(&self.lifecycle);

        self.listener = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    delivery = rx.recv() => match delivery {
                        Some(delivery) => {
                            route_delivery(&registry, &transport, &lifecycle, endpoint, delivery);
                        }
                        None => break,
                    },
                }
            }
            debug!(%endpoint, "relay listener exited");
        }));

        self.sweeper = Some(BackgroundWorker::start(
            RetentionSweeper::new(
                Arc::clone(self.registry.store()),
                self.config.operation_retention_ms,
            ),
            self.config.sweep_interval_ms,
        ));

        self.endpoint = Some(endpoint);
        self.lifecycle.set_active();
        info!(
            %endpoint,
            handlers = self.registry.message_types().len(),
            "relay started"
        );
    }

    /// Stop listening, then wait (up to the drain timeout) for in-flight
    /// handlers to finish posting their replies. Does nothing when inactive.
    pub async fn stop(&mut self) {
        if self.lifecycle.state() != RelayState::Active {
            return;
        }
        let lifecycle = Arc::clone(&self.lifecycle);
        let _draining = lifecycle.begin_draining();

        if let Some(endpoint) = self.endpoint.take() {
            self.transport.unsubscribe(endpoint);
        }
        self.cancel.cancel();
        if let Some(listener) = self.listener.take() {
            let _ = listener.await;
        }

        let in_flight = self.lifecycle.in_flight_count();
        if !self.lifecycle.wait_for_drain(self.config.drain_timeout()).await {
            warn!(
                in_flight = self.lifecycle.in_flight_count(),
                "drain timeout expired with handlers still running"
            );
        }

        if let Some(mut sweeper) = self.sweeper.take() {
            sweeper.stop().await;
        }
        info!(drained = in_flight, "relay stopped");
    }

    /// Evict finished operations older than the retention window now rather
    /// than on the next sweep tick. Returns how many were evicted. Works on a
    /// stopped relay too, sweeping the store directly.
    pub async fn sweep_now(&self) -> usize {
        if let Some(sweeper) = &self.sweeper {
            let (tx, rx) = oneshot::channel();
            if sweeper.submit(SweepTask::RunNow { evicted: tx }).await.is_ok() {
                if let Ok(evicted) = rx.await {
                    return evicted;
                }
            }
        }
        RetentionSweeper::new(
            Arc::clone(self.registry.store()),
            self.config.operation_retention_ms,
        )
        .sweep()
    }

    #[must_use]
    pub fn state(&self) -> RelayState {
        self.lifecycle.state()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == RelayState::Active
    }

    /// Endpoint the relay listens on while active.
    #[must_use]
    pub fn endpoint(&self) -> Option<EndpointId> {
        self.endpoint
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.lifecycle.in_flight_count()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn store(&self) -> &Arc<OperationStore> {
        self.registry.store()
    }
}

impl Drop for MessageRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if let Some(endpoint) = self.endpoint.take() {
            self.transport.unsubscribe(endpoint);
        }
    }
}

impl std::fmt::Debug for MessageRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRelay")
            .field("state", &self.state())
            .field("endpoint", &self.endpoint)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Classify one delivery and, for a request to a registered handler, spawn
/// its invocation.
fn route_delivery(
    registry: &Arc<HandlerRegistry>,
    transport: &Arc<dyn ChannelTransport>,
    lifecycle: &Lifecycle,
    endpoint: EndpointId,
    delivery: Delivery,
) {
    let Some(message_type) = peek_id(&delivery.frame) else {
        trace!(from = %delivery.from, "ignoring unrelated frame");
        return;
    };
    if !registry.contains(message_type) {
        trace!(%message_type, "no handler registered, ignoring");
        return;
    }

    let request = match Frame::parse(&delivery.frame) {
        Some(Frame::Request(request)) => request,
        // Replies share the request's `id`; they are for dispatchers, not us.
        Some(Frame::Reply(_)) => return,
        None => {
            warn!(%message_type, from = %delivery.from, "malformed request frame");
            return;
        }
    };

    let guard = lifecycle.in_flight_guard();
    let registry = Arc::clone(registry);
    let transport = Arc::clone(transport);
    let reply_to = delivery.from;

    tokio::spawn(async move {
        let _guard = guard;
        handle_request(&registry, transport.as_ref(), endpoint, reply_to, request).await;
    });
}

async fn handle_request(
    registry: &HandlerRegistry,
    transport: &dyn ChannelTransport,
    endpoint: EndpointId,
    reply_to: EndpointId,
    request: RequestMessage,
) {
    let response = match registry.invoke(request.clone()).await {
        Ok(response) => response,
        Err(err) => {
            warn!(message_type = %request.id, error = %err, "request dropped");
            return;
        }
    };

    let reply = ReplyMessage::for_request(&request, response);
    let frame = match serde_json::to_value(&reply) {
        Ok(frame) => frame,
        Err(err) => {
            error!(message_type = %request.id, error = %err, "failed to encode reply");
            return;
        }
    };

    if let Err(err) = transport
        .post(endpoint, frame, Target::Endpoint(reply_to))
        .await
    {
        warn!(
            message_type = %request.id,
            %reply_to,
            error = %err,
            "reply not delivered"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
