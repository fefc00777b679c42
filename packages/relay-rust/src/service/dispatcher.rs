//! Request dispatcher: the sending side of the bridge.
//!
//! Each dispatch gets a fresh [`CorrelationId`], is recorded in the pending
//! table, broadcast on the channel, and settled by the first matching reply,
//! its deadline, or its cancellation token, whichever comes first. The entry
//! is removed from the pending table on every exit path, so a reply that
//! arrives late finds nothing to settle and is counted as a mismatch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use opsbridge_core::{CorrelationId, Frame, MessageKind, ReplyMessage, RequestMessage};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::{CorrelationMode, RelayConfig};
use super::error::{RelayError, UNKNOWN_ERROR};
use crate::channel::{EndpointId, Subscription, Target};
use crate::traits::ChannelTransport;

/// Per-call overrides for [`RequestDispatcher::dispatch_with`].
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Reply deadline. Defaults to the dispatcher's configured timeout.
    pub timeout: Option<Duration>,
    /// Abandons the wait when cancelled. The handler itself keeps running.
    pub cancel: Option<CancellationToken>,
}

impl DispatchOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

struct PendingReply {
    message_type: String,
    tx: oneshot::Sender<ReplyMessage>,
}

/// State shared between dispatch calls and the reply reader task.
struct PendingTable {
    entries: DashMap<CorrelationId, PendingReply>,
    mode: CorrelationMode,
    mismatched: AtomicU64,
}

impl PendingTable {
    fn route(&self, frame: &Value) {
        // Our own broadcast requests echo back to us; only replies matter.
        let Some(Frame::Reply(reply)) = Frame::parse(frame) else {
            return;
        };

        match self.mode {
            CorrelationMode::PerCall => {
                let removed = reply.correlation_id.as_ref().and_then(|cid| {
                    self.entries
                        .remove_if(cid, |_, pending| pending.message_type == reply.id)
                });
                match removed {
                    Some((_, pending)) => {
                        let _ = pending.tx.send(reply);
                    }
                    None => self.mismatch(&reply),
                }
            }
            CorrelationMode::MessageType => {
                let matching: Vec<CorrelationId> = self
                    .entries
                    .iter()
                    .filter(|entry| entry.message_type == reply.id)
                    .map(|entry| entry.key().clone())
                    .collect();
                if matching.is_empty() {
                    self.mismatch(&reply);
                    return;
                }
                for cid in matching {
                    if let Some((_, pending)) = self.entries.remove(&cid) {
                        let _ = pending.tx.send(reply.clone());
                    }
                }
            }
        }
    }

    fn mismatch(&self, reply: &ReplyMessage) {
        self.mismatched.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("opsbridge_correlation_mismatch_total").increment(1);
        warn!(
            message_type = %reply.id,
            correlation_id = ?reply.correlation_id.as_ref().map(CorrelationId::as_str),
            "correlation mismatch: reply has no pending request"
        );
    }
}

/// Removes a pending entry when the dispatch that owns it returns.
struct PendingGuard<'a> {
    entries: &'a DashMap<CorrelationId, PendingReply>,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.entries.remove(&self.id);
    }
}

/// Sends requests over a [`ChannelTransport`] and awaits their replies.
pub struct RequestDispatcher {
    transport: Arc<dyn ChannelTransport>,
    endpoint: EndpointId,
    pending: Arc<PendingTable>,
    default_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RequestDispatcher {
    /// Subscribe to `transport` and start routing replies.
    #[must_use]
    pub fn connect(transport: Arc<dyn ChannelTransport>, config: &RelayConfig) -> Self {
        let Subscription { endpoint, mut rx } = transport.subscribe();
        let pending = Arc::new(PendingTable {
            entries: DashMap::new(),
            mode: config.correlation_mode,
            mismatched: AtomicU64::new(0),
        });

        let table = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                table.route(&delivery.frame);
            }
        });

        debug!(%endpoint, mode = ?config.correlation_mode, "dispatcher connected");

        Self {
            transport,
            endpoint,
            pending,
            default_timeout: config.dispatch_timeout(),
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        }
    }

    /// Dispatch with the default timeout.
    ///
    /// # Errors
    ///
    /// See [`dispatch_with`](Self::dispatch_with).
    pub async fn dispatch(&self, message_type: &str, data: Value) -> Result<Value, RelayError> {
        self.dispatch_with(message_type, data, DispatchOptions::default())
            .await
    }

    /// Send `data` to the handler registered under `message_type` and wait
    /// for its reply. Returns the reply's data (`null` when absent).
    ///
    /// # Errors
    ///
    /// - [`RelayError::Remote`] if the handler failed
    /// - [`RelayError::Timeout`] if no reply arrived in time
    /// - [`RelayError::Cancelled`] if the cancel token fired first
    /// - [`RelayError::Transport`] if the request could not be posted
    /// - [`RelayError::ChannelClosed`] if the dispatcher was closed
    pub async fn dispatch_with(
        &self,
        message_type: &str,
        data: Value,
        options: DispatchOptions,
    ) -> Result<Value, RelayError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::ChannelClosed);
        }

        // The deadline covers posting as well as waiting for the reply.
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;
        let cancel = options.cancel.unwrap_or_default();

        let correlation_id = CorrelationId::generate();
        let request =
            RequestMessage::new(message_type, data).with_correlation(correlation_id.clone());
        let frame = serde_json::to_value(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.entries.insert(
            correlation_id.clone(),
            PendingReply {
                message_type: message_type.to_string(),
                tx,
            },
        );
        let _guard = PendingGuard {
            entries: &self.pending.entries,
            id: correlation_id.clone(),
        };
        // A concurrent close() may have cleared the table before our insert.
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::ChannelClosed);
        }

        debug!(%message_type, %correlation_id, "dispatching");
        let exchange = async {
            self.transport
                .post(self.endpoint, frame, Target::Broadcast)
                .await
                .map_err(|source| RelayError::Transport {
                    message_type: message_type.to_string(),
                    source,
                })?;
            match rx.await {
                Ok(reply) => settle(reply),
                Err(_) => Err(RelayError::ChannelClosed),
            }
        };

        let result = tokio::select! {
            biased;
            settled = exchange => settled,
            () = tokio::time::sleep_until(deadline) => Err(RelayError::Timeout {
                message_type: message_type.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            () = cancel.cancelled() => Err(RelayError::Cancelled {
                message_type: message_type.to_string(),
            }),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(RelayError::Timeout { .. }) => "timeout",
            Err(RelayError::Cancelled { .. }) => "cancelled",
            Err(_) => "error",
        };
        metrics::counter!("opsbridge_dispatch_total", "outcome" => outcome).increment(1);
        if let Err(err) = &result {
            debug!(%message_type, %correlation_id, error = %err, "dispatch failed");
        }
        result
    }

    /// Dispatch a typed payload to a built-in message kind and decode the
    /// reply data as `R`.
    ///
    /// # Errors
    ///
    /// As [`dispatch`](Self::dispatch), plus [`RelayError::Codec`] if the
    /// payload or reply data does not (de)serialize.
    pub async fn dispatch_typed<P, R>(&self, kind: MessageKind, payload: &P) -> Result<R, RelayError>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let data = serde_json::to_value(payload)?;
        let value = self.dispatch(kind.message_type(), data).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Unsubscribe and fail every pending dispatch with
    /// [`RelayError::ChannelClosed`]. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.unsubscribe(self.endpoint);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        // Dropping the senders wakes every waiter.
        self.pending.entries.clear();
        debug!(endpoint = %self.endpoint, "dispatcher closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// Number of dispatches awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.entries.len()
    }

    /// Replies that matched no pending dispatch.
    #[must_use]
    pub fn mismatched_replies(&self) -> u64 {
        self.pending.mismatched.load(Ordering::Relaxed)
    }
}

fn settle(reply: ReplyMessage) -> Result<Value, RelayError> {
    if reply.success {
        return Ok(reply.data.unwrap_or(Value::Null));
    }
    let message = reply
        .error
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_ERROR.to_string());
    Err(RelayError::Remote {
        message,
        class: reply.response.error_class,
    })
}

impl Drop for RequestDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("endpoint", &self.endpoint)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
