//! Tracking middleware: the outermost layer of every handler invocation.
//!
//! Tracks the operation before the handler runs, records the terminal status
//! afterwards, and turns the handler's result or error into a uniform
//! [`Response`]. Its error type is `Infallible`: nothing a handler does can
//! escape to the relay.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use opsbridge_core::{ErrorClass, OperationStatus, Response};
use serde_json::{json, Value};
use tower::{Layer, Service};
use tracing::{debug, error, info, warn};

use crate::service::error::HandlerError;
use crate::service::registry::Invocation;
use crate::service::store::OperationStore;

type InnerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

// ---------------------------------------------------------------------------
// TrackingLayer
// ---------------------------------------------------------------------------

/// Tower layer that records each invocation in an [`OperationStore`].
#[derive(Debug, Clone)]
pub struct TrackingLayer {
    store: Arc<OperationStore>,
}

impl TrackingLayer {
    #[must_use]
    pub fn new(store: Arc<OperationStore>) -> Self {
        Self { store }
    }
}

impl<S> Layer<S> for TrackingLayer {
    type Service = TrackingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TrackingService {
            inner,
            store: Arc::clone(&self.store),
            not_ready: None,
        }
    }
}

// ---------------------------------------------------------------------------
// TrackingService
// ---------------------------------------------------------------------------

/// Service wrapper producing a `Response` for every invocation.
#[derive(Debug)]
pub struct TrackingService<S> {
    inner: S,
    store: Arc<OperationStore>,
    /// Readiness failure of the inner stack, reported by the next `call`.
    not_ready: Option<HandlerError>,
}

impl<S> Service<Invocation> for TrackingService<S>
where
    S: Service<Invocation, Response = Value, Error = HandlerError> + Send,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match self.inner.poll_ready(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(err)) => {
                self.not_ready = Some(err);
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let store = Arc::clone(&self.store);
        let clock = store.clock();
        let operation_id = invocation.operation_id.clone();
        let operation_type = invocation.operation_type.clone();
        let message_type = invocation.request.id.clone();
        let input = match &invocation.request.data {
            Value::Null => None,
            data => Some(data.clone()),
        };

        debug!(%message_type, %operation_id, "processing message");

        if let Err(err) = store.track(&operation_id, &operation_type, input) {
            warn!(%message_type, %operation_id, error = %err, "operation rejected");
            let response = Response::failed(
                operation_type,
                operation_id,
                err.to_string(),
                ErrorClass::Permanent,
                clock.now(),
            );
            return Box::pin(async move { Ok(response) });
        }

        let fut: InnerFuture = match self.not_ready.take() {
            Some(err) => Box::pin(async move { Err(err) }),
            None => Box::pin(self.inner.call(invocation)),
        };

        Box::pin(async move {
            let result = fut.await;
            let now = clock.now();
            let response = match result {
                Ok(value) => {
                    if let Err(err) =
                        store.update(&operation_id, OperationStatus::Completed, Some(value.clone()))
                    {
                        warn!(%operation_id, error = %err, "operation update failed");
                    }
                    info!(%message_type, %operation_id, "completed successfully");
                    Response::completed(operation_type, operation_id, value, now)
                }
                Err(err) => {
                    let message = err.message();
                    error!(%message_type, %operation_id, error = %message, "handler failed");
                    if let Err(err) = store.update(
                        &operation_id,
                        OperationStatus::Failed,
                        Some(json!({ "error": message })),
                    ) {
                        warn!(%operation_id, error = %err, "operation update failed");
                    }
                    Response::failed(operation_type, operation_id, message, err.class(), now)
                }
            };
            Ok(response)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
