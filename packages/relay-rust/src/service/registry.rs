//! Handler registry: maps message keys to handlers and runs each invocation
//! through the middleware pipeline.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use opsbridge_core::{RequestMessage, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tower::{Service, ServiceExt};
use tracing::{debug, warn};

use super::config::RelayConfig;
use super::error::{HandlerError, RelayError};
use super::middleware::{build_handler_pipeline, LoadShedLayer};
use super::store::OperationStore;

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// Async unit of work registered under a message key.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: RequestMessage) -> Result<Value, HandlerError>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a handler that receives the raw request.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(RequestMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(RequestMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: RequestMessage) -> Result<Value, HandlerError> {
        (self.f)(request).await
    }
}

/// Handler with a typed payload and result.
struct TypedHandler<P, F> {
    message_type: String,
    f: F,
    _payload: PhantomData<fn(P)>,
}

#[async_trait]
impl<P, R, F, Fut> Handler for TypedHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: RequestMessage) -> Result<Value, HandlerError> {
        let payload: P =
            serde_json::from_value(request.data).map_err(|e| HandlerError::InvalidPayload {
                message_type: self.message_type.clone(),
                reason: e.to_string(),
            })?;
        let result = (self.f)(payload).await?;
        serde_json::to_value(result).map_err(|e| HandlerError::Failed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// A request bound to its handler's operation type and tracked operation id.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub request: RequestMessage,
    pub operation_type: String,
    pub operation_id: String,
}

// ---------------------------------------------------------------------------
// HandlerService
// ---------------------------------------------------------------------------

/// Innermost service of the pipeline: runs the handler on its own task so a
/// panic is captured as [`HandlerError::Panicked`] instead of unwinding into
/// the relay.
#[derive(Clone)]
pub struct HandlerService {
    handler: Arc<dyn Handler>,
}

impl HandlerService {
    #[must_use]
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self { handler }
    }
}

impl std::fmt::Debug for HandlerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerService").finish_non_exhaustive()
    }
}

/// Aborts the handler task if the invocation is dropped (e.g. on timeout).
struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Service<Invocation> for HandlerService {
    type Response = Value;
    type Error = HandlerError;
    type Future = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            let task = tokio::spawn(async move { handler.handle(invocation.request).await });
            let _abort = AbortOnDrop(task.abort_handle());
            match task.await {
                Ok(result) => result,
                Err(join) if join.is_panic() => {
                    Err(HandlerError::Panicked(panic_message(join.into_panic().as_ref())))
                }
                Err(_) => Err(HandlerError::Failed("handler task was cancelled".into())),
            }
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

struct Registration {
    operation_type: String,
    handler: Arc<dyn Handler>,
}

/// Registry of message handlers.
///
/// Each handler is registered under the message key requests carry in `id`
/// and produces operations of a fixed operation type. Every invocation is
/// tracked in the shared [`OperationStore`] and answered with a [`Response`].
pub struct HandlerRegistry {
    handlers: DashMap<String, Registration>,
    store: Arc<OperationStore>,
    /// Shared by every pipeline so the concurrency limit is registry-wide.
    load_shed: LoadShedLayer,
    handler_timeout: Duration,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new(store: Arc<OperationStore>, config: &RelayConfig) -> Self {
        Self {
            handlers: DashMap::new(),
            store,
            load_shed: LoadShedLayer::with_limits(
                config.max_concurrent_handlers,
                config.max_concurrent_per_type,
            ),
            handler_timeout: config.handler_timeout(),
        }
    }

    /// Register `handler` under `message_type`, using the key as operation type.
    pub fn register(&self, message_type: &str, handler: impl Handler) {
        self.register_as(message_type, message_type, handler);
    }

    /// Register `handler` under `message_type`. Replaces any handler already
    /// registered under the same key.
    pub fn register_as(&self, message_type: &str, operation_type: &str, handler: impl Handler) {
        let registration = Registration {
            operation_type: operation_type.to_string(),
            handler: Arc::new(handler),
        };
        if self
            .handlers
            .insert(message_type.to_string(), registration)
            .is_some()
        {
            warn!(%message_type, "replaced existing handler");
        } else {
            debug!(%message_type, %operation_type, "registered handler");
        }
    }

    /// Register a handler whose payload is deserialized into `P` and whose
    /// result is serialized from `R`. A payload that does not deserialize
    /// fails the operation with [`HandlerError::InvalidPayload`].
    pub fn register_typed<P, R, F, Fut>(&self, message_type: &str, operation_type: &str, f: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        self.register_as(
            message_type,
            operation_type,
            TypedHandler {
                message_type: message_type.to_string(),
                f,
                _payload: PhantomData,
            },
        );
    }

    #[must_use]
    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Registered message keys, sorted.
    #[must_use]
    pub fn message_types(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn store(&self) -> &Arc<OperationStore> {
        &self.store
    }

    /// Run the handler registered for `request.id` and return its response.
    ///
    /// The operation id is the request's correlation id, or
    /// `{operation_type}_{now_ms}` when the sender did not supply one.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::HandlerNotFound`] if no handler is registered for
    /// the request's key. Handler failures are reported inside the `Response`.
    pub async fn invoke(&self, request: RequestMessage) -> Result<Response, RelayError> {
        let (operation_type, handler) = {
            let entry = self
                .handlers
                .get(&request.id)
                .ok_or_else(|| RelayError::HandlerNotFound {
                    message_type: request.id.clone(),
                })?;
            (entry.operation_type.clone(), Arc::clone(&entry.handler))
        };

        let operation_id = request.correlation_id.as_ref().map_or_else(
            || format!("{operation_type}_{}", self.store.clock().now()),
            ToString::to_string,
        );

        let pipeline = build_handler_pipeline(
            HandlerService::new(handler),
            Arc::clone(&self.store),
            &self.load_shed,
            self.handler_timeout,
        );
        let invocation = Invocation {
            request,
            operation_type,
            operation_id,
        };
        match pipeline.oneshot(invocation).await {
            Ok(response) => Ok(response),
            Err(never) => match never {},
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("message_types", &self.message_types())
            .field("handler_timeout", &self.handler_timeout)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
