//! Admission control for handler invocations.
//!
//! Two budgets gate every invocation: a relay-wide cap on concurrent
//! handlers, and an optional cap per operation type so one busy type (a
//! burst of `file_save` requests, say) cannot starve the others. An
//! invocation that finds either budget spent is answered at once with
//! `HandlerError::Overloaded`, which the tracking layer turns into a
//! transient failure the dispatcher may retry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::{Layer, Service};
use tracing::warn;

use crate::service::error::HandlerError;
use crate::service::registry::Invocation;

/// Which budget rejected an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShedScope {
    Relay,
    OperationType,
}

impl ShedScope {
    fn as_str(self) -> &'static str {
        match self {
            Self::Relay => "relay",
            Self::OperationType => "operation_type",
        }
    }
}

/// Permits held for the lifetime of one admitted invocation.
#[derive(Debug)]
struct Admission {
    _relay: OwnedSemaphorePermit,
    _per_type: Option<OwnedSemaphorePermit>,
}

#[derive(Debug)]
struct Budgets {
    relay: Arc<Semaphore>,
    per_type: DashMap<String, Arc<Semaphore>>,
    per_type_limit: Option<u32>,
}

impl Budgets {
    fn admit(&self, operation_type: &str) -> Result<Admission, ShedScope> {
        let relay = Arc::clone(&self.relay)
            .try_acquire_owned()
            .map_err(|_| ShedScope::Relay)?;
        let per_type = match self.per_type_limit {
            Some(limit) => {
                let semaphore = Arc::clone(
                    self.per_type
                        .entry(operation_type.to_string())
                        .or_insert_with(|| Arc::new(Semaphore::new(limit as usize)))
                        .value(),
                );
                // Dropping `relay` on this path hands the relay permit back.
                Some(
                    semaphore
                        .try_acquire_owned()
                        .map_err(|_| ShedScope::OperationType)?,
                )
            }
            None => None,
        };
        Ok(Admission {
            _relay: relay,
            _per_type: per_type,
        })
    }
}

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer enforcing the relay-wide and per-type concurrency budgets.
///
/// Clones share their budgets, so the registry builds one layer and hands a
/// clone to every pipeline.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    budgets: Arc<Budgets>,
}

impl LoadShedLayer {
    /// Relay-wide budget only.
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self::with_limits(max_concurrent, None)
    }

    /// Relay-wide budget plus, when `per_type` is set, a cap on concurrent
    /// invocations of any single operation type.
    #[must_use]
    pub fn with_limits(max_concurrent: u32, per_type: Option<u32>) -> Self {
        Self {
            budgets: Arc::new(Budgets {
                relay: Arc::new(Semaphore::new(max_concurrent as usize)),
                per_type: DashMap::new(),
                per_type_limit: per_type,
            }),
        }
    }

    /// Free slots in the relay-wide budget.
    #[must_use]
    pub fn available(&self) -> usize {
        self.budgets.relay.available_permits()
    }

    /// Free slots for `operation_type`, or `None` without a per-type cap.
    #[must_use]
    pub fn available_for(&self, operation_type: &str) -> Option<usize> {
        let limit = self.budgets.per_type_limit?;
        Some(
            self.budgets
                .per_type
                .get(operation_type)
                .map_or(limit as usize, |s| s.available_permits()),
        )
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            budgets: Arc::clone(&self.budgets),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

/// Service wrapper that admits or sheds each invocation.
#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    budgets: Arc<Budgets>,
}

impl<S> Service<Invocation> for LoadShedService<S>
where
    S: Service<Invocation, Response = Value, Error = HandlerError> + Send,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = HandlerError;
    type Future = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let admission = match self.budgets.admit(&invocation.operation_type) {
            Ok(admission) => admission,
            Err(scope) => {
                warn!(
                    operation_type = %invocation.operation_type,
                    operation_id = %invocation.operation_id,
                    scope = scope.as_str(),
                    "invocation shed"
                );
                metrics::counter!(
                    "opsbridge_handler_shed_total",
                    "operation_type" => invocation.operation_type,
                    "scope" => scope.as_str()
                )
                .increment(1);
                return Box::pin(async { Err(HandlerError::Overloaded) });
            }
        };

        let fut = self.inner.call(invocation);
        Box::pin(async move {
            let result = fut.await;
            drop(admission);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
