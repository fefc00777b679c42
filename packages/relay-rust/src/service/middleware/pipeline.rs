//! Pipeline composition: combines all middleware layers around one handler.

use std::sync::Arc;
use std::time::Duration;

use tower::ServiceBuilder;

use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use super::timeout::{TimeoutLayer, TimeoutService};
use super::tracking::{TrackingLayer, TrackingService};
use crate::service::registry::HandlerService;
use crate::service::store::OperationStore;

/// Fully layered handler service produced by [`build_handler_pipeline`].
pub type HandlerPipeline =
    TrackingService<LoadShedService<TimeoutService<MetricsService<HandlerService>>>>;

/// Wrap a handler with the invocation middleware.
///
/// Layer order (outermost to innermost):
/// 1. `TrackingLayer` -- track the operation, shape every outcome into a `Response`
/// 2. `LoadShedLayer` -- shed when the relay or the operation type is saturated
/// 3. `TimeoutLayer` -- bound the handler's run time
/// 4. `MetricsLayer` -- record timing and outcome (closest to the handler)
#[must_use]
pub fn build_handler_pipeline(
    handler: HandlerService,
    store: Arc<OperationStore>,
    load_shed: &LoadShedLayer,
    handler_timeout: Duration,
) -> HandlerPipeline {
    ServiceBuilder::new()
        .layer(TrackingLayer::new(store))
        .layer(load_shed.clone())
        .layer(TimeoutLayer::new(handler_timeout))
        .layer(MetricsLayer)
        .service(handler)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use opsbridge_core::{ErrorClass, OperationStatus, RequestMessage};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::service::error::HandlerError;
    use crate::service::registry::{handler_fn, Invocation};

    fn invocation(operation_id: &str) -> Invocation {
        Invocation {
            request: RequestMessage::new("echo_ready", json!({"n": 1})),
            operation_type: "echo".to_string(),
            operation_id: operation_id.to_string(),
        }
    }

    #[tokio::test]
    async fn pipeline_routes_through_all_layers() {
        let store = Arc::new(OperationStore::default());
        let handler = HandlerService::new(Arc::new(handler_fn(|req: RequestMessage| async move {
            Ok(req.data)
        })));

        let svc = build_handler_pipeline(
            handler,
            store.clone(),
            &LoadShedLayer::new(4),
            Duration::from_secs(1),
        );
        let response = svc.oneshot(invocation("echo_1")).await.unwrap();

        assert!(response.success);
        assert_eq!(response.operation_type, "echo");
        assert_eq!(response.data, Some(json!({"n": 1})));
        assert_eq!(
            store.get("echo_1").unwrap().status,
            OperationStatus::Completed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_fails_with_timeout_response() {
        let store = Arc::new(OperationStore::default());
        let handler = HandlerService::new(Arc::new(handler_fn(|_req| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, HandlerError>(json!(null))
        })));

        let svc = build_handler_pipeline(
            handler,
            store.clone(),
            &LoadShedLayer::new(4),
            Duration::from_millis(100),
        );
        let response = svc.oneshot(invocation("slow_1")).await.unwrap();

        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("handler timed out after 100ms"));
        assert_eq!(response.error_class, Some(ErrorClass::Transient));
        assert_eq!(store.get("slow_1").unwrap().status, OperationStatus::Failed);
    }
}
