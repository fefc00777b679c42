//! End-to-end request/reply behaviour over an in-process channel.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opsbridge_core::{ErrorClass, OperationStatus, ReplyMessage, RequestMessage};
use opsbridge_relay::channel::Target;
use opsbridge_relay::service::{handler_fn, run_with_retry, HandlerError};
use opsbridge_relay::traits::BridgeError;
use opsbridge_relay::{
    ChannelTransport, CorrelationMode, DispatchOptions, HandlerRegistry, MessageRelay,
    OperationStore, PageChannel, RelayConfig, RelayError, RequestDispatcher,
};
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Harness {
    channel: Arc<PageChannel>,
    relay: MessageRelay,
    dispatcher: Arc<RequestDispatcher>,
    store: Arc<OperationStore>,
}

impl Harness {
    fn new(config: RelayConfig, register: impl FnOnce(&HandlerRegistry)) -> Self {
        let channel = Arc::new(PageChannel::default());
        let store = Arc::new(OperationStore::default());
        let registry = Arc::new(HandlerRegistry::new(store.clone(), &config));
        register(&registry);

        let mut relay = MessageRelay::new(registry, channel.clone(), config.clone());
        relay.start();
        let dispatcher = Arc::new(RequestDispatcher::connect(channel.clone(), &config));
        Self {
            channel,
            relay,
            dispatcher,
            store,
        }
    }

    async fn shutdown(mut self) {
        self.dispatcher.close();
        self.relay.stop().await;
    }
}

fn with_timeout(ms: u64) -> DispatchOptions {
    DispatchOptions::default().with_timeout(Duration::from_millis(ms))
}

/// Handler that echoes `data.value` after sleeping `data.delay_ms`.
fn register_delayed_echo(registry: &HandlerRegistry) {
    registry.register(
        "create",
        handler_fn(|req: RequestMessage| async move {
            let delay = req.data["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(json!({ "created": req.data["value"] }))
        }),
    );
}

#[tokio::test]
async fn ping_resolves_with_handler_result() {
    let h = Harness::new(RelayConfig::default(), |registry| {
        registry.register("ping", handler_fn(|_req| async { Ok(json!({"pong": true})) }));
    });

    let value = h.dispatcher.dispatch("ping", json!({})).await.unwrap();
    assert_eq!(value, json!({"pong": true}));

    let ops = h.store.snapshot();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].operation_type, "ping");
    assert_eq!(ops[0].status, OperationStatus::Completed);
    h.shutdown().await;
}

#[tokio::test]
async fn failing_handler_rejects_with_its_message() {
    let h = Harness::new(RelayConfig::default(), |registry| {
        registry.register(
            "boom",
            handler_fn(|_req| async { Err(HandlerError::Failed("bad".into())) }),
        );
    });

    let err = h.dispatcher.dispatch("boom", json!({})).await.unwrap_err();
    assert_eq!(err.to_string(), "bad");
    assert!(matches!(err, RelayError::Remote { class: Some(ErrorClass::Transient), .. }));
    assert_eq!(h.store.snapshot()[0].status, OperationStatus::Failed);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unregistered_type_times_out_after_configured_deadline() {
    let h = Harness::new(RelayConfig::default(), |_| {});

    let start = Instant::now();
    let err = h
        .dispatcher
        .dispatch_with("unregistered", json!({}), with_timeout(50))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(h.dispatcher.pending_count(), 0);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn idle_listener_on_shared_channel_does_not_delay_deadline() {
    let h = Harness::new(RelayConfig::default(), |_| {});
    // An unrelated consumer that never drains its inbox.
    let idle = h.channel.subscribe();
    for n in 0..256 {
        h.channel
            .post(idle.endpoint, json!({"n": n}), Target::Endpoint(idle.endpoint))
            .await
            .unwrap();
    }

    let start = Instant::now();
    let err = h
        .dispatcher
        .dispatch_with("unregistered", json!({}), with_timeout(50))
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(
        err.to_string(),
        "Message timeout: unregistered (no reply within 50ms)"
    );
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(100));
    drop(idle);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn default_timeout_applies_when_no_override() {
    let config = RelayConfig {
        default_dispatch_timeout_ms: 200,
        ..RelayConfig::default()
    };
    let h = Harness::new(config, |_| {});

    let start = Instant::now();
    let err = h.dispatcher.dispatch("nobody_home", Value::Null).await.unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(
        err.to_string(),
        "Message timeout: nobody_home (no reply within 200ms)"
    );
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(400));
    h.shutdown().await;
}

#[tokio::test]
async fn store_tracks_and_completes_operation() {
    let store = OperationStore::default();
    store.track("op1", "team_create", None).unwrap();
    store
        .update("op1", OperationStatus::Completed, Some(json!({"teamId": "T1"})))
        .unwrap();

    let op = store.get("op1").unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.data, Some(json!({"teamId": "T1"})));
}

#[tokio::test(start_paused = true)]
async fn concurrent_same_type_dispatches_get_their_own_results() {
    let h = Harness::new(RelayConfig::default(), register_delayed_echo);

    // A replies last, so a type-only matcher would hand B's result to A.
    let (a, b) = tokio::join!(
        h.dispatcher.dispatch("create", json!({"value": "A", "delay_ms": 50})),
        h.dispatcher.dispatch("create", json!({"value": "B", "delay_ms": 10})),
    );

    assert_eq!(a.unwrap(), json!({"created": "A"}));
    assert_eq!(b.unwrap(), json!({"created": "B"}));
    assert_eq!(h.dispatcher.mismatched_replies(), 0);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn type_only_matching_cross_resolves_concurrent_calls() {
    let config = RelayConfig {
        correlation_mode: CorrelationMode::MessageType,
        ..RelayConfig::default()
    };
    let h = Harness::new(config, register_delayed_echo);

    let (a, b) = tokio::join!(
        h.dispatcher.dispatch("create", json!({"value": "A", "delay_ms": 10})),
        h.dispatcher.dispatch("create", json!({"value": "B", "delay_ms": 50})),
    );

    // Both calls settle on the first reply; B's own result is lost.
    assert_eq!(a.unwrap(), json!({"created": "A"}));
    assert_eq!(b.unwrap(), json!({"created": "A"}));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.dispatcher.mismatched_replies(), 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn late_reply_after_timeout_is_dropped() {
    let h = Harness::new(RelayConfig::default(), register_delayed_echo);

    let err = h
        .dispatcher
        .dispatch_with("create", json!({"value": "late", "delay_ms": 200}), with_timeout(50))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.dispatcher.mismatched_replies(), 1);
    assert_eq!(h.dispatcher.pending_count(), 0);
    // The handler itself still ran to completion.
    assert_eq!(h.store.snapshot()[0].status, OperationStatus::Completed);
    h.shutdown().await;
}

#[tokio::test]
async fn duplicate_reply_settles_only_once() {
    let h = Harness::new(RelayConfig::default(), |registry| {
        registry.register("ping", handler_fn(|_req| async { Ok(json!("pong")) }));
    });
    let mut spy = h.channel.subscribe();

    assert_eq!(h.dispatcher.dispatch("ping", Value::Null).await.unwrap(), json!("pong"));

    // Replay the request's reply a second time.
    let request: RequestMessage = loop {
        let delivery = spy.rx.recv().await.unwrap();
        if let Ok(request) = serde_json::from_value::<RequestMessage>(delivery.frame) {
            break request;
        }
    };
    let replay = ReplyMessage::for_request(
        &request,
        opsbridge_core::Response::completed("ping", "again", json!("again"), 0),
    );
    h.channel
        .post(
            spy.endpoint,
            serde_json::to_value(&replay).unwrap(),
            Target::Endpoint(h.dispatcher.endpoint()),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.dispatcher.mismatched_replies(), 1);
    h.shutdown().await;
}

#[tokio::test]
async fn every_failure_shape_yields_non_empty_error() {
    let h = Harness::new(RelayConfig::default(), |registry| {
        registry.register(
            "err",
            handler_fn(|_req| async { Err(HandlerError::Failed("bad".into())) }),
        );
        registry.register(
            "empty",
            handler_fn(|_req| async { Err(HandlerError::Failed(String::new())) }),
        );
        registry.register(
            "anyhow",
            handler_fn(|_req| async { Err(HandlerError::from(anyhow::anyhow!("io failed"))) }),
        );
        registry.register(
            "panic",
            handler_fn(|_req| async {
                if true {
                    panic!("boom");
                }
                Ok(Value::Null)
            }),
        );
        registry.register("ping", handler_fn(|_req| async { Ok(json!("pong")) }));
    });

    let expected = [
        ("err", "bad"),
        ("empty", "Unknown error"),
        ("anyhow", "io failed"),
        ("panic", "handler panicked: boom"),
    ];
    for (message_type, message) in expected {
        let err = h.dispatcher.dispatch(message_type, Value::Null).await.unwrap_err();
        assert_eq!(err.to_string(), message, "{message_type}");
    }

    // The relay keeps serving after every failure.
    assert_eq!(h.dispatcher.dispatch("ping", Value::Null).await.unwrap(), json!("pong"));
    assert!(h.relay.is_active());
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retry_backs_off_linearly_and_returns_last_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let start = Instant::now();

    let err = run_with_retry(
        move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err::<(), _>(BridgeError::Transient(format!("attempt {n}"))) }
        },
        3,
        100,
    )
    .await
    .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(err.to_string(), "attempt 3");
    assert_eq!(err.into_inner(), BridgeError::Transient("attempt 3".into()));
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn cancelled_dispatch_leaves_handler_running() {
    let h = Harness::new(RelayConfig::default(), register_delayed_echo);
    let cancel = CancellationToken::new();

    let call = {
        let dispatcher = h.dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            dispatcher
                .dispatch_with(
                    "create",
                    json!({"value": "x", "delay_ms": 100}),
                    DispatchOptions::default().with_cancel(cancel),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    assert!(matches!(call.await.unwrap(), Err(RelayError::Cancelled { .. })));
    assert_eq!(h.dispatcher.pending_count(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let ops = h.store.snapshot();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].status, OperationStatus::Completed);
    h.shutdown().await;
}

#[tokio::test]
async fn reused_correlation_id_is_rejected_without_rerunning_handler() {
    let runs = Arc::new(AtomicU32::new(0));
    let h = Harness::new(RelayConfig::default(), |registry| {
        let runs = runs.clone();
        registry.register(
            "count",
            handler_fn(move |_req| {
                runs.fetch_add(1, Ordering::SeqCst);
                async { Ok(Value::Null) }
            }),
        );
    });
    let mut caller = h.channel.subscribe();

    let request = RequestMessage::new("count", Value::Null).with_correlation("dup".into());
    let frame = serde_json::to_value(&request).unwrap();
    let mut replies = Vec::new();
    for _ in 0..2 {
        h.channel
            .post(caller.endpoint, frame.clone(), Target::Broadcast)
            .await
            .unwrap();
    }
    while replies.len() < 2 {
        let delivery = caller.rx.recv().await.unwrap();
        if let Ok(reply) = serde_json::from_value::<ReplyMessage>(delivery.frame) {
            replies.push(reply);
        }
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let failures: Vec<_> = replies.iter().filter(|r| !r.success).collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].error.as_deref(),
        Some("operation dup is already tracked")
    );
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn slow_handler_is_bounded_by_handler_timeout() {
    let config = RelayConfig {
        handler_timeout_ms: 50,
        ..RelayConfig::default()
    };
    let h = Harness::new(config, register_delayed_echo);

    let err = h
        .dispatcher
        .dispatch("create", json!({"value": "x", "delay_ms": 1_000}))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "handler timed out after 50ms");
    assert!(err.is_retryable());
    assert_eq!(h.store.snapshot()[0].status, OperationStatus::Failed);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn saturated_relay_sheds_load() {
    let config = RelayConfig {
        max_concurrent_handlers: 1,
        ..RelayConfig::default()
    };
    let h = Harness::new(config, register_delayed_echo);

    let (first, second) = tokio::join!(
        h.dispatcher.dispatch("create", json!({"value": 1, "delay_ms": 100})),
        h.dispatcher.dispatch("create", json!({"value": 2, "delay_ms": 100})),
    );

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    let shed = outcomes.into_iter().find_map(Result::err).unwrap();
    assert_eq!(shed.to_string(), "relay overloaded, try again later");
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shed_request_is_a_transient_failure_that_succeeds_on_retry() {
    let config = RelayConfig {
        max_concurrent_handlers: 1,
        ..RelayConfig::default()
    };
    let h = Harness::new(config, register_delayed_echo);

    let busy = tokio::spawn({
        let dispatcher = h.dispatcher.clone();
        async move {
            dispatcher
                .dispatch("create", json!({"value": "busy", "delay_ms": 150}))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    match h.dispatcher.dispatch("create", json!({"value": "x"})).await {
        Err(RelayError::Remote { message, class }) => {
            assert_eq!(message, "relay overloaded, try again later");
            assert_eq!(class, Some(ErrorClass::Transient));
        }
        other => panic!("expected a shed reply, got {other:?}"),
    }

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let dispatcher = h.dispatcher.clone();
    let value = run_with_retry(
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch("create", json!({"value": "y"})).await }
        },
        3,
        200,
    )
    .await
    .unwrap();

    assert_eq!(value, json!({"created": "y"}));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(busy.await.unwrap().unwrap(), json!({"created": "busy"}));
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn per_type_cap_sheds_only_the_busy_type() {
    let config = RelayConfig {
        max_concurrent_per_type: Some(1),
        ..RelayConfig::default()
    };
    let h = Harness::new(config, |registry| {
        register_delayed_echo(registry);
        registry.register("ping", handler_fn(|_req| async { Ok(json!("pong")) }));
    });

    let busy = tokio::spawn({
        let dispatcher = h.dispatcher.clone();
        async move {
            dispatcher
                .dispatch("create", json!({"value": 1, "delay_ms": 100}))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let shed = h
        .dispatcher
        .dispatch("create", json!({"value": 2}))
        .await
        .unwrap_err();
    assert_eq!(shed.to_string(), "relay overloaded, try again later");
    assert_eq!(h.dispatcher.dispatch("ping", Value::Null).await.unwrap(), json!("pong"));

    busy.await.unwrap().unwrap();
    h.shutdown().await;
}
