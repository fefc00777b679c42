//! Team and file provisioning through relay, dispatcher and wallet bridge.

use std::sync::Arc;
use std::time::Duration;

use opsbridge_core::OperationStatus;
use opsbridge_relay::service::{
    register_bridge_handlers, register_builtin_handlers, FlowConfig, FlowError, ProvisioningFlow,
};
use opsbridge_relay::traits::BridgeError;
use opsbridge_relay::{
    HandlerRegistry, InMemoryBridge, MessageRelay, OperationStore, PageChannel, RelayConfig,
    RequestDispatcher,
};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn team_then_file_provisioning() {
    let channel = Arc::new(PageChannel::default());
    let config = RelayConfig::default();
    let store = Arc::new(OperationStore::default());
    let registry = Arc::new(HandlerRegistry::new(store.clone(), &config));
    let bridge = Arc::new(InMemoryBridge::disconnected("wallet-1"));
    bridge.fail_next_spawns(1, BridgeError::Transient("gateway timeout".into()));
    register_builtin_handlers(&registry);
    register_bridge_handlers(&registry, bridge.clone());

    let mut relay = MessageRelay::new(registry, channel.clone(), config.clone());
    relay.start();
    let dispatcher = Arc::new(RequestDispatcher::connect(channel, &config));
    let flow = ProvisioningFlow::new(dispatcher.clone(), bridge.clone(), FlowConfig::default());

    let start = Instant::now();
    let team = flow.create_team("core").await.unwrap();
    // One retry (1s backoff) plus the settle delay.
    assert!(start.elapsed() >= Duration::from_millis(3_000));

    let file = flow.create_file("notes.md", &team).await.unwrap();
    assert_ne!(team, file);

    let spawned: Vec<String> = bridge.spawned().into_iter().map(|(name, _)| name).collect();
    assert_eq!(spawned, vec!["core", "notes.md"]);
    let actions: Vec<String> = bridge
        .messages()
        .iter()
        .map(|m| m.data["action"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(actions, vec!["CreateTeam", "CreateFile"]);

    // Two spawn attempts for the team, one for the file, two messages.
    let ops = store.snapshot();
    assert_eq!(ops.len(), 5);
    assert_eq!(
        ops.iter().filter(|op| op.status == OperationStatus::Failed).count(),
        1
    );
    assert!(store.list_pending().is_empty());

    dispatcher.close();
    relay.stop().await;
}

#[tokio::test(start_paused = true)]
async fn missing_wallet_fails_before_any_dispatch() {
    struct NoWallet;

    #[async_trait::async_trait]
    impl opsbridge_relay::WalletBridge for NoWallet {
        async fn connect(&self) -> Result<(), BridgeError> {
            Err(BridgeError::NotDetected)
        }
        async fn active_address(&self) -> Result<String, BridgeError> {
            Err(BridgeError::NotConnected)
        }
        async fn spawn_process(
            &self,
            _name: &str,
            _tags: &[opsbridge_core::Tag],
        ) -> Result<String, BridgeError> {
            Err(BridgeError::NotConnected)
        }
        async fn send_message(
            &self,
            _process: &str,
            _data: &serde_json::Value,
            _tags: &[opsbridge_core::Tag],
        ) -> Result<String, BridgeError> {
            Err(BridgeError::NotConnected)
        }
        async fn disconnect(&self) -> Result<(), BridgeError> {
            Ok(())
        }
    }

    let channel = Arc::new(PageChannel::default());
    let config = RelayConfig::default();
    let dispatcher = Arc::new(RequestDispatcher::connect(channel, &config));
    let flow = ProvisioningFlow::new(dispatcher.clone(), Arc::new(NoWallet), FlowConfig::default());

    let err = flow.create_team("core").await.unwrap_err();
    assert!(matches!(err, FlowError::Wallet(BridgeError::NotDetected)));
    assert_eq!(err.to_string(), "wallet unavailable: Wallet not detected");
    assert_eq!(dispatcher.pending_count(), 0);
}
