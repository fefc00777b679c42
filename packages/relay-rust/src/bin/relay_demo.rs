//! relay-demo: runs a relay and a dispatcher on one in-process channel and
//! provisions a team and a file through the simulated wallet bridge.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use opsbridge_relay::service::{
    register_bridge_handlers, register_builtin_handlers, FlowConfig, ProvisioningFlow, RetryPolicy,
};
use opsbridge_relay::traits::BridgeError;
use opsbridge_relay::{
    CorrelationMode, HandlerRegistry, InMemoryBridge, MessageRelay, OperationStore, PageChannel,
    RelayConfig, RequestDispatcher,
};

/// Provision a team and a file over the opsbridge relay.
#[derive(Parser, Debug)]
#[command(name = "relay-demo")]
#[command(about = "Run the opsbridge relay against a simulated wallet")]
struct Args {
    /// Team name to provision
    #[arg(long, default_value = "core-team")]
    team: String,

    /// File name to provision inside the team
    #[arg(long, default_value = "notes.md")]
    file: String,

    /// Reply deadline for each dispatch, in milliseconds
    #[arg(long, env = "OPSBRIDGE_DISPATCH_TIMEOUT_MS", default_value_t = 30_000)]
    timeout_ms: u64,

    /// Pause between spawning a process and messaging it, in milliseconds
    #[arg(long, env = "OPSBRIDGE_SETTLE_MS", default_value_t = 2_000)]
    settle_ms: u64,

    /// Attempts per flow step
    #[arg(long, default_value_t = 2)]
    attempts: u32,

    /// Fail the first N process spawns with a transient gateway error
    #[arg(long, default_value_t = 0)]
    fail_spawns: usize,

    /// Match replies by message type only (reproduces the cross-talk hazard)
    #[arg(long)]
    legacy_correlation: bool,

    /// Keep the relay running until Ctrl-C after the flows finish
    #[arg(long)]
    serve: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "OPSBRIDGE_JSON_LOGS")]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = RelayConfig {
        default_dispatch_timeout_ms: args.timeout_ms,
        correlation_mode: if args.legacy_correlation {
            CorrelationMode::MessageType
        } else {
            CorrelationMode::PerCall
        },
        ..RelayConfig::default()
    };

    let channel = Arc::new(PageChannel::default());
    let store = Arc::new(OperationStore::default());
    let registry = Arc::new(HandlerRegistry::new(Arc::clone(&store), &config));
    let bridge = Arc::new(InMemoryBridge::disconnected("demo-wallet"));
    if args.fail_spawns > 0 {
        bridge.fail_next_spawns(args.fail_spawns, BridgeError::Transient("gateway timeout".into()));
    }
    register_builtin_handlers(&registry);
    register_bridge_handlers(&registry, bridge.clone());

    let mut relay = MessageRelay::new(registry, channel.clone(), config.clone());
    relay.start();

    let dispatcher = Arc::new(RequestDispatcher::connect(channel, &config));
    let flow = ProvisioningFlow::new(
        Arc::clone(&dispatcher),
        bridge,
        FlowConfig {
            settle_delay: Duration::from_millis(args.settle_ms),
            step_policy: RetryPolicy::new(args.attempts, Duration::from_millis(1000)),
            ..FlowConfig::default()
        },
    );

    let team_process = flow
        .create_team(&args.team)
        .await
        .context("team provisioning failed")?;
    let file_process = flow
        .create_file(&args.file, &team_process)
        .await
        .context("file provisioning failed")?;
    info!(%team_process, %file_process, "provisioning complete");

    let snapshot = serde_json::to_string_pretty(&store.snapshot())?;
    println!("{snapshot}");

    if args.serve {
        info!("relay serving, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }

    dispatcher.close();
    relay.stop().await;
    Ok(())
}
