//! Multi-step provisioning flows built on the dispatcher.
//!
//! Each flow spawns a remote process, waits for it to settle, then sends it
//! an initialising message. Both steps are retried independently: a failed
//! message send never spawns a second process.

use std::sync::Arc;
use std::time::Duration;

use opsbridge_core::messages::payload::{
    ProcessMessageCompletePayload, ProcessMessagePayload, ProcessSpawnCompletePayload,
    ProcessSpawnPayload,
};
use opsbridge_core::{MessageKind, Tag};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::dispatcher::RequestDispatcher;
use super::error::RelayError;
use super::retry::{RetryError, RetryPolicy, RetryingActionRunner};
use crate::traits::{BridgeError, WalletBridge};

/// Flow tuning.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Pause between spawning a process and messaging it.
    pub settle_delay: Duration,
    /// Retry policy applied to each step separately.
    pub step_policy: RetryPolicy,
    /// Value of the `Name` tag on every spawn and message.
    pub app_name: String,
    /// Value of the `Version` tag on every spawn and message.
    pub app_version: String,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(2000),
            step_policy: RetryPolicy::new(2, Duration::from_millis(1000)),
            app_name: "CanvasNotesApp".to_string(),
            app_version: "0.2.1".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("wallet unavailable: {0}")]
    Wallet(#[from] BridgeError),
    #[error("{stage} failed: {source}")]
    Step {
        stage: &'static str,
        #[source]
        source: RetryError<RelayError>,
    },
}

/// Team and file provisioning over a [`RequestDispatcher`].
pub struct ProvisioningFlow {
    dispatcher: Arc<RequestDispatcher>,
    bridge: Arc<dyn WalletBridge>,
    config: FlowConfig,
}

impl ProvisioningFlow {
    #[must_use]
    pub fn new(
        dispatcher: Arc<RequestDispatcher>,
        bridge: Arc<dyn WalletBridge>,
        config: FlowConfig,
    ) -> Self {
        Self {
            dispatcher,
            bridge,
            config,
        }
    }

    /// Provision a team process and send it `CreateTeam`. Returns the
    /// process id.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Wallet`] if the wallet cannot be connected and
    /// [`FlowError::Step`] if a step fails after its retries.
    pub async fn create_team(&self, name: &str) -> Result<String, FlowError> {
        let data = json!({ "action": "CreateTeam", "name": name });
        self.provision(name, "CreateTeam", data, Vec::new()).await
    }

    /// Provision a file process for `team_id` and send it `CreateFile`.
    /// Returns the process id.
    ///
    /// # Errors
    ///
    /// As [`create_team`](Self::create_team).
    pub async fn create_file(&self, file_name: &str, team_id: &str) -> Result<String, FlowError> {
        let data = json!({ "action": "CreateFile", "fileName": file_name, "teamId": team_id });
        self.provision(file_name, "CreateFile", data, vec![Tag::new("TeamId", team_id)])
            .await
    }

    fn common_tags(&self) -> Vec<Tag> {
        vec![
            Tag::new("Name", &self.config.app_name),
            Tag::new("Version", &self.config.app_version),
        ]
    }

    async fn provision(
        &self,
        name: &str,
        action: &str,
        data: Value,
        extra_tags: Vec<Tag>,
    ) -> Result<String, FlowError> {
        self.ensure_connected().await?;
        let runner = RetryingActionRunner::new(self.config.step_policy);

        let spawn = ProcessSpawnPayload {
            name: name.to_string(),
            tags: self.common_tags(),
        };
        let process_id = runner
            .run("process_spawn", || self.spawn_once(&spawn))
            .await
            .map_err(|source| FlowError::Step {
                stage: "process spawn",
                source,
            })?;
        info!(%name, %process_id, "process spawned");

        tokio::time::sleep(self.config.settle_delay).await;

        let mut tags = self.common_tags();
        tags.push(Tag::new("Action", action));
        tags.extend(extra_tags);
        let message = ProcessMessagePayload {
            process: process_id.clone(),
            data,
            tags,
            anchor: None,
        };
        let message_id = runner
            .run("ao_message", || self.send_once(&message))
            .await
            .map_err(|source| FlowError::Step {
                stage: "process message",
                source,
            })?;
        info!(%process_id, %message_id, %action, "process initialised");

        Ok(process_id)
    }

    async fn ensure_connected(&self) -> Result<(), BridgeError> {
        match self.bridge.active_address().await {
            Ok(address) => {
                debug!(%address, "wallet already connected");
                Ok(())
            }
            Err(BridgeError::NotConnected) => {
                self.bridge.connect().await?;
                let address = self.bridge.active_address().await?;
                info!(%address, "wallet connected");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn spawn_once(&self, payload: &ProcessSpawnPayload) -> Result<String, RelayError> {
        let reply: ProcessSpawnCompletePayload = self
            .dispatcher
            .dispatch_typed(MessageKind::ProcessSpawn, payload)
            .await?;
        reply
            .process_id
            .filter(|id| !id.is_empty())
            .ok_or(RelayError::EmptyResult("Process ID"))
    }

    async fn send_once(&self, payload: &ProcessMessagePayload) -> Result<String, RelayError> {
        let reply: ProcessMessageCompletePayload = self
            .dispatcher
            .dispatch_typed(MessageKind::AoMessage, payload)
            .await?;
        reply
            .message_id
            .filter(|id| !id.is_empty())
            .ok_or(RelayError::EmptyResult("Message ID"))
    }
}

impl std::fmt::Debug for ProvisioningFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningFlow")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
