use async_trait::async_trait;
use opsbridge_core::{ErrorClass, Tag};
use serde_json::Value;

use crate::channel::{EndpointId, Subscription, Target, TransportError};

/// Publish/subscribe transport the relay and dispatcher talk over.
/// Implementations: `PageChannel` (in-process); cross-frame or socket ports
/// only need these three primitives.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Open a listening subscription. Every broadcast posted afterwards is
    /// delivered to the returned inbox.
    fn subscribe(&self) -> Subscription;

    /// Close a subscription. Returns `false` if it was already closed.
    fn unsubscribe(&self, endpoint: EndpointId) -> bool;

    /// Post a structured frame, either to every subscriber or to one.
    async fn post(
        &self,
        from: EndpointId,
        frame: Value,
        target: Target,
    ) -> Result<(), TransportError>;
}

/// Errors surfaced by a wallet/transaction bridge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("Wallet not detected")]
    NotDetected,
    #[error("No active wallet address found")]
    NotConnected,
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Your wallet balance is too low: {0}")]
    InsufficientBalance(String),
    #[error("Transaction rejected: {0}")]
    Rejected(String),
    #[error("{0}")]
    Transient(String),
}

impl BridgeError {
    /// Permission, balance and rejection errors will fail again on retry.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) | Self::NotConnected => ErrorClass::Transient,
            Self::NotDetected
            | Self::PermissionDenied(_)
            | Self::InsufficientBalance(_)
            | Self::Rejected(_) => ErrorClass::Permanent,
        }
    }
}

/// Browser wallet bridge: connects, signs and submits transaction-like
/// requests. The relay treats every call as an opaque "request in,
/// identifier or error out" step.
#[async_trait]
pub trait WalletBridge: Send + Sync {
    /// Request the permissions needed to read the address and sign.
    async fn connect(&self) -> Result<(), BridgeError>;

    /// Address of the active wallet, if connected.
    async fn active_address(&self) -> Result<String, BridgeError>;

    /// Spawn a remote process. Returns the process id.
    async fn spawn_process(&self, name: &str, tags: &[Tag]) -> Result<String, BridgeError>;

    /// Send a signed message to a spawned process. Returns the message id.
    async fn send_message(
        &self,
        process: &str,
        data: &Value,
        tags: &[Tag],
    ) -> Result<String, BridgeError>;

    /// Revoke the connection. Errors are not fatal to callers.
    async fn disconnect(&self) -> Result<(), BridgeError>;
}
