//! In-memory [`WalletBridge`] used by the demo binary and tests.
//!
//! Records every spawn and message, hands out sequential identifiers, and
//! can be scripted to fail or return empty ids for the next N calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use opsbridge_core::Tag;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::traits::{BridgeError, WalletBridge};

/// A message accepted by [`InMemoryBridge::send_message`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub process: String,
    pub data: Value,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Default)]
struct BridgeState {
    connected: bool,
    spawn_failures: VecDeque<BridgeError>,
    message_failures: VecDeque<BridgeError>,
    empty_ids: u32,
    spawned: Vec<(String, Vec<Tag>)>,
    messages: Vec<SentMessage>,
}

/// Simulated wallet bridge.
#[derive(Debug)]
pub struct InMemoryBridge {
    address: String,
    state: Mutex<BridgeState>,
    next_id: AtomicU64,
}

impl InMemoryBridge {
    /// A bridge that is already connected as `address`.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        let bridge = Self::disconnected(address);
        bridge.state.lock().connected = true;
        bridge
    }

    /// A bridge that needs `connect` before it signs anything.
    #[must_use]
    pub fn disconnected(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: Mutex::new(BridgeState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Fail the next `count` spawns with `error`.
    pub fn fail_next_spawns(&self, count: usize, error: BridgeError) {
        let mut state = self.state.lock();
        state
            .spawn_failures
            .extend(std::iter::repeat(error).take(count));
    }

    /// Fail the next `count` message sends with `error`.
    pub fn fail_next_messages(&self, count: usize, error: BridgeError) {
        let mut state = self.state.lock();
        state
            .message_failures
            .extend(std::iter::repeat(error).take(count));
    }

    /// Return an empty id from the next `count` successful calls.
    pub fn return_empty_ids(&self, count: u32) {
        self.state.lock().empty_ids += count;
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Spawns recorded so far, as `(name, tags)`.
    #[must_use]
    pub fn spawned(&self) -> Vec<(String, Vec<Tag>)> {
        self.state.lock().spawned.clone()
    }

    #[must_use]
    pub fn messages(&self) -> Vec<SentMessage> {
        self.state.lock().messages.clone()
    }

    fn issue_id(&self, state: &mut BridgeState, prefix: &str) -> String {
        if state.empty_ids > 0 {
            state.empty_ids -= 1;
            return String::new();
        }
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{n:06}")
    }
}

#[async_trait]
impl WalletBridge for InMemoryBridge {
    async fn connect(&self) -> Result<(), BridgeError> {
        self.state.lock().connected = true;
        debug!(address = %self.address, "bridge connected");
        Ok(())
    }

    async fn active_address(&self) -> Result<String, BridgeError> {
        if self.state.lock().connected {
            Ok(self.address.clone())
        } else {
            Err(BridgeError::NotConnected)
        }
    }

    async fn spawn_process(&self, name: &str, tags: &[Tag]) -> Result<String, BridgeError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BridgeError::NotConnected);
        }
        if let Some(err) = state.spawn_failures.pop_front() {
            return Err(err);
        }
        state.spawned.push((name.to_string(), tags.to_vec()));
        let id = self.issue_id(&mut state, "proc");
        debug!(%name, process_id = %id, "process spawned");
        Ok(id)
    }

    async fn send_message(
        &self,
        process: &str,
        data: &Value,
        tags: &[Tag],
    ) -> Result<String, BridgeError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BridgeError::NotConnected);
        }
        if let Some(err) = state.message_failures.pop_front() {
            return Err(err);
        }
        state.messages.push(SentMessage {
            process: process.to_string(),
            data: data.clone(),
            tags: tags.to_vec(),
        });
        let id = self.issue_id(&mut state, "msg");
        Ok(id)
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        self.state.lock().connected = false;
        Ok(())
    }
}
