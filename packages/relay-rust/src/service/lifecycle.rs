//! Relay lifecycle state with in-flight handler tracking.
//!
//! Uses `ArcSwap` for lock-free state transitions and an atomic counter with
//! RAII guards for in-flight invocations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

/// Relay lifecycle state.
///
/// State machine: Inactive -> Active -> Draining -> Inactive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Not listening. Initial state and the state after a completed stop.
    Inactive,
    /// Listening and dispatching requests to handlers.
    Active,
    /// Unsubscribed; waiting for in-flight handlers to finish.
    Draining,
}

/// Lifecycle controller shared by the relay loop and its handler tasks.
#[derive(Debug)]
pub struct Lifecycle {
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<RelayState>,
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(RelayState::Inactive),
        }
    }

    #[must_use]
    pub fn state(&self) -> RelayState {
        **self.state.load()
    }

    pub fn set_active(&self) {
        self.state.store(Arc::new(RelayState::Active));
    }

    /// Enter `Draining`. The relay returns to `Inactive` when the guard is
    /// dropped, even if the stop that owns it is abandoned mid-drain.
    #[must_use]
    pub fn begin_draining(&self) -> DrainingGuard<'_> {
        self.state.store(Arc::new(RelayState::Draining));
        DrainingGuard { lifecycle: self }
    }

    /// The in-flight counter is incremented on creation and decremented when
    /// the guard is dropped, even if the handler task panics.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight invocations to finish, up to `timeout`.
    ///
    /// Returns `true` (and moves to `Inactive`) once the count reaches zero.
    /// On timeout returns `false`; the state is still moved to `Inactive`
    /// because the relay no longer listens either way.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        let drained = loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        self.state.store(Arc::new(RelayState::Inactive));
        drained
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Puts the lifecycle back to `Inactive` when dropped.
#[derive(Debug)]
pub struct DrainingGuard<'a> {
    lifecycle: &'a Lifecycle,
}

impl Drop for DrainingGuard<'_> {
    fn drop(&mut self) {
        self.lifecycle.state.store(Arc::new(RelayState::Inactive));
    }
}
