//! Operation tracking and message relay framework.
//!
//! 1. **Store** (`store`): tracked operations and their lifecycle
//! 2. **Registry** (`registry`): message key -> handler, invocation entry point
//! 3. **Middleware** (`middleware`): Tower layers (tracking, load-shedding, timeout, metrics)
//! 4. **Relay** (`relay`): listens on the channel and replies to requesters
//! 5. **Dispatcher** (`dispatcher`): sends requests and correlates replies
//! 6. **Retry** (`retry`): bounded retry with linear backoff
//! 7. **Domain** (`domain`): built-in handler catalogue
//! 8. **Flows** (`flows`): multi-step provisioning over the dispatcher
//! 9. **Background workers** (`worker`): retention sweeps

pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod flows;
pub mod lifecycle;
pub mod middleware;
pub mod registry;
pub mod relay;
pub mod retry;
pub mod store;
pub mod worker;

// Re-export key types for convenient access.
pub use config::{CorrelationMode, RelayConfig};
pub use dispatcher::{DispatchOptions, RequestDispatcher};
pub use domain::{register_bridge_handlers, register_builtin_handlers};
pub use error::{HandlerError, RelayError, StoreError};
pub use flows::{FlowConfig, FlowError, ProvisioningFlow};
pub use lifecycle::RelayState;
pub use registry::{handler_fn, Handler, HandlerRegistry, Invocation};
pub use relay::MessageRelay;
pub use retry::{run_with_retry, RetryError, RetryPolicy, Retryable, RetryingActionRunner};
pub use store::OperationStore;
pub use worker::{BackgroundRunnable, BackgroundWorker, RetentionSweeper, SweepTask};
