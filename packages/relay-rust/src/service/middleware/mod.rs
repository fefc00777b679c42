//! Tower middleware layers wrapped around every handler invocation.
//!
//! - [`tracking`]: Operation store bookkeeping and `Response` shaping
//! - [`load_shed`]: Relay-wide and per-operation-type admission control
//! - [`timeout`]: Per-invocation time bound
//! - [`metrics`]: Invocation timing and outcome via `tracing` spans
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;
pub mod tracking;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_handler_pipeline, HandlerPipeline};
pub use timeout::TimeoutLayer;
pub use tracking::TrackingLayer;
