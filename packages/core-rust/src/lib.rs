//! `opsbridge` core: wire messages, typed payloads, and the operation model
//! shared by the relay and its callers.

pub mod clock;
pub mod ids;
pub mod messages;
pub mod operation;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use ids::CorrelationId;
pub use messages::payload::Tag;
pub use messages::{
    peek_id, ErrorClass, Frame, MessageKind, ReplyMessage, RequestMessage, Response,
    UnknownMessageKind,
};
pub use operation::{Operation, OperationStatus, TransitionError};
