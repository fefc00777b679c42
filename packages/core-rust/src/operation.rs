//! Tracked asynchronous operations and their lifecycle.
//!
//! An [`Operation`] starts `Pending` and moves exactly once to a terminal
//! status (`Completed` or `Failed`). Every other transition is rejected with
//! a [`TransitionError`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
}

impl OperationStatus {
    /// Returns `true` for `Completed` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("operation {id} cannot return to pending")]
    ToPending { id: String },
    #[error("operation {id} is already {status}")]
    AlreadyTerminal { id: String, status: OperationStatus },
}

/// One asynchronous unit of work tracked across the relay boundary.
///
/// `data` holds the input payload while pending, then the result on
/// completion or an `{"error": ...}` object on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    #[serde(rename = "type")]
    pub operation_type: String,
    pub status: OperationStatus,
    /// Milliseconds since Unix epoch when the operation was tracked.
    pub start_time: u64,
    /// Milliseconds since Unix epoch of the terminal transition.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
}

impl Operation {
    /// Creates a pending operation.
    #[must_use]
    pub fn pending(
        id: impl Into<String>,
        operation_type: impl Into<String>,
        data: Option<Value>,
        start_time: u64,
    ) -> Self {
        Self {
            id: id.into(),
            operation_type: operation_type.into(),
            status: OperationStatus::Pending,
            start_time,
            end_time: None,
            data,
        }
    }

    /// Applies the single terminal transition.
    ///
    /// `data`, when present, replaces the stored payload; `None` keeps the
    /// input payload recorded at track time.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::ToPending`] if `status` is `Pending`, and
    /// [`TransitionError::AlreadyTerminal`] if the operation already finished.
    pub fn finish(
        &mut self,
        status: OperationStatus,
        data: Option<Value>,
        now: u64,
    ) -> Result<(), TransitionError> {
        if !status.is_terminal() {
            return Err(TransitionError::ToPending {
                id: self.id.clone(),
            });
        }
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        self.status = status;
        self.end_time = Some(now);
        if data.is_some() {
            self.data = data;
        }
        Ok(())
    }

    /// Milliseconds the operation spent pending, if it has finished.
    #[must_use]
    pub fn duration_ms(&self) -> Option<u64> {
        self.end_time.map(|end| end.saturating_sub(self.start_time))
    }
}
