//! Built-in message types and their typed payloads.
//!
//! Each [`MessageKind`] names a handler key (`team_create_ready`) and the
//! operation type its responses and tracked operations carry
//! (`team_create`). Payload structs deserialize from the request `data` at
//! the relay boundary, before the handler body runs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// The built-in handler catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AuthRequest,
    AuthTabReloaded,
    AuthTabClosed,
    AuthActiveWalletChange,
    AuthAppDisconnected,
    AuthChunk,
    TeamCreate,
    TeamCreateComplete,
    FileSave,
    FileSaveComplete,
    InvitationSent,
    InvitationSentComplete,
    InvitationAccepted,
    InvitationAcceptedComplete,
    ProcessSpawn,
    ProcessSpawnComplete,
    AoMessage,
    AoMessageComplete,
}

/// Returned by `MessageKind::from_str` for keys outside the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type: {0}")]
pub struct UnknownMessageKind(pub String);

impl MessageKind {
    pub const ALL: [MessageKind; 18] = [
        Self::AuthRequest,
        Self::AuthTabReloaded,
        Self::AuthTabClosed,
        Self::AuthActiveWalletChange,
        Self::AuthAppDisconnected,
        Self::AuthChunk,
        Self::TeamCreate,
        Self::TeamCreateComplete,
        Self::FileSave,
        Self::FileSaveComplete,
        Self::InvitationSent,
        Self::InvitationSentComplete,
        Self::InvitationAccepted,
        Self::InvitationAcceptedComplete,
        Self::ProcessSpawn,
        Self::ProcessSpawnComplete,
        Self::AoMessage,
        Self::AoMessageComplete,
    ];

    /// Handler key matched against a request's `id`.
    #[must_use]
    pub fn message_type(self) -> &'static str {
        match self {
            Self::AuthRequest => "auth_request_ready",
            Self::AuthTabReloaded => "auth_tab_reloaded_ready",
            Self::AuthTabClosed => "auth_tab_closed_ready",
            Self::AuthActiveWalletChange => "auth_active_wallet_change_ready",
            Self::AuthAppDisconnected => "auth_app_disconnected_ready",
            Self::AuthChunk => "auth_chunk_ready",
            Self::TeamCreate => "team_create_ready",
            Self::TeamCreateComplete => "team_create_complete",
            Self::FileSave => "file_save_ready",
            Self::FileSaveComplete => "file_save_complete",
            Self::InvitationSent => "invitation_sent_ready",
            Self::InvitationSentComplete => "invitation_sent_complete",
            Self::InvitationAccepted => "invitation_accepted_ready",
            Self::InvitationAcceptedComplete => "invitation_accepted_complete",
            Self::ProcessSpawn => "process_spawn_ready",
            Self::ProcessSpawnComplete => "process_spawn_complete",
            Self::AoMessage => "ao_message_ready",
            Self::AoMessageComplete => "ao_message_complete",
        }
    }

    /// Operation type recorded in the store and in `Response::operation_type`.
    #[must_use]
    pub fn operation_type(self) -> &'static str {
        match self {
            Self::AuthRequest => "auth_request",
            Self::AuthTabReloaded => "tab_reload",
            Self::AuthTabClosed => "tab_closed",
            Self::AuthActiveWalletChange => "wallet_change",
            Self::AuthAppDisconnected => "app_disconnect",
            Self::AuthChunk => "chunk_ready",
            Self::TeamCreate => "team_create",
            Self::TeamCreateComplete => "team_create_complete",
            Self::FileSave => "file_save",
            Self::FileSaveComplete => "file_save_complete",
            Self::InvitationSent => "invitation_sent",
            Self::InvitationSentComplete => "invitation_sent_complete",
            Self::InvitationAccepted => "invitation_accepted",
            Self::InvitationAcceptedComplete => "invitation_accepted_complete",
            Self::ProcessSpawn => "process_spawn",
            Self::ProcessSpawnComplete => "process_spawn_complete",
            Self::AoMessage => "ao_message",
            Self::AoMessageComplete => "ao_message_complete",
        }
    }
}

impl FromStr for MessageKind {
    type Err = UnknownMessageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.message_type() == s)
            .ok_or_else(|| UnknownMessageKind(s.to_string()))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message_type())
    }
}

// ---------------------------------------------------------------------------
// Shared payload pieces
// ---------------------------------------------------------------------------

/// A name/value tag attached to spawned processes and process messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Auth payloads
// ---------------------------------------------------------------------------

/// Payload for `auth_active_wallet_change_ready`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletChangePayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wallet: Option<String>,
}

// ---------------------------------------------------------------------------
// Team payloads
// ---------------------------------------------------------------------------

/// Payload for `team_create_ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamCreatePayload {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created_by: Option<String>,
}

/// Payload for `team_create_complete`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamCreateCompletePayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub team_id: Option<String>,
}

// ---------------------------------------------------------------------------
// File payloads
// ---------------------------------------------------------------------------

/// Payload for `file_save_ready`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSavePayload {
    pub file_name: String,
    pub team_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub document: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub whiteboard: Option<String>,
}

/// Payload for `file_save_complete`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSaveCompletePayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Invitation payloads
// ---------------------------------------------------------------------------

/// Payload for `invitation_sent_ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationPayload {
    pub team_id: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub invited_by: Option<String>,
}

/// Payload for `invitation_accepted_ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationAcceptPayload {
    pub invitation_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_id: Option<String>,
}

/// Payload for `invitation_sent_complete` and `invitation_accepted_complete`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationCompletePayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub invitation_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Process payloads
// ---------------------------------------------------------------------------

/// Payload for `process_spawn_ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpawnPayload {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<Tag>,
}

/// Payload for `process_spawn_complete`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpawnCompletePayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub process_id: Option<String>,
}

/// Payload for `ao_message_ready`: a message addressed to a spawned process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMessagePayload {
    /// Target process id.
    pub process: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<Tag>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub anchor: Option<String>,
}

/// Payload for `ao_message_complete`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMessageCompletePayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message_id: Option<String>,
}
