//! Built-in handler catalogue.
//!
//! `*_ready` handlers acknowledge a request and echo its validated payload;
//! `*_complete` handlers confirm a finished step and surface its identifier.
//! Process handlers can be backed by a [`WalletBridge`], in which case they
//! perform the spawn or message send and return the resulting id.

use std::sync::Arc;

use opsbridge_core::messages::payload::{
    FileSaveCompletePayload, FileSavePayload, InvitationAcceptPayload, InvitationCompletePayload,
    InvitationPayload, ProcessMessageCompletePayload, ProcessMessagePayload,
    ProcessSpawnCompletePayload, ProcessSpawnPayload, TeamCreateCompletePayload,
    TeamCreatePayload, WalletChangePayload,
};
use opsbridge_core::{MessageKind, RequestMessage};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::error::HandlerError;
use super::registry::{handler_fn, HandlerRegistry};
use crate::traits::WalletBridge;

/// Decode an optional payload: `null` or a missing body reads as `P::default()`.
fn lenient<P: DeserializeOwned + Default>(kind: MessageKind, data: Value) -> Result<P, HandlerError> {
    if data.is_null() {
        return Ok(P::default());
    }
    serde_json::from_value(data).map_err(|e| HandlerError::InvalidPayload {
        message_type: kind.message_type().to_string(),
        reason: e.to_string(),
    })
}

fn register_ack(registry: &HandlerRegistry, kind: MessageKind, ack: &'static str) {
    registry.register_as(
        kind.message_type(),
        kind.operation_type(),
        handler_fn(move |_req: RequestMessage| async move { Ok(json!({ ack: true })) }),
    );
}

async fn team_create(payload: TeamCreatePayload) -> Result<Value, HandlerError> {
    Ok(json!({ "team": payload }))
}

async fn file_save(payload: FileSavePayload) -> Result<Value, HandlerError> {
    Ok(json!({ "file": payload }))
}

async fn invitation_sent(payload: InvitationPayload) -> Result<Value, HandlerError> {
    Ok(json!({ "invitation": payload }))
}

async fn invitation_accepted(payload: InvitationAcceptPayload) -> Result<Value, HandlerError> {
    Ok(json!({ "acceptRequest": payload }))
}

async fn process_spawn_request(payload: ProcessSpawnPayload) -> Result<Value, HandlerError> {
    Ok(json!({ "processRequest": payload }))
}

async fn ao_message_request(payload: ProcessMessagePayload) -> Result<Value, HandlerError> {
    Ok(json!({ "messageRequest": payload }))
}

/// Register all built-in message types on `registry`.
pub fn register_builtin_handlers(registry: &HandlerRegistry) {
    register_ack(registry, MessageKind::AuthRequest, "authenticated");
    register_ack(registry, MessageKind::AuthTabReloaded, "reloaded");
    register_ack(registry, MessageKind::AuthTabClosed, "closed");
    register_ack(registry, MessageKind::AuthAppDisconnected, "disconnected");
    register_ack(registry, MessageKind::AuthChunk, "chunkProcessed");

    let kind = MessageKind::AuthActiveWalletChange;
    registry.register_as(
        kind.message_type(),
        kind.operation_type(),
        handler_fn(move |req: RequestMessage| async move {
            let payload: WalletChangePayload = lenient(kind, req.data)?;
            Ok::<_, HandlerError>(json!({ "wallet": payload.wallet }))
        }),
    );

    let kind = MessageKind::TeamCreate;
    registry.register_typed(kind.message_type(), kind.operation_type(), team_create);
    let kind = MessageKind::TeamCreateComplete;
    registry.register_as(
        kind.message_type(),
        kind.operation_type(),
        handler_fn(move |req: RequestMessage| async move {
            let payload: TeamCreateCompletePayload = lenient(kind, req.data)?;
            Ok::<_, HandlerError>(json!({ "teamCreated": true, "teamId": payload.team_id }))
        }),
    );

    let kind = MessageKind::FileSave;
    registry.register_typed(kind.message_type(), kind.operation_type(), file_save);
    let kind = MessageKind::FileSaveComplete;
    registry.register_as(
        kind.message_type(),
        kind.operation_type(),
        handler_fn(move |req: RequestMessage| async move {
            let payload: FileSaveCompletePayload = lenient(kind, req.data)?;
            Ok::<_, HandlerError>(json!({ "fileSaved": true, "fileId": payload.file_id }))
        }),
    );

    let kind = MessageKind::InvitationSent;
    registry.register_typed(kind.message_type(), kind.operation_type(), invitation_sent);
    let kind = MessageKind::InvitationSentComplete;
    registry.register_as(
        kind.message_type(),
        kind.operation_type(),
        handler_fn(move |req: RequestMessage| async move {
            let payload: InvitationCompletePayload = lenient(kind, req.data)?;
            Ok::<_, HandlerError>(json!({ "invitationSent": true, "invitationId": payload.invitation_id }))
        }),
    );

    let kind = MessageKind::InvitationAccepted;
    registry.register_typed(kind.message_type(), kind.operation_type(), invitation_accepted);
    let kind = MessageKind::InvitationAcceptedComplete;
    registry.register_as(
        kind.message_type(),
        kind.operation_type(),
        handler_fn(move |req: RequestMessage| async move {
            let payload: InvitationCompletePayload = lenient(kind, req.data)?;
            Ok::<_, HandlerError>(json!({ "invitationAccepted": true, "invitationId": payload.invitation_id }))
        }),
    );

    let kind = MessageKind::ProcessSpawn;
    registry.register_typed(kind.message_type(), kind.operation_type(), process_spawn_request);
    let kind = MessageKind::ProcessSpawnComplete;
    registry.register_as(
        kind.message_type(),
        kind.operation_type(),
        handler_fn(move |req: RequestMessage| async move {
            let payload: ProcessSpawnCompletePayload = lenient(kind, req.data)?;
            Ok::<_, HandlerError>(json!({ "processSpawned": true, "processId": payload.process_id }))
        }),
    );

    let kind = MessageKind::AoMessage;
    registry.register_typed(kind.message_type(), kind.operation_type(), ao_message_request);
    let kind = MessageKind::AoMessageComplete;
    registry.register_as(
        kind.message_type(),
        kind.operation_type(),
        handler_fn(move |req: RequestMessage| async move {
            let payload: ProcessMessageCompletePayload = lenient(kind, req.data)?;
            Ok::<_, HandlerError>(json!({ "messageSent": true, "messageId": payload.message_id }))
        }),
    );
}

/// Replace the process handlers with versions that perform the spawn and
/// message send through `bridge`. Replies carry `{processId}` and
/// `{messageId}`.
pub fn register_bridge_handlers(registry: &HandlerRegistry, bridge: Arc<dyn WalletBridge>) {
    let kind = MessageKind::ProcessSpawn;
    let spawn_bridge = Arc::clone(&bridge);
    registry.register_typed(
        kind.message_type(),
        kind.operation_type(),
        move |payload: ProcessSpawnPayload| {
            let bridge = Arc::clone(&spawn_bridge);
            async move {
                let process_id = bridge.spawn_process(&payload.name, &payload.tags).await?;
                Ok::<_, HandlerError>(json!({ "processId": process_id }))
            }
        },
    );

    let kind = MessageKind::AoMessage;
    registry.register_typed(
        kind.message_type(),
        kind.operation_type(),
        move |payload: ProcessMessagePayload| {
            let bridge = Arc::clone(&bridge);
            async move {
                let message_id = bridge
                    .send_message(&payload.process, &payload.data, &payload.tags)
                    .await?;
                Ok::<_, HandlerError>(json!({ "messageId": message_id }))
            }
        },
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use opsbridge_core::{ErrorClass, Tag};

    use super::*;
    use crate::bridge::InMemoryBridge;
    use crate::service::config::RelayConfig;
    use crate::service::store::OperationStore;

    fn registry() -> HandlerRegistry {
        let registry = HandlerRegistry::new(Arc::new(OperationStore::default()), &RelayConfig::default());
        register_builtin_handlers(&registry);
        registry
    }

    async fn call(registry: &HandlerRegistry, kind: MessageKind, data: Value) -> opsbridge_core::Response {
        let request = RequestMessage::new(kind.message_type(), data)
            .with_correlation(opsbridge_core::CorrelationId::generate());
        registry.invoke(request).await.unwrap()
    }

    #[test]
    fn every_builtin_kind_is_registered() {
        let registry = registry();
        for kind in MessageKind::ALL {
            assert!(registry.contains(kind.message_type()), "{kind} missing");
        }
        assert_eq!(registry.message_types().len(), MessageKind::ALL.len());
    }

    #[tokio::test]
    async fn acknowledgements_and_operation_types() {
        let registry = registry();
        let response = call(&registry, MessageKind::AuthTabReloaded, Value::Null).await;
        assert_eq!(response.operation_type, "tab_reload");
        assert_eq!(response.data, Some(json!({"reloaded": true})));

        let response = call(&registry, MessageKind::AuthChunk, json!({"chunk": 1})).await;
        assert_eq!(response.data, Some(json!({"chunkProcessed": true})));
    }

    #[tokio::test]
    async fn complete_handlers_surface_ids() {
        let registry = registry();
        let response = call(&registry, MessageKind::TeamCreateComplete, json!({"teamId": "T1"})).await;
        assert_eq!(response.data, Some(json!({"teamCreated": true, "teamId": "T1"})));

        let response = call(&registry, MessageKind::FileSaveComplete, Value::Null).await;
        assert_eq!(response.data, Some(json!({"fileSaved": true, "fileId": null})));

        let response = call(&registry, MessageKind::AuthActiveWalletChange, json!({"wallet": "w-1"})).await;
        assert_eq!(response.data, Some(json!({"wallet": "w-1"})));
    }

    #[tokio::test]
    async fn ready_handlers_echo_validated_payload() {
        let registry = registry();
        let response = call(
            &registry,
            MessageKind::TeamCreate,
            json!({"name": "core", "description": "d"}),
        )
        .await;
        assert_eq!(response.operation_type, "team_create");
        assert_eq!(
            response.data,
            Some(json!({"team": {"name": "core", "description": "d"}}))
        );

        let response = call(&registry, MessageKind::TeamCreate, json!({"title": "core"})).await;
        assert!(!response.success);
        assert_eq!(response.error_class, Some(ErrorClass::Permanent));
    }

    #[tokio::test]
    async fn bridge_handlers_return_ids() {
        let registry = registry();
        let bridge = Arc::new(InMemoryBridge::new("addr-1"));
        register_bridge_handlers(&registry, bridge.clone());

        let response = call(
            &registry,
            MessageKind::ProcessSpawn,
            json!({"name": "team-core", "tags": [{"name": "Name", "value": "CanvasNotesApp"}]}),
        )
        .await;
        let process_id = response.data.unwrap()["processId"].as_str().unwrap().to_string();
        assert_eq!(bridge.spawned(), vec![("team-core".to_string(), vec![Tag::new("Name", "CanvasNotesApp")])]);

        let response = call(
            &registry,
            MessageKind::AoMessage,
            json!({"process": process_id, "data": {"action": "CreateTeam"}}),
        )
        .await;
        assert!(response.data.unwrap()["messageId"].as_str().is_some());
        assert_eq!(bridge.messages().len(), 1);
    }

    #[tokio::test]
    async fn bridge_errors_keep_their_class() {
        let registry = registry();
        let bridge = Arc::new(InMemoryBridge::new("addr-1"));
        bridge.fail_next_spawns(1, crate::traits::BridgeError::InsufficientBalance("0 AR".into()));
        register_bridge_handlers(&registry, bridge);

        let response = call(&registry, MessageKind::ProcessSpawn, json!({"name": "p"})).await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("Your wallet balance is too low: 0 AR"));
        assert_eq!(response.error_class, Some(ErrorClass::Permanent));
    }
}
