//! Wire shapes exchanged across the relay boundary.
//!
//! A request is `{ id, data, correlationId? }`. A reply repeats the request's
//! `id` and `correlationId`, embeds the full [`Response`] record, and mirrors
//! its `type`/`success`/`data`/`error`/`timestamp` at the top level for
//! consumers that only read the flat fields. All structs serialize with
//! camelCase field names.
//!
//! The channel is shared with unrelated traffic, so frames arrive as untyped
//! JSON and are classified with [`Frame::parse`].

pub mod payload;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::CorrelationId;

pub use payload::{MessageKind, UnknownMessageKind};

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Request half of the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    /// Registered handler key the receiver matches against.
    pub id: String,
    /// Arbitrary JSON payload. Absent on the wire reads as `null`.
    #[serde(default)]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<CorrelationId>,
}

impl RequestMessage {
    #[must_use]
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
            correlation_id: None,
        }
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Whether retrying a failed request can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Uniform result record produced for every handled request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    /// Operation type of the handler (e.g. `team_create`).
    #[serde(rename = "type")]
    pub operation_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_class: Option<ErrorClass>,
    pub timestamp: u64,
    /// Operation id under which the request was tracked.
    pub message_id: String,
}

impl Response {
    #[must_use]
    pub fn completed(
        operation_type: impl Into<String>,
        message_id: impl Into<String>,
        data: Value,
        timestamp: u64,
    ) -> Self {
        Self {
            success: true,
            operation_type: operation_type.into(),
            data: Some(data),
            error: None,
            error_class: None,
            timestamp,
            message_id: message_id.into(),
        }
    }

    #[must_use]
    pub fn failed(
        operation_type: impl Into<String>,
        message_id: impl Into<String>,
        error: impl Into<String>,
        class: ErrorClass,
        timestamp: u64,
    ) -> Self {
        Self {
            success: false,
            operation_type: operation_type.into(),
            data: None,
            error: Some(error.into()),
            error_class: Some(class),
            timestamp,
            message_id: message_id.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// Reply half of the exchange, addressed back to the request's sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMessage {
    /// Same `id` as the request.
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<CorrelationId>,
    pub response: Response,
    #[serde(rename = "type")]
    pub operation_type: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub timestamp: u64,
}

impl ReplyMessage {
    /// Builds the reply for `request`, mirroring `response` into the flat fields.
    #[must_use]
    pub fn for_request(request: &RequestMessage, response: Response) -> Self {
        Self {
            id: request.id.clone(),
            correlation_id: request.correlation_id.clone(),
            operation_type: response.operation_type.clone(),
            success: response.success,
            data: response.data.clone(),
            error: response.error.clone(),
            timestamp: response.timestamp,
            response,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame classification
// ---------------------------------------------------------------------------

/// A structured message recognised on the shared channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(RequestMessage),
    Reply(ReplyMessage),
}

impl Frame {
    /// Classifies an untyped channel frame.
    ///
    /// Objects with a string `id` and a `response` member are replies; other
    /// objects with a string `id` are requests. Anything else, including
    /// frames that fail to deserialize, is unrelated traffic and yields `None`.
    #[must_use]
    pub fn parse(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        object.get("id")?.as_str()?;
        if object.contains_key("response") {
            serde_json::from_value(value.clone()).ok().map(Frame::Reply)
        } else {
            serde_json::from_value(value.clone()).ok().map(Frame::Request)
        }
    }

    /// Returns the handler key of the frame.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Request(r) => &r.id,
            Self::Reply(r) => &r.id,
        }
    }

    /// Encodes the frame back into an untyped channel value.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload contains a value `serde_json` cannot
    /// represent (e.g. a map with non-string keys).
    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            Self::Request(r) => serde_json::to_value(r),
            Self::Reply(r) => serde_json::to_value(r),
        }
    }
}

/// Reads the `id` member of a frame without deserializing the rest.
#[must_use]
pub fn peek_id(value: &Value) -> Option<&str> {
    value.as_object()?.get("id")?.as_str()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_wire_shape() {
        let req = RequestMessage::new("ping", json!({})).with_correlation("c1".into());
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"id": "ping", "data": {}, "correlationId": "c1"})
        );
    }

    #[test]
    fn request_without_data_reads_null() {
        let req: RequestMessage = serde_json::from_value(json!({"id": "ping"})).unwrap();
        assert_eq!(req.data, Value::Null);
        assert!(req.correlation_id.is_none());
    }

    #[test]
    fn reply_mirrors_response_fields() {
        let req = RequestMessage::new("team_create_ready", json!({"name": "a"}))
            .with_correlation("c9".into());
        let response = Response::completed("team_create", "c9", json!({"team": {"name": "a"}}), 5);
        let reply = ReplyMessage::for_request(&req, response.clone());
        assert_eq!(reply.id, "team_create_ready");
        assert_eq!(reply.correlation_id, Some("c9".into()));
        assert_eq!(reply.operation_type, "team_create");
        assert!(reply.success);
        assert_eq!(reply.data, response.data);
        assert_eq!(reply.timestamp, 5);
        assert_eq!(reply.response, response);
    }

    #[test]
    fn failed_response_wire_shape() {
        let response = Response::failed("boom", "boom_1", "bad", ErrorClass::Transient, 1);
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "success": false,
                "type": "boom",
                "error": "bad",
                "errorClass": "transient",
                "timestamp": 1,
                "messageId": "boom_1"
            })
        );
    }

    #[test]
    fn parse_classifies_requests_and_replies() {
        let req = json!({"id": "ping", "data": {"x": 1}});
        assert!(matches!(Frame::parse(&req), Some(Frame::Request(_))));

        let response = Response::completed("ping", "ping_1", json!({"pong": true}), 1);
        let reply = ReplyMessage::for_request(&RequestMessage::new("ping", Value::Null), response);
        let value = Frame::Reply(reply.clone()).to_value().unwrap();
        assert_eq!(Frame::parse(&value), Some(Frame::Reply(reply)));
    }

    #[test]
    fn parse_ignores_unrelated_traffic() {
        assert!(Frame::parse(&json!("hello")).is_none());
        assert!(Frame::parse(&json!({"type": "webpackOk"})).is_none());
        assert!(Frame::parse(&json!({"id": 7})).is_none());
        // A reply-looking frame with a malformed response is dropped too.
        assert!(Frame::parse(&json!({"id": "x", "response": 3})).is_none());
    }

    #[test]
    fn peek_id_reads_only_string_ids() {
        assert_eq!(peek_id(&json!({"id": "a"})), Some("a"));
        assert_eq!(peek_id(&json!({"id": 1})), None);
        assert_eq!(peek_id(&json!([])), None);
    }
}
