//! Shape-based message classification
//!
//! JSON-RPC carries no explicit message-kind field. A message is told apart
//! purely by which members it has:
//!
//! | `method` | `id` (non-null) | kind         |
//! |----------|-----------------|--------------|
//! | present  | present         | Request      |
//! | present  | absent or null  | Notification |
//! | absent   | present         | Response     |
//! | absent   | absent or null  | unrecognized |
//!
//! Classification happens once, in [`JsonRpcMessage::from_value`]; everything
//! downstream matches on the resulting enum.

use serde::Serialize;
use serde_json::Value;

use crate::{
    notification::JsonRpcNotification, request::JsonRpcRequest, response::JsonRpcResponse,
    types::RequestId,
};

/// The three message shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
}

impl MessageKind {
    /// Classify a raw JSON value by shape. Returns `None` for non-objects and
    /// for objects with neither `method` nor a non-null `id`.
    pub fn classify(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let has_method = object.contains_key("method");
        let has_id = object.get("id").is_some_and(|id| !id.is_null());

        match (has_method, has_id) {
            (true, true) => Some(MessageKind::Request),
            (true, false) => Some(MessageKind::Notification),
            (false, true) => Some(MessageKind::Response),
            (false, false) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Notification => "notification",
            MessageKind::Response => "response",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a payload could not become a [`JsonRpcMessage`]
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The bytes are not JSON at all
    #[error("Parse error: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Valid JSON that fits none of the message shapes
    #[error("Unrecognized JSON-RPC message: {0}")]
    Unrecognized(String),
}

/// A classified JSON-RPC message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Parse raw bytes. Malformed JSON and unrecognized shapes are reported
    /// as distinct errors.
    pub fn parse(bytes: &[u8]) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Classify and convert a JSON value in one pass
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let kind = MessageKind::classify(&value).ok_or_else(|| {
            MessageError::Unrecognized(describe_shape(&value).to_string())
        })?;

        let converted = match kind {
            MessageKind::Request => serde_json::from_value(value).map(JsonRpcMessage::Request),
            MessageKind::Notification => {
                serde_json::from_value(value).map(JsonRpcMessage::Notification)
            }
            MessageKind::Response => serde_json::from_value(value).map(JsonRpcMessage::Response),
        };

        converted.map_err(|err| MessageError::Unrecognized(format!("malformed {}: {}", kind, err)))
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            JsonRpcMessage::Request(_) => MessageKind::Request,
            JsonRpcMessage::Notification(_) => MessageKind::Notification,
            JsonRpcMessage::Response(_) => MessageKind::Response,
        }
    }

    /// The correlation id, if this kind carries one
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(request) => Some(&request.id),
            JsonRpcMessage::Notification(_) => None,
            JsonRpcMessage::Response(response) => Some(&response.id),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(request) => Some(&request.method),
            JsonRpcMessage::Notification(notification) => Some(&notification.method),
            JsonRpcMessage::Response(_) => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, JsonRpcMessage::Request(_))
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Notification(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, JsonRpcMessage::Response(_))
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl TryFrom<Value> for JsonRpcMessage {
    type Error = MessageError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(request: JsonRpcRequest) -> Self {
        JsonRpcMessage::Request(request)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(notification: JsonRpcNotification) -> Self {
        JsonRpcMessage::Notification(notification)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(response: JsonRpcResponse) -> Self {
        JsonRpcMessage::Response(response)
    }
}

fn describe_shape(value: &Value) -> &'static str {
    match value {
        Value::Object(_) => "object has neither 'method' nor a non-null 'id'",
        Value::Array(_) => "batches are not supported",
        _ => "message must be a JSON object",
    }
}
