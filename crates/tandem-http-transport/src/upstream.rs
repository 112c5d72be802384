//! The three hooks the application layer plugs into

use async_trait::async_trait;
use serde_json::Value;

use tandem_json_rpc::JsonRpcMessage;

use crate::TransportError;
use crate::router::{Delivery, OutboundRouter};

/// Upstream consumer of inbound messages.
///
/// `on_message` is awaited by the POST handler before it answers, so
/// long-running work should be spawned and its result handed to
/// [`MessageContext::send`] later.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: JsonRpcMessage, context: MessageContext);

    /// Non-fatal transport conditions (parse failures, dead sessions)
    fn on_error(&self, _error: &TransportError) {}

    /// Called once when the transport shuts down
    fn on_close(&self) {}
}

/// Where an inbound message came from, plus a handle to reply with
#[derive(Clone)]
pub struct MessageContext {
    pub session_id: Option<String>,
    pub sender: OutboundRouter,
}

impl MessageContext {
    pub fn send(&self, message: impl Into<JsonRpcMessage>) -> Delivery {
        self.sender.send(message)
    }

    pub fn send_value(&self, value: Value) -> Delivery {
        self.sender.send_value(value)
    }
}

/// Used when no handler is configured: messages are dropped after logging
pub(crate) struct NoopHandler;

#[async_trait]
impl MessageHandler for NoopHandler {
    async fn on_message(&self, message: JsonRpcMessage, _context: MessageContext) {
        tracing::debug!("No message handler configured; dropping {}", message.kind());
    }
}
