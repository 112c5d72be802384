//! Outbound Router
//!
//! Implements `send()`. Responses go back to the session that sent the
//! matching request; everything else is broadcast. A response that a
//! synchronous POST is waiting for never reaches a stream at all.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, error, warn};

use tandem_json_rpc::{JsonRpcMessage, JsonRpcResponse, MessageKind, RequestId};

use crate::TransportError;
use crate::correlator::PendingRequests;
use crate::reply_waiters::ReplyWaiters;
use crate::session_registry::{BroadcastOutcome, OutboundFrame, SessionRegistry};
use crate::upstream::MessageHandler;

/// Where a sent message ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Answered a waiting POST in its own HTTP response
    Inline,
    /// Written to the one session that sent the request
    Session(String),
    /// Written to every open session (possibly none)
    Broadcast(BroadcastOutcome),
    /// Could not be serialized
    Undeliverable,
}

/// Cloneable handle onto the outbound path
#[derive(Clone)]
pub struct OutboundRouter {
    sessions: Arc<SessionRegistry>,
    pending: Arc<PendingRequests>,
    waiters: Arc<ReplyWaiters>,
    handler: Arc<dyn MessageHandler>,
}

impl OutboundRouter {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        pending: Arc<PendingRequests>,
        waiters: Arc<ReplyWaiters>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            sessions,
            pending,
            waiters,
            handler,
        }
    }

    /// Route one outbound message. Never fails: write failures are reported
    /// through the error hook and fall back to broadcast.
    pub fn send(&self, message: impl Into<JsonRpcMessage>) -> Delivery {
        match message.into() {
            JsonRpcMessage::Response(response) => self.send_response(response),
            message => {
                let kind = message.kind();
                debug!(
                    "Broadcasting server-initiated {} {}",
                    kind,
                    message.method().unwrap_or_default()
                );
                match self.encode(&message, None) {
                    Some(frame) => Delivery::Broadcast(self.broadcast(&frame)),
                    None => Delivery::Undeliverable,
                }
            }
        }
    }

    /// Route a raw JSON value. Values that fit no message shape are
    /// broadcast as-is.
    pub fn send_value(&self, value: Value) -> Delivery {
        if MessageKind::classify(&value).is_some() {
            match JsonRpcMessage::from_value(value.clone()) {
                Ok(message) => return self.send(message),
                Err(err) => warn!("Outbound value failed conversion ({}); broadcasting", err),
            }
        } else {
            warn!("Outbound value is not a recognizable JSON-RPC message; broadcasting");
        }

        match serde_json::to_vec(&value) {
            Ok(payload) => Delivery::Broadcast(self.broadcast(&OutboundFrame::new(payload))),
            Err(err) => {
                self.report(&TransportError::Serialization(err));
                Delivery::Undeliverable
            }
        }
    }

    fn send_response(&self, response: JsonRpcResponse) -> Delivery {
        match self.waiters.resolve(response) {
            Ok(()) => Delivery::Inline,
            Err(response) => self.relay(response),
        }
    }

    /// Route a response to its correlated session, else broadcast. Never
    /// completes a waiting synchronous POST, so a client-submitted response
    /// cannot stand in for the upstream's reply.
    pub(crate) fn relay(&self, response: JsonRpcResponse) -> Delivery {
        let id = response.id.clone();
        let Some(frame) = self.encode(&JsonRpcMessage::Response(response), Some(id.clone()))
        else {
            return Delivery::Undeliverable;
        };

        let Some(session_id) = self.pending.take(&id) else {
            warn!(
                "No pending request for response {}; broadcasting to {} session(s)",
                id,
                self.sessions.len()
            );
            return Delivery::Broadcast(self.broadcast(&frame));
        };

        match self.sessions.write_to(&session_id, frame.clone()) {
            Ok(()) => {
                debug!("Response {} delivered to session {}", id, session_id);
                Delivery::Session(session_id)
            }
            Err(reason) => {
                self.report(&TransportError::SessionWrite { session_id, reason });
                Delivery::Broadcast(self.broadcast(&frame))
            }
        }
    }

    fn broadcast(&self, frame: &OutboundFrame) -> BroadcastOutcome {
        let outcome = self.sessions.broadcast(frame);
        for (session_id, reason) in &outcome.failed {
            self.report(&TransportError::SessionWrite {
                session_id: session_id.clone(),
                reason: reason.clone(),
            });
        }
        outcome
    }

    fn encode(
        &self,
        message: &JsonRpcMessage,
        reply_to: Option<RequestId>,
    ) -> Option<OutboundFrame> {
        match serde_json::to_vec(message) {
            Ok(payload) => Some(OutboundFrame {
                payload: Bytes::from(payload),
                reply_to,
            }),
            Err(err) => {
                self.report(&TransportError::Serialization(err));
                None
            }
        }
    }

    fn report(&self, err: &TransportError) {
        error!("{}", err);
        self.handler.on_error(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_registry::SessionWriteError;
    use crate::upstream::MessageContext;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use tandem_json_rpc::{JsonRpcNotification, JsonRpcRequest};

    #[derive(Default)]
    struct ErrorLog {
        errors: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for ErrorLog {
        async fn on_message(&self, _message: JsonRpcMessage, _context: MessageContext) {}

        fn on_error(&self, error: &TransportError) {
            self.errors.lock().push(error.to_string());
        }
    }

    struct Fixture {
        sessions: Arc<SessionRegistry>,
        pending: Arc<PendingRequests>,
        waiters: Arc<ReplyWaiters>,
        log: Arc<ErrorLog>,
        router: OutboundRouter,
    }

    fn fixture() -> Fixture {
        let sessions = Arc::new(SessionRegistry::new());
        let pending = Arc::new(PendingRequests::new());
        let waiters = Arc::new(ReplyWaiters::new());
        let log = Arc::new(ErrorLog::default());
        let router = OutboundRouter::new(
            Arc::clone(&sessions),
            Arc::clone(&pending),
            Arc::clone(&waiters),
            log.clone(),
        );
        Fixture {
            sessions,
            pending,
            waiters,
            log,
            router,
        }
    }

    #[tokio::test]
    async fn test_response_goes_only_to_correlated_session() {
        let f = fixture();
        let mut target = f.sessions.open(Some("abc123".to_string()));
        let mut other = f.sessions.open(Some("other".to_string()));
        f.pending.register(RequestId::from(1), "abc123");

        let delivery = f.router.send(JsonRpcResponse::success(1, json!({})));

        assert_eq!(delivery, Delivery::Session("abc123".to_string()));
        let frame = target.receiver.recv().await.unwrap();
        assert_eq!(frame.payload, r#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
        assert_eq!(frame.reply_to, Some(RequestId::from(1)));
        assert!(other.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_response_with_same_id_is_broadcast() {
        let f = fixture();
        let _a = f.sessions.open(Some("a".to_string()));
        let _b = f.sessions.open(Some("b".to_string()));
        f.pending.register(RequestId::from(1), "a");

        assert!(matches!(
            f.router.send(JsonRpcResponse::success(1, json!({}))),
            Delivery::Session(_)
        ));
        match f.router.send(JsonRpcResponse::success(1, json!({}))) {
            Delivery::Broadcast(outcome) => assert_eq!(outcome.delivered_count(), 2),
            other => panic!("expected broadcast, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dead_session_falls_back_to_broadcast() {
        let f = fixture();
        let dead = f.sessions.open(Some("dead".to_string()));
        let mut alive = f.sessions.open(Some("alive".to_string()));
        drop(dead);
        f.pending.register(RequestId::from("r1"), "dead");

        match f.router.send(JsonRpcResponse::success("r1", json!(true))) {
            Delivery::Broadcast(outcome) => {
                assert_eq!(outcome.delivered, vec!["alive".to_string()]);
            }
            other => panic!("expected broadcast, got {:?}", other),
        }
        assert!(!f.sessions.contains("dead"));
        assert!(alive.receiver.recv().await.is_some());

        let errors = f.log.errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("dead"));
        assert!(errors[0].contains(&SessionWriteError::Closed.to_string()));
    }

    #[tokio::test]
    async fn test_requests_and_notifications_are_broadcast() {
        let f = fixture();
        let mut a = f.sessions.open(Some("a".to_string()));
        let mut b = f.sessions.open(Some("b".to_string()));

        f.router.send(JsonRpcRequest::new("srv-1", "sampling/createMessage"));
        f.router.send(JsonRpcNotification::new("notifications/progress"));

        for stream in [&mut a, &mut b] {
            let first = stream.receiver.recv().await.unwrap();
            assert!(first.reply_to.is_none());
            let second = stream.receiver.recv().await.unwrap();
            assert_eq!(
                second.payload,
                r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#
            );
        }
    }

    #[tokio::test]
    async fn test_waiting_post_takes_priority() {
        let f = fixture();
        let mut stream = f.sessions.open(Some("s".to_string()));
        f.pending.register(RequestId::from(0), "s");
        let mut waiter = f.waiters.install(RequestId::from(0));

        assert_eq!(
            f.router.send(JsonRpcResponse::success(0, json!({"v": 1}))),
            Delivery::Inline
        );
        assert!(waiter.wait().await.is_some());
        assert!(stream.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relay_never_completes_a_waiting_post() {
        let f = fixture();
        let mut stream = f.sessions.open(Some("s".to_string()));
        let mut waiter = f.waiters.install(RequestId::from("init-a"));

        let delivery = f.router.relay(JsonRpcResponse::success("init-a", json!({"v": 1})));

        assert!(matches!(delivery, Delivery::Broadcast(_)));
        assert!(stream.receiver.recv().await.is_some());
        assert_eq!(f.waiters.len(), 1);

        assert_eq!(
            f.router.send(JsonRpcResponse::success("init-a", json!({"v": 2}))),
            Delivery::Inline
        );
        assert_eq!(waiter.wait().await.unwrap().result(), Some(&json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_unrecognized_value_is_broadcast() {
        let f = fixture();
        let mut stream = f.sessions.open(None);

        let delivery = f.router.send_value(json!({"jsonrpc": "2.0", "hello": "world"}));

        assert!(matches!(delivery, Delivery::Broadcast(_)));
        let frame = stream.receiver.recv().await.unwrap();
        let echoed: Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(echoed, json!({"jsonrpc": "2.0", "hello": "world"}));
    }
}
