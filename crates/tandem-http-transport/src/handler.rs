//! Dual-Mode HTTP Adapter
//!
//! One handler serves both halves of the transport:
//! - `GET` opens (or resumes) a session and answers with its event stream
//! - `POST` takes exactly one JSON-RPC message, hands it upstream and answers
//!   202, except for the handshake whose reply is returned inline (200)
//!
//! The handler is independent of the socket layer: anything that produces a
//! `hyper::Request` with a byte body can drive it.

use std::sync::Arc;

use bytes::Bytes;
use http_body::Body;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::{HeaderMap, Method, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tandem_json_rpc::{JsonRpcErrorObject, JsonRpcMessage, JsonRpcRequest, MessageError};

use crate::TransportError;
use crate::correlator::PendingRequests;
use crate::cors::CorsLayer;
use crate::json_rpc_responses::{
    TransportBody, accepted_response, bad_request_response, jsonrpc_response,
    method_not_allowed_response, options_response, payload_too_large_response,
    rejection_response, service_unavailable_response,
};
use crate::protocol::{Negotiator, accepts_event_stream, accepts_json, extract_session_id};
use crate::reply_waiters::ReplyWaiters;
use crate::router::OutboundRouter;
use crate::server::TransportConfig;
use crate::session_registry::SessionRegistry;
use crate::sse::stream_response;
use crate::upstream::{MessageContext, MessageHandler};

/// HTTP request handler shared by every connection
#[derive(Clone)]
pub struct RequestHandler {
    config: Arc<TransportConfig>,
    negotiator: Arc<Negotiator>,
    sessions: Arc<SessionRegistry>,
    pending: Arc<PendingRequests>,
    waiters: Arc<ReplyWaiters>,
    router: OutboundRouter,
    upstream: Arc<dyn MessageHandler>,
    shutdown: CancellationToken,
}

/// What the client said it can receive
#[derive(Debug, Clone, Copy)]
struct Accepts {
    json: bool,
    event_stream: bool,
}

impl Accepts {
    fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            json: accepts_json(headers),
            event_stream: accepts_event_stream(headers),
        }
    }
}

impl RequestHandler {
    pub(crate) fn new(
        config: Arc<TransportConfig>,
        sessions: Arc<SessionRegistry>,
        pending: Arc<PendingRequests>,
        waiters: Arc<ReplyWaiters>,
        router: OutboundRouter,
        upstream: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            negotiator: Arc::new(Negotiator::from_config(&config)),
            config,
            sessions,
            pending,
            waiters,
            router,
            upstream,
            shutdown,
        }
    }

    /// Handle one HTTP request. Never fails: every outcome is an HTTP response.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<TransportBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        debug!("Handling {} {}", req.method(), req.uri().path());

        let response = if self.shutdown.is_cancelled() {
            service_unavailable_response()
        } else {
            match self.negotiator.negotiate(&req) {
                Err(rejection) => rejection_response(&rejection),
                Ok(()) => match req.method() {
                    &Method::GET => self.handle_get(req.headers()),
                    &Method::POST => self.handle_post(req).await,
                    &Method::OPTIONS if self.config.enable_cors => options_response(),
                    _ => method_not_allowed_response(),
                },
            }
        };

        self.finish(response)
    }

    fn handle_get(&self, headers: &HeaderMap) -> Response<TransportBody> {
        let stream = self.sessions.open(extract_session_id(headers));
        debug!(
            "GET stream for session {} (connection {})",
            stream.info.id, stream.info.connection
        );
        stream_response(Arc::clone(&self.sessions), stream, None)
    }

    async fn handle_post<B>(&self, req: Request<B>) -> Response<TransportBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let session_id = extract_session_id(req.headers());
        let accepts = Accepts::from_headers(req.headers());

        let limit = self.config.max_body_size;
        let body = match Limited::new(req.into_body(), limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
                warn!("POST body exceeds {} bytes", limit);
                return payload_too_large_response(limit);
            }
            Err(err) => {
                let err = TransportError::BodyRead(err.to_string());
                let response =
                    bad_request_response(JsonRpcErrorObject::parse_error(err.to_string()));
                self.report(&err);
                return response;
            }
        };

        let message = match JsonRpcMessage::parse(&body) {
            Ok(message) => message,
            Err(err @ MessageError::Malformed(_)) => {
                let response =
                    bad_request_response(JsonRpcErrorObject::parse_error(err.to_string()));
                self.report(&TransportError::Parse {
                    context: "Parse error in POST body".to_string(),
                    source: err,
                });
                return response;
            }
            Err(MessageError::Unrecognized(reason)) => {
                let response = bad_request_response(JsonRpcErrorObject::invalid_request(
                    reason.clone(),
                ));
                self.report(&TransportError::InvalidMessage(reason));
                return response;
            }
        };

        debug!(
            "POST {} {} (session: {})",
            message.kind(),
            message.method().unwrap_or_default(),
            session_id.as_deref().unwrap_or("none")
        );

        match message {
            JsonRpcMessage::Request(request) => {
                self.handle_request(request, session_id, accepts).await
            }
            JsonRpcMessage::Notification(notification) => {
                self.dispatch(notification.into(), session_id).await;
                accepted_response()
            }
            JsonRpcMessage::Response(response) => {
                // a client answering a server-initiated request
                self.dispatch(response.clone().into(), session_id).await;
                self.router.relay(response);
                accepted_response()
            }
        }
    }

    async fn handle_request(
        &self,
        request: JsonRpcRequest,
        session_id: Option<String>,
        accepts: Accepts,
    ) -> Response<TransportBody> {
        let id = request.id.clone();

        if self.replies_inline(&request, accepts) {
            // install before dispatch so a reply sent during dispatch is caught
            let mut waiter = self.waiters.install(id);
            self.dispatch(request.into(), session_id.clone()).await;

            let reply = tokio::select! {
                reply = waiter.wait() => reply,
                _ = self.shutdown.cancelled() => None,
            };
            return match reply {
                Some(reply) => jsonrpc_response(&reply, session_id.as_deref()),
                None => service_unavailable_response(),
            };
        }

        let Some(session) = session_id.clone() else {
            // uncorrelated: whatever reply comes back is broadcast
            self.dispatch(request.into(), None).await;
            return accepted_response();
        };

        self.pending.register(id.clone(), session.clone());

        if self.config.enable_post_sse
            && accepts.event_stream
            && !self.sessions.contains(&session)
        {
            let stream = self.sessions.open(Some(session));
            self.dispatch(request.into(), session_id).await;
            return stream_response(Arc::clone(&self.sessions), stream, Some(id));
        }

        self.dispatch(request.into(), session_id).await;
        accepted_response()
    }

    fn replies_inline(&self, request: &JsonRpcRequest, accepts: Accepts) -> bool {
        request.method == self.config.handshake_method
            || (self.config.sync_reply_for_json_only && accepts.json && !accepts.event_stream)
    }

    async fn dispatch(&self, message: JsonRpcMessage, session_id: Option<String>) {
        let context = MessageContext {
            session_id,
            sender: self.router.clone(),
        };
        self.upstream.on_message(message, context).await;
    }

    fn report(&self, err: &TransportError) {
        warn!("{}", err);
        self.upstream.on_error(err);
    }

    fn finish(&self, mut response: Response<TransportBody>) -> Response<TransportBody> {
        if self.config.enable_cors {
            CorsLayer::apply_cors_headers(response.headers_mut());
        }
        response
    }
}
