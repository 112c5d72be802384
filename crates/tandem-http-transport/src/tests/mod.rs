//! Adapter-level tests
//!
//! These drive [`RequestHandler`](crate::RequestHandler) directly with
//! in-memory bodies, so every HTTP path is covered without sockets.


use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Response, header};
use parking_lot::Mutex;
use serde_json::{Value, json};

use tandem_json_rpc::{JsonRpcMessage, JsonRpcResponse};

use crate::json_rpc_responses::TransportBody;
use crate::upstream::{MessageContext, MessageHandler};
use crate::{HttpTransport, HttpTransportBuilder, TransportError};

/// Upstream that records everything and optionally answers requests
#[derive(Default)]
pub(crate) struct Recorder {
    pub messages: Mutex<Vec<(JsonRpcMessage, Option<String>)>>,
    pub errors: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
    pub answer_requests: bool,
}

impl Recorder {
    /// Records, never replies
    pub fn silent() -> Self {
        Self::default()
    }

    /// Replies to every request with `{"method": <method>}`
    pub fn answering() -> Self {
        Self {
            answer_requests: true,
            ..Self::default()
        }
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn on_message(&self, message: JsonRpcMessage, context: MessageContext) {
        if self.answer_requests
            && let JsonRpcMessage::Request(request) = &message
        {
            context.send(JsonRpcResponse::success(
                request.id.clone(),
                json!({"method": request.method}),
            ));
        }
        self.messages.lock().push((message, context.session_id));
    }

    fn on_error(&self, error: &TransportError) {
        self.errors.lock().push(error.to_string());
    }

    fn on_close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Build a transport around a shared recorder
pub(crate) fn transport_with(
    recorder: std::sync::Arc<Recorder>,
    configure: impl FnOnce(HttpTransportBuilder) -> HttpTransportBuilder,
) -> HttpTransport {
    configure(HttpTransport::builder().shared_handler(recorder)).build()
}

pub(crate) fn get(session_id: Option<&str>) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(Method::GET)
        .uri("/mcp")
        .header(header::ACCEPT, "text/event-stream");
    if let Some(id) = session_id {
        builder = builder.header("Mcp-Session-Id", id);
    }
    builder.body(Full::new(Bytes::new())).unwrap()
}

pub(crate) fn post(session_id: Option<&str>, body: impl Into<Bytes>) -> Request<Full<Bytes>> {
    post_with_accept(session_id, "application/json, text/event-stream", body)
}

pub(crate) fn post_with_accept(
    session_id: Option<&str>,
    accept: &str,
    body: impl Into<Bytes>,
) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCEPT, accept);
    if let Some(id) = session_id {
        builder = builder.header("Mcp-Session-Id", id);
    }
    builder.body(Full::new(body.into())).unwrap()
}

pub(crate) fn post_json(session_id: Option<&str>, value: Value) -> Request<Full<Bytes>> {
    post(session_id, serde_json::to_vec(&value).unwrap())
}

pub(crate) async fn body_json(response: Response<TransportBody>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Next data chunk of a streaming body, `None` once the stream has ended
pub(crate) async fn next_chunk(body: &mut TransportBody) -> Option<String> {
    let frame = body.frame().await?.ok()?;
    let data = frame.into_data().ok()?;
    Some(String::from_utf8_lossy(&data).into_owned())
}
