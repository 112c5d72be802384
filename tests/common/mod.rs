//! Shared helpers for the socket-level tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use tandem_http_transport::{
    HttpTransport, HttpTransportBuilder, JsonRpcMessage, JsonRpcResponse, MessageContext,
    MessageHandler, TransportError,
};

/// Answers every request with `{"echo": <method>, "session": <session>}`
#[derive(Default)]
pub struct Echo {
    pub errors: Mutex<Vec<String>>,
    pub seen: Mutex<Vec<String>>,
}

#[async_trait]
impl MessageHandler for Echo {
    async fn on_message(&self, message: JsonRpcMessage, context: MessageContext) {
        if let Some(method) = message.method() {
            self.seen.lock().unwrap().push(method.to_string());
        }
        if let JsonRpcMessage::Request(request) = message {
            context.send(JsonRpcResponse::success(
                request.id,
                json!({"echo": request.method, "session": context.session_id}),
            ));
        }
    }

    fn on_error(&self, error: &TransportError) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

/// A started transport on an ephemeral port
pub struct Harness {
    pub transport: HttpTransport,
    pub handler: Arc<Echo>,
    pub url: String,
    pub client: reqwest::Client,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(|b| b).await
    }

    pub async fn start_with(
        configure: impl FnOnce(HttpTransportBuilder) -> HttpTransportBuilder,
    ) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let handler = Arc::new(Echo::default());
        let transport = configure(
            HttpTransport::builder()
                .bind_address(SocketAddr::from(([127, 0, 0, 1], 0)))
                .shared_handler(handler.clone()),
        )
        .build();
        let addr = transport.start().await.expect("transport should start");

        Self {
            transport,
            handler,
            url: format!("http://{addr}/mcp"),
            client: reqwest::Client::new(),
        }
    }

    /// Open an event stream, returning the response and its session id
    pub async fn open_stream(&self, session_id: Option<&str>) -> (reqwest::Response, String) {
        let mut request = self
            .client
            .get(&self.url)
            .header("Accept", "text/event-stream");
        if let Some(id) = session_id {
            request = request.header("Mcp-Session-Id", id);
        }
        let response = request.send().await.expect("GET should succeed");
        assert_eq!(response.status(), 200);
        let session = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
            .expect("stream response carries a session id")
            .to_string();
        (response, session)
    }

    pub async fn post(
        &self,
        session_id: Option<&str>,
        body: impl Into<reqwest::Body>,
    ) -> reqwest::Response {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(body);
        if let Some(id) = session_id {
            request = request.header("Mcp-Session-Id", id);
        }
        request.send().await.expect("POST should succeed")
    }

    pub async fn post_json(&self, session_id: Option<&str>, value: Value) -> reqwest::Response {
        self.post(session_id, value.to_string()).await
    }
}

/// Read until one complete event arrives and return its decoded `data:` payload
pub async fn next_event(response: &mut reqwest::Response) -> Option<Value> {
    let mut buffer = String::new();
    loop {
        let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .ok()?
            .ok()??;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(end) = buffer.find("\n\n") {
            let event: String = buffer.drain(..end + 2).collect();
            let data: Vec<&str> = event
                .lines()
                .filter_map(|line| line.strip_prefix("data: "))
                .collect();
            if !data.is_empty() {
                return serde_json::from_str(&data.join("\n")).ok();
            }
        }
    }
}
