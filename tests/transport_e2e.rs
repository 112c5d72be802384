//! End-to-end tests over a real socket
//!
//! These exercise the HTTP surface the way a client would: open an event
//! stream, post messages, and read replies off the stream.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{Harness, next_event};

#[tokio::test]
async fn test_get_then_post_delivers_reply_on_stream() {
    let harness = Harness::start().await;
    let (mut stream, session) = harness.open_stream(None).await;

    let response = harness
        .post_json(
            Some(&session),
            json!({"jsonrpc": "2.0", "id": 7, "method": "ping"}),
        )
        .await;
    assert_eq!(response.status(), 202);

    let event = next_event(&mut stream).await.expect("reply event");
    assert_eq!(event["id"], 7);
    assert_eq!(event["result"]["echo"], "ping");
    assert_eq!(event["result"]["session"], session.as_str());

    harness.transport.close().await;
}

#[tokio::test]
async fn test_handshake_reply_is_inline() {
    let harness = Harness::start().await;

    let response = harness
        .post_json(
            None,
            json!({"jsonrpc": "2.0", "id": 0, "method": "initialize", "params": {}}),
        )
        .await;
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["id"], 0);
    assert_eq!(body["result"]["echo"], "initialize");

    harness.transport.close().await;
}

#[tokio::test]
async fn test_concurrent_handshakes_get_their_own_replies() {
    let harness = Harness::start().await;

    let mut tasks = Vec::new();
    for id in 0..8 {
        let client = harness.client.clone();
        let url = harness.url.clone();
        tasks.push(tokio::spawn(async move {
            let response = client
                .post(&url)
                .header("Content-Type", "application/json")
                .header("Accept", "application/json")
                .body(json!({"jsonrpc": "2.0", "id": id, "method": "initialize"}).to_string())
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 200);
            let body: serde_json::Value = response.json().await.unwrap();
            (id, body)
        }));
    }

    for task in tasks {
        let (id, body) = task.await.unwrap();
        assert_eq!(body["id"], id);
    }
    assert_eq!(harness.transport.stats().awaiting_handshakes, 0);

    harness.transport.close().await;
}

#[tokio::test]
async fn test_malformed_body_is_rejected_and_reported() {
    let harness = Harness::start().await;

    let response = harness.post(None, "{not json").await;
    assert_eq!(response.status(), 400);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32700);
    assert!(body["id"].is_null());

    let errors = harness.handler.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Parse error in POST body"));

    harness.transport.close().await;
}

#[tokio::test]
async fn test_server_notification_reaches_every_stream() {
    let harness = Harness::start().await;
    let (mut first, _) = harness.open_stream(None).await;
    let (mut second, _) = harness.open_stream(None).await;

    harness.transport.send_value(json!({
        "jsonrpc": "2.0",
        "method": "notifications/message",
        "params": {"level": "info"}
    }));

    for stream in [&mut first, &mut second] {
        let event = next_event(stream).await.expect("broadcast event");
        assert_eq!(event["method"], "notifications/message");
        assert!(event.get("id").is_none());
    }

    harness.transport.close().await;
}

#[tokio::test]
async fn test_close_ends_open_streams() {
    let harness = Harness::start().await;
    let (mut stream, _) = harness.open_stream(None).await;

    harness.transport.close().await;

    let chunk = tokio::time::timeout(Duration::from_secs(5), stream.chunk())
        .await
        .expect("stream should end promptly");
    assert!(!matches!(chunk, Ok(Some(_))));
    assert!(harness.transport.is_closed());
}
