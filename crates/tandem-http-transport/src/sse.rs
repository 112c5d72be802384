//! Server-Sent Events framing and stream bodies

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use hyper::header::{self, HeaderValue};
use hyper::{Response, StatusCode};
use tokio::time::{Instant, interval_at};
use tracing::debug;

use tandem_json_rpc::RequestId;

use crate::json_rpc_responses::{TransportBody, with_session_id};
use crate::session_registry::{SessionRegistry, SessionStream};

/// Comment frame sent when a stream has been idle for a keep-alive interval
pub const KEEPALIVE_FRAME: &[u8] = b": keepalive\n\n";

const MIN_KEEPALIVE: Duration = Duration::from_secs(1);

/// Frame a payload as one SSE event: every line gets a `data: ` prefix and a
/// blank line terminates the event.
pub fn format_data_frame(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + 8);
    for line in payload.split(|b| *b == b'\n') {
        frame.extend_from_slice(b"data: ");
        frame.extend_from_slice(line);
        frame.extend_from_slice(b"\n");
    }
    frame.extend_from_slice(b"\n");
    frame.freeze()
}

/// Releases the session when the stream body is dropped (client went away,
/// stream ended, or the response was never sent).
struct StreamGuard {
    sessions: Arc<SessionRegistry>,
    session_id: String,
    connection: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.sessions.release(&self.session_id, self.connection) {
            debug!("SSE stream for session {} closed", self.session_id);
        }
    }
}

/// Build the event-stream response for a freshly opened session.
///
/// With `close_after` set the stream ends right after delivering the
/// response to that request id; otherwise it lives until the client
/// disconnects or the session's sink is dropped.
pub fn stream_response(
    sessions: Arc<SessionRegistry>,
    stream: SessionStream,
    close_after: Option<RequestId>,
) -> Response<TransportBody> {
    let SessionStream { info, mut receiver } = stream;
    let session_id = info.id.clone();
    let period = sessions.config().keepalive_interval.max(MIN_KEEPALIVE);
    let guard = StreamGuard {
        sessions,
        session_id: info.id,
        connection: info.connection,
    };

    let frames = async_stream::stream! {
        let _guard = guard;
        let mut keepalive = interval_at(Instant::now() + period, period);

        loop {
            let (chunk, done) = tokio::select! {
                frame = receiver.recv() => match frame {
                    Some(frame) => {
                        let done = close_after.is_some() && frame.reply_to == close_after;
                        (format_data_frame(&frame.payload), done)
                    }
                    None => break,
                },
                _ = keepalive.tick() => (Bytes::from_static(KEEPALIVE_FRAME), false),
            };

            yield Ok::<_, Infallible>(Frame::data(chunk));
            if done {
                break;
            }
        }
    };

    let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));

    with_session_id(response, Some(&session_id))
}
