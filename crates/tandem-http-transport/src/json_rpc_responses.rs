//! HTTP response builders
//!
//! Every response the adapter produces is built here so that status codes,
//! content types and error envelopes stay consistent. Builders never panic:
//! headers come from static values, and dynamic ones are skipped if they
//! cannot be represented.

use std::convert::Infallible;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::error;

use tandem_json_rpc::{JsonRpcError, JsonRpcErrorObject, JsonRpcResponse};

use crate::protocol::{Rejection, SESSION_ID_HEADER};

/// Body type of every transport response, streaming or not
pub type TransportBody = UnsyncBoxBody<Bytes, Infallible>;

pub fn full_body(bytes: impl Into<Bytes>) -> TransportBody {
    Full::new(bytes.into()).boxed_unsync()
}

pub fn empty_body() -> TransportBody {
    Empty::<Bytes>::new().boxed_unsync()
}

fn response(status: StatusCode, body: TransportBody) -> Response<TransportBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

fn json_body_response(status: StatusCode, value: &impl Serialize) -> Response<TransportBody> {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            let mut response = response(status, full_body(bytes));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(err) => {
            error!("Failed to serialize response body: {}", err);
            internal_error_response()
        }
    }
}

/// Attach the session id header, if the id is representable
pub fn with_session_id(
    mut response: Response<TransportBody>,
    session_id: Option<&str>,
) -> Response<TransportBody> {
    if let Some(value) = session_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_ID_HEADER), value);
    }
    response
}

/// 200 with a JSON-RPC response body (handshake fast path)
pub fn jsonrpc_response(
    reply: &JsonRpcResponse,
    session_id: Option<&str>,
) -> Response<TransportBody> {
    with_session_id(json_body_response(StatusCode::OK, reply), session_id)
}

/// 202, empty body: the message was taken and any reply travels over a stream
pub fn accepted_response() -> Response<TransportBody> {
    response(StatusCode::ACCEPTED, empty_body())
}

/// 400 with a JSON-RPC error envelope carrying a null id
pub fn bad_request_response(error: JsonRpcErrorObject) -> Response<TransportBody> {
    json_body_response(StatusCode::BAD_REQUEST, &JsonRpcError::new(None, error))
}

/// Render a negotiation failure. 400s carry a JSON-RPC envelope, the other
/// statuses plain text.
pub fn rejection_response(rejection: &Rejection) -> Response<TransportBody> {
    if rejection.status == StatusCode::BAD_REQUEST {
        return bad_request_response(JsonRpcErrorObject::invalid_request(
            rejection.message.clone(),
        ));
    }
    let mut response = response(rejection.status, full_body(rejection.message.clone()));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub fn method_not_allowed_response() -> Response<TransportBody> {
    let mut response = response(
        StatusCode::METHOD_NOT_ALLOWED,
        full_body(Bytes::from_static(b"Method not allowed")),
    );
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static("GET, POST, OPTIONS"));
    response
}

/// 204 for CORS preflight; the CORS layer adds the allow headers
pub fn options_response() -> Response<TransportBody> {
    response(StatusCode::NO_CONTENT, empty_body())
}

pub fn payload_too_large_response(limit: usize) -> Response<TransportBody> {
    error_envelope_response(
        StatusCode::PAYLOAD_TOO_LARGE,
        JsonRpcErrorObject::invalid_request(format!("Request body exceeds {} bytes", limit)),
    )
}

/// 503 for a waiting POST whose transport shut down underneath it
pub fn service_unavailable_response() -> Response<TransportBody> {
    error_envelope_response(
        StatusCode::SERVICE_UNAVAILABLE,
        JsonRpcErrorObject::internal_error(Some("Transport closed".to_string())),
    )
}

fn error_envelope_response(
    status: StatusCode,
    error: JsonRpcErrorObject,
) -> Response<TransportBody> {
    json_body_response(status, &JsonRpcError::new(None, error))
}

fn internal_error_response() -> Response<TransportBody> {
    response(
        StatusCode::INTERNAL_SERVER_ERROR,
        full_body(Bytes::from_static(b"Internal Server Error")),
    )
}
