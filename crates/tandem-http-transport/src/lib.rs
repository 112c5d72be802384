//! # Tandem HTTP Transport
//!
//! Bidirectional JSON-RPC over plain HTTP POST plus Server-Sent Events.
//!
//! Clients open a long-lived event stream with `GET` and submit messages with
//! `POST`. The transport tracks one output stream per session, remembers which
//! session sent each request, and routes the upstream's eventual response
//! back to that session only. Server-initiated requests and notifications are
//! broadcast to every open session.
//!
//! ## Features
//! - Handshake fast path: the reply to the initialization request is returned
//!   in the POST response itself
//! - Per-session failure isolation on broadcast
//! - Session resumption by presenting a known `Mcp-Session-Id`
//! - Origin, protocol-version and `Accept` negotiation
//! - CORS support for browser-based clients

pub mod correlator;
pub mod cors;
pub mod handler;
pub mod json_rpc_responses;
pub mod protocol;
pub mod reply_waiters;
pub mod router;
pub mod server;
pub mod session_registry;
pub mod sse;
pub mod upstream;

#[cfg(test)]
mod tests;

pub use correlator::{PendingRequest, PendingRequests};
pub use cors::CorsLayer;
pub use handler::RequestHandler;
pub use json_rpc_responses::TransportBody;
pub use protocol::{
    DEFAULT_PROTOCOL_VERSION, Negotiator, PROTOCOL_VERSION_HEADER, Rejection, SESSION_ID_HEADER,
    extract_protocol_version, extract_session_id,
};
pub use reply_waiters::{ReplyWaiter, ReplyWaiters};
pub use router::{Delivery, OutboundRouter};
pub use server::{HttpTransport, HttpTransportBuilder, TransportConfig, TransportStats};
pub use session_registry::{
    BroadcastOutcome, OutboundFrame, SessionInfo, SessionRegistry, SessionStream,
    SessionWriteError, StreamConfig,
};
pub use upstream::{MessageContext, MessageHandler};

// Re-export the message types callers hand to `send()`
pub use tandem_json_rpc::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, MessageKind, RequestId,
};

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport errors
///
/// Only `Bind`, `AlreadyStarted` and `Closed` are returned to callers. The
/// rest are per-request or per-session conditions surfaced through
/// [`MessageHandler::on_error`] while the transport keeps running.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport already started")]
    AlreadyStarted,

    #[error("Transport closed")]
    Closed,

    #[error("{context}: {source}")]
    Parse {
        context: String,
        #[source]
        source: tandem_json_rpc::MessageError,
    },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Write to session {session_id} failed: {reason}")]
    SessionWrite {
        session_id: String,
        reason: SessionWriteError,
    },

    #[error("Failed to read request body: {0}")]
    BodyRead(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
