//! # JSON-RPC 2.0 Messages
//!
//! Transport-agnostic JSON-RPC 2.0 types used by the tandem HTTP transport.
//! The crate carries no I/O: it only knows how to represent messages and how
//! to tell them apart.
//!
//! ## Features
//! - Requests, notifications and responses as distinct types
//! - A single classification pass from raw JSON into [`JsonRpcMessage`]
//! - Malformed input kept separate from well-formed but unrecognized input

pub mod error;
pub mod message;
pub mod notification;
pub mod request;
pub mod response;
pub mod types;

// Re-export main types
pub use error::{JsonRpcError, JsonRpcErrorCode, JsonRpcErrorObject};
pub use message::{JsonRpcMessage, MessageError, MessageKind};
pub use notification::JsonRpcNotification;
pub use request::{JsonRpcRequest, RequestParams};
pub use response::{JsonRpcResponse, ResponsePayload};
pub use types::{JsonRpcVersion, RequestId};

/// JSON-RPC 2.0 version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    // Server error range: -32099 to -32000
    pub const SERVER_ERROR_START: i64 = -32099;
    pub const SERVER_ERROR_END: i64 = -32000;
}
