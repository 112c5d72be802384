//! Protocol Negotiator
//!
//! Header conventions and the checks every inbound HTTP request passes
//! before the adapter looks at it. Checks run in a fixed order and the first
//! failure wins:
//!
//! 1. path matches the endpoint, else 404
//! 2. `Origin`, if present, is loopback or allow-listed, else 403
//! 3. `MCP-Protocol-Version`, if present, is supported, else 400
//! 4. `Mcp-Session-Id`, if present, is well-formed, else 400
//! 5. POST only: `Accept` admits JSON or an event stream, else 400
//!
//! A rejection is an expected client-side condition. It becomes an HTTP
//! status and never reaches the upstream error hook.

use std::net::IpAddr;

use hyper::{HeaderMap, Method, Request, StatusCode, header};
use tracing::warn;
use url::{Host, Url};

use crate::server::TransportConfig;

/// Session identifier header, on requests and on stream responses
pub const SESSION_ID_HEADER: &str = "mcp-session-id";
/// Protocol version request header
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";
/// The protocol version spoken when the client does not say
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-06-18";

/// A request refused during negotiation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{status}: {message}")]
pub struct Rejection {
    pub status: StatusCode,
    pub message: String,
}

impl Rejection {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Validates path, origin, version, session id and content negotiation
#[derive(Debug, Clone)]
pub struct Negotiator {
    path: String,
    protocol_versions: Vec<String>,
    allowed_origins: Vec<String>,
}

impl Negotiator {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            protocol_versions: vec![DEFAULT_PROTOCOL_VERSION.to_string()],
            allowed_origins: Vec::new(),
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            path: config.path.clone(),
            protocol_versions: config.protocol_versions.clone(),
            allowed_origins: config.allowed_origins.clone(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn negotiate<B>(&self, req: &Request<B>) -> Result<(), Rejection> {
        let outcome = self.check(req);
        if let Err(rejection) = &outcome {
            warn!(
                "Rejected {} {}: {}",
                req.method(),
                req.uri().path(),
                rejection
            );
        }
        outcome
    }

    fn check<B>(&self, req: &Request<B>) -> Result<(), Rejection> {
        if req.uri().path() != self.path {
            return Err(Rejection::new(StatusCode::NOT_FOUND, "Not Found"));
        }

        let headers = req.headers();

        if let Some(origin) = headers.get(header::ORIGIN) {
            let allowed = origin
                .to_str()
                .map(|origin| self.origin_allowed(origin))
                .unwrap_or(false);
            if !allowed {
                return Err(Rejection::new(StatusCode::FORBIDDEN, "Origin not allowed"));
            }
        }

        if let Some(version) = headers.get(PROTOCOL_VERSION_HEADER) {
            let supported = version
                .to_str()
                .map(|v| self.protocol_versions.iter().any(|known| known == v))
                .unwrap_or(false);
            if !supported {
                return Err(Rejection::new(
                    StatusCode::BAD_REQUEST,
                    format!(
                        "Unsupported protocol version (supported: {})",
                        self.protocol_versions.join(", ")
                    ),
                ));
            }
        }

        if let Some(session_id) = headers.get(SESSION_ID_HEADER)
            && !is_valid_session_id(session_id.as_bytes())
        {
            return Err(Rejection::new(
                StatusCode::BAD_REQUEST,
                "Malformed session id",
            ));
        }

        if req.method() == Method::POST && !accepts_json(headers) && !accepts_event_stream(headers)
        {
            return Err(Rejection::new(
                StatusCode::BAD_REQUEST,
                "Accept must include application/json or text/event-stream",
            ));
        }

        Ok(())
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        if self.allowed_origins.iter().any(|allowed| allowed == origin) {
            return true;
        }
        let Ok(url) = Url::parse(origin) else {
            return false;
        };
        if let Some(host) = url.host_str()
            && self.allowed_origins.iter().any(|allowed| allowed == host)
        {
            return true;
        }
        is_loopback_origin(&url)
    }
}

/// `localhost`, any `127.0.0.0/8` address, or `::1`
pub fn is_loopback_origin(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}

/// Non-empty and visible ASCII only
pub fn is_valid_session_id(id: &[u8]) -> bool {
    !id.is_empty() && id.iter().all(|b| (0x21..=0x7e).contains(b))
}

fn media_types(headers: &HeaderMap) -> impl Iterator<Item = String> + '_ {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|item| {
            item.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
}

pub fn accepts_json(headers: &HeaderMap) -> bool {
    media_types(headers).any(|media| {
        media == "application/json"
            || media == "application/*"
            || media == "*/*"
            || media.ends_with("+json")
    })
}

pub fn accepts_event_stream(headers: &HeaderMap) -> bool {
    media_types(headers).any(|media| media == "text/event-stream")
}

/// Extract the protocol version, falling back to the default
pub fn extract_protocol_version(headers: &HeaderMap) -> &str {
    headers
        .get(PROTOCOL_VERSION_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or(DEFAULT_PROTOCOL_VERSION)
}

/// Extract the session id header
pub fn extract_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
}
