//! Session Registry
//!
//! Owns every live streaming connection. A session is an opaque id bound to
//! at most one open output sink (the sending half of the channel that feeds
//! an SSE response body). The registry is the only place a session's
//! lifetime is decided:
//! - [`SessionRegistry::open`] registers a sink, replacing any previous one
//!   under the same id
//! - stream cancellation calls [`SessionRegistry::release`], scoped to the
//!   connection that opened it
//! - a failed write removes the session before the failure is reported

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use tandem_json_rpc::RequestId;

/// Configuration for session streams
///
/// Session sinks are unbounded: a write only fails once the stream reading
/// from it has gone away.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Interval between `: keepalive` comment frames
    pub keepalive_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// One serialized JSON-RPC message queued for a session
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Compact JSON text of the message
    pub payload: Bytes,
    /// Set when the payload is a response, so a per-call stream knows when it is done
    pub reply_to: Option<RequestId>,
}

impl OutboundFrame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            reply_to: None,
        }
    }

    pub fn reply(payload: impl Into<Bytes>, id: RequestId) -> Self {
        Self {
            payload: payload.into(),
            reply_to: Some(id),
        }
    }
}

/// Why a write to a session did not happen
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionWriteError {
    #[error("session not found")]
    NotFound,
    #[error("stream closed")]
    Closed,
}

/// Snapshot of a registered session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    /// Generation of the stream currently bound to this id
    pub connection: u64,
    pub opened_at: Instant,
}

/// Receiving half handed to the SSE body for a freshly opened session
#[derive(Debug)]
pub struct SessionStream {
    pub info: SessionInfo,
    pub receiver: mpsc::UnboundedReceiver<OutboundFrame>,
}

/// Outcome of writing one frame to every open session
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, SessionWriteError)>,
}

impl BroadcastOutcome {
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }
}

struct SessionEntry {
    connection: u64,
    sender: mpsc::UnboundedSender<OutboundFrame>,
    opened_at: Instant,
}

impl SessionEntry {
    fn info(&self, id: &str) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            connection: self.connection,
            opened_at: self.opened_at,
        }
    }
}

/// Registry of open sessions, shared by the HTTP adapter and the outbound router
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    next_connection: AtomicU64,
    config: StreamConfig,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_config(StreamConfig::default())
    }

    pub fn with_config(config: StreamConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            config,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Mint a fresh, unguessable session id
    pub fn generate_session_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Register a sink under `id` (resumption) or under a newly minted id.
    ///
    /// A previous sink for the same id is dropped, which ends its stream.
    pub fn open(&self, id: Option<String>) -> SessionStream {
        let id = id.unwrap_or_else(Self::generate_session_id);
        let (sender, receiver) = mpsc::unbounded_channel();
        let entry = SessionEntry {
            connection: self.next_connection.fetch_add(1, Ordering::Relaxed),
            sender,
            opened_at: Instant::now(),
        };
        let info = entry.info(&id);

        let replaced = self.sessions.lock().insert(id.clone(), entry);
        match replaced {
            Some(previous) => debug!(
                "Session {} resumed on connection {} (replacing connection {})",
                id, info.connection, previous.connection
            ),
            None => debug!("Session {} opened on connection {}", id, info.connection),
        }

        SessionStream { info, receiver }
    }

    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.lock().get(id).map(|entry| entry.info(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Remove a session regardless of which connection owns it
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.lock().remove(id).is_some();
        if removed {
            debug!("Session {} removed", id);
        }
        removed
    }

    /// Remove a session only if `connection` still owns it. Used by stream
    /// cancellation so that a stale stream cannot evict a resumed one.
    pub fn release(&self, id: &str, connection: u64) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(id) {
            Some(entry) if entry.connection == connection => {
                sessions.remove(id);
                debug!("Session {} released by connection {}", id, connection);
                true
            }
            _ => false,
        }
    }

    /// Queue a frame for one session. A closed sink removes the session
    /// atomically with the failed attempt.
    pub fn write_to(&self, id: &str, frame: OutboundFrame) -> Result<(), SessionWriteError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.get(id).ok_or(SessionWriteError::NotFound)?;

        match try_write(entry, frame) {
            Ok(()) => Ok(()),
            Err(err) => {
                sessions.remove(id);
                warn!("Write to session {} failed ({}); session removed", id, err);
                Err(err)
            }
        }
    }

    /// Queue a frame for every open session. A failing session is removed
    /// and does not affect delivery to the others.
    pub fn broadcast(&self, frame: &OutboundFrame) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();
        let mut sessions = self.sessions.lock();

        sessions.retain(|id, entry| match try_write(entry, frame.clone()) {
            Ok(()) => {
                outcome.delivered.push(id.clone());
                true
            }
            Err(err) => {
                warn!("Broadcast to session {} failed ({}); session removed", id, err);
                outcome.failed.push((id.clone(), err));
                false
            }
        });

        outcome
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Drop every sink, ending all open streams. Returns how many were open.
    pub fn clear(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let count = sessions.len();
        sessions.clear();
        count
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn try_write(entry: &SessionEntry, frame: OutboundFrame) -> Result<(), SessionWriteError> {
    entry
        .sender
        .send(frame)
        .map_err(|_| SessionWriteError::Closed)
}
