//! Pending-Request Correlator
//!
//! Remembers which session sent a request so that the eventual response can
//! be written back to that session only. Session ids stored here are weak
//! references: the session may have gone away by the time the response
//! arrives, and the router treats that as an ordinary write failure.
//!
//! Entries are consumed by [`PendingRequests::take`] (at-most-once delivery)
//! or aged out by [`PendingRequests::sweep`]. Nothing here schedules sweeps.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use tandem_json_rpc::RequestId;

/// An in-flight request awaiting its response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub session_id: String,
    pub created_at: Instant,
}

/// Map from request id to the session that must receive the response
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `session_id` awaits the response to `request_id`.
    /// Returns the entry it displaced, if the id was already pending.
    pub fn register(
        &self,
        request_id: RequestId,
        session_id: impl Into<String>,
    ) -> Option<PendingRequest> {
        let pending = PendingRequest {
            request_id: request_id.clone(),
            session_id: session_id.into(),
            created_at: Instant::now(),
        };
        debug!(
            "Correlating request {} with session {}",
            pending.request_id, pending.session_id
        );

        let displaced = self.entries.lock().insert(request_id, pending);
        if let Some(previous) = &displaced {
            warn!(
                "Request id {} was already pending for session {}; replacing it",
                previous.request_id, previous.session_id
            );
        }
        displaced
    }

    /// Consume the correlation for `request_id`
    pub fn take(&self, request_id: &RequestId) -> Option<String> {
        self.entries
            .lock()
            .remove(request_id)
            .map(|pending| pending.session_id)
    }

    pub fn get(&self, request_id: &RequestId) -> Option<PendingRequest> {
        self.entries.lock().get(request_id).cloned()
    }

    /// Drop every correlation whose age has reached `max_age`.
    /// `sweep(Duration::ZERO)` empties the map.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, pending| now.duration_since(pending.created_at) < max_age);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_take_is_at_most_once() {
        let pending = PendingRequests::new();
        pending.register(RequestId::from(1), "abc123");

        assert_eq!(pending.take(&RequestId::from(1)), Some("abc123".to_string()));
        assert_eq!(pending.take(&RequestId::from(1)), None);
    }

    #[tokio::test]
    async fn test_string_and_number_ids_are_distinct() {
        let pending = PendingRequests::new();
        pending.register(RequestId::from(1), "numeric");
        pending.register(RequestId::from("1"), "string");

        assert_eq!(pending.len(), 2);
        assert_eq!(pending.take(&RequestId::from("1")), Some("string".to_string()));
    }

    #[tokio::test]
    async fn test_register_displaces_duplicate_id() {
        let pending = PendingRequests::new();
        assert!(pending.register(RequestId::from(7), "first").is_none());

        let displaced = pending.register(RequestId::from(7), "second").unwrap();
        assert_eq!(displaced.session_id, "first");
        assert_eq!(pending.take(&RequestId::from(7)), Some("second".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_stale_entries() {
        let pending = PendingRequests::new();
        pending.register(RequestId::from("old"), "s1");

        tokio::time::advance(Duration::from_secs(31)).await;
        pending.register(RequestId::from("fresh"), "s2");

        assert_eq!(pending.sweep(Duration::from_secs(30)), 1);
        assert!(pending.get(&RequestId::from("old")).is_none());
        assert!(pending.get(&RequestId::from("fresh")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_zero_removes_everything() {
        let pending = PendingRequests::new();
        pending.register(RequestId::from(1), "s1");
        pending.register(RequestId::from(2), "s2");

        assert_eq!(pending.sweep(Duration::ZERO), 2);
        assert!(pending.is_empty());
    }
}
