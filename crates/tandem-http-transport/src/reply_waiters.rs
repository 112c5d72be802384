//! One-shot reply waiters for the synchronous handshake path
//!
//! A POST that must be answered in its own HTTP response installs a waiter
//! keyed by its request id before handing the message upstream. When the
//! outbound router sees a response with that id it completes the waiter
//! instead of routing the response to a stream. Waiters are keyed per id, so
//! concurrent handshakes never observe each other's replies, and traffic that
//! matches no waiter flows through the router untouched.
//!
//! Two waiters on the same id are served in installation order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use tandem_json_rpc::{JsonRpcResponse, RequestId};

type Slot = (u64, oneshot::Sender<JsonRpcResponse>);

/// Registry of outstanding synchronous replies
#[derive(Default)]
pub struct ReplyWaiters {
    slots: Mutex<HashMap<RequestId, VecDeque<Slot>>>,
    next_ticket: AtomicU64,
}

impl ReplyWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for the response to `id`
    pub fn install(self: &Arc<Self>, id: RequestId) -> ReplyWaiter {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.slots
            .lock()
            .entry(id.clone())
            .or_default()
            .push_back((ticket, sender));
        debug!("Awaiting synchronous reply for request {}", id);

        ReplyWaiter {
            id,
            ticket,
            receiver,
            waiters: Arc::clone(self),
        }
    }

    /// Hand `response` to the oldest live waiter on its id. Gives the
    /// response back when nobody is waiting for it.
    pub fn resolve(&self, response: JsonRpcResponse) -> Result<(), JsonRpcResponse> {
        let id = response.id.clone();
        let mut slots = self.slots.lock();
        let Some(queue) = slots.get_mut(&id) else {
            return Err(response);
        };

        let mut response = response;
        let outcome = loop {
            match queue.pop_front() {
                Some((_, sender)) => match sender.send(response) {
                    Ok(()) => break Ok(()),
                    // waiter dropped without withdrawing yet; try the next one
                    Err(returned) => response = returned,
                },
                None => break Err(response),
            }
        };

        if queue.is_empty() {
            slots.remove(&id);
        }
        outcome
    }

    pub fn is_waiting(&self, id: &RequestId) -> bool {
        self.slots.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Drop every waiter; pending `wait()` calls return `None`
    pub fn clear(&self) -> usize {
        let mut slots = self.slots.lock();
        let count = slots.values().map(VecDeque::len).sum();
        slots.clear();
        count
    }

    fn cancel(&self, id: &RequestId, ticket: u64) {
        let mut slots = self.slots.lock();
        if let Some(queue) = slots.get_mut(id) {
            queue.retain(|(t, _)| *t != ticket);
            if queue.is_empty() {
                slots.remove(id);
            }
        }
    }
}

/// Handle held by the POST handler while it waits for its reply.
/// Dropping it withdraws the waiter.
pub struct ReplyWaiter {
    id: RequestId,
    ticket: u64,
    receiver: oneshot::Receiver<JsonRpcResponse>,
    waiters: Arc<ReplyWaiters>,
}

impl ReplyWaiter {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Resolves with the matching response, or `None` if the waiter was
    /// cleared (transport closed).
    pub async fn wait(&mut self) -> Option<JsonRpcResponse> {
        (&mut self.receiver).await.ok()
    }
}

impl Drop for ReplyWaiter {
    fn drop(&mut self) {
        self.waiters.cancel(&self.id, self.ticket);
    }
}
