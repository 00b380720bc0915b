//! Request/response correlation over a full-duplex socket: outstanding
//! message IDs mapped to single-shot waiters.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Commands and queries are semantically identical; the split exists for
/// bookkeeping and rate accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Command,
    Query,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Command => "command",
            CallKind::Query => "query",
        }
    }
}

/// The JSON frame exchanged with devices for correlated calls. Devices
/// echo the `id` of the request in their reply; a frame with an empty or
/// unknown `id` is not a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl WireMessage {
    pub fn new(id: &str, payload: &str) -> Self {
        Self {
            id: id.to_string(),
            payload: payload.to_string(),
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Outcome of routing one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The frame was a reply to a pending call and has been delivered to
    /// its waiter.
    Correlated,
    /// Not a reply; the caller should hand the frame to the embedder's
    /// incoming-message handler.
    Uncorrelated,
}

#[derive(Default)]
struct PendingTables {
    commands: HashMap<String, oneshot::Sender<WireMessage>>,
    queries: HashMap<String, oneshot::Sender<WireMessage>>,
}

impl PendingTables {
    fn table(&mut self, kind: CallKind) -> &mut HashMap<String, oneshot::Sender<WireMessage>> {
        match kind {
            CallKind::Command => &mut self.commands,
            CallKind::Query => &mut self.queries,
        }
    }
}

/// The pending-call table. One lock covers both maps; completing a waiter
/// happens after it has been removed, outside the lock.
///
/// A waiter is present exactly between [`register`](Self::register) and
/// whichever comes first of the device reply ([`dispatch`](Self::dispatch)
/// removes it) and the caller's timeout or write failure
/// ([`remove`](Self::remove)). Late and duplicate replies find no waiter
/// and leave the tables untouched.
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<PendingTables>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a fresh message ID and parks a waiter for it. The returned
    /// receiver resolves with the device's reply.
    pub fn register(&self, kind: CallKind) -> (String, oneshot::Receiver<WireMessage>) {
        let message_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        let mut pending = self.pending.lock().expect("correlator lock poisoned");
        let previous = pending.table(kind).insert(message_id.clone(), tx);
        // Freshly minted UUIDs colliding with an outstanding call would
        // deliver a reply to the wrong waiter.
        assert!(previous.is_none(), "message ID collision on {message_id}");

        (message_id, rx)
    }

    /// Discards a parked waiter. Used by the caller on timeout and on
    /// write failure; unknown IDs are a no-op.
    pub fn remove(&self, kind: CallKind, message_id: &str) {
        let mut pending = self.pending.lock().expect("correlator lock poisoned");
        pending.table(kind).remove(message_id);
    }

    /// Routes one inbound frame. A frame is a correlated reply iff it
    /// decodes as a [`WireMessage`] whose non-empty `id` matches a pending
    /// call in either table.
    pub fn dispatch(&self, frame: &[u8]) -> Dispatch {
        let message: WireMessage = match serde_json::from_slice(frame) {
            Ok(message) => message,
            Err(_) => return Dispatch::Uncorrelated,
        };

        if message.id.is_empty() {
            return Dispatch::Uncorrelated;
        }

        let waiter = {
            let mut pending = self.pending.lock().expect("correlator lock poisoned");
            match pending.commands.remove(&message.id) {
                Some(waiter) => Some(waiter),
                None => pending.queries.remove(&message.id),
            }
        };

        match waiter {
            Some(tx) => {
                // The caller may have timed out between our removal and
                // this send; its receiver is gone then and the reply is
                // dropped, which is the specified late-reply behavior.
                let _ = tx.send(message);
                Dispatch::Correlated
            }
            None => Dispatch::Uncorrelated,
        }
    }

    pub fn commands_waiting(&self) -> usize {
        self.pending.lock().expect("correlator lock poisoned").commands.len()
    }

    pub fn queries_waiting(&self) -> usize {
        self.pending.lock().expect("correlator lock poisoned").queries.len()
    }
}
