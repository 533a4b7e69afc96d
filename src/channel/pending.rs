use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::ids::CallId;

/// One outstanding outbound CALL waiting for its RETURN.
struct PendingCall {
    // ---
    /// Event name the RETURN must echo alongside the id.
    name: String,
    tx: oneshot::Sender<Vec<Value>>,
}

/// Correlation table of outstanding outbound calls.
///
/// Maps call ids to oneshot channels. A RETURN completes exactly the entry
/// whose id *and* name it echoes; dropping an entry (timeout, disconnect
/// drain) resolves the waiting future with a closed-channel error, which
/// the channel maps to the disconnect outcome.
pub(crate) struct PendingCalls {
    // ---
    calls: HashMap<CallId, PendingCall>,
}

impl PendingCalls {
    // ---

    /// Create a new empty correlation table.
    pub fn new() -> Self {
        // ---
        Self {
            calls: HashMap::new(),
        }
    }

    /// Register a new outstanding call.
    ///
    /// Returns the receiver that resolves when the RETURN arrives.
    pub fn register(&mut self, id: CallId, name: String) -> oneshot::Receiver<Vec<Value>> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.calls.insert(id, PendingCall { name, tx });
        rx
    }

    /// Complete an outstanding call with the RETURN's values.
    ///
    /// The entry is removed and delivered only when both the id and the
    /// echoed name match; a RETURN addressed to a known id under the wrong
    /// name leaves the entry in place and returns `false`.
    pub fn complete(&mut self, id: &CallId, name: &str, values: Vec<Value>) -> bool {
        // ---
        match self.calls.get(id) {
            Some(entry) if entry.name == name => {}
            _ => return false,
        }

        if let Some(entry) = self.calls.remove(id) {
            // Ignore a dropped receiver; the caller already timed out.
            let _ = entry.tx.send(values);
            true
        } else {
            false
        }
    }

    /// Remove an entry without delivering a value (timeout cleanup).
    pub fn remove(&mut self, id: &CallId) -> bool {
        // ---
        self.calls.remove(id).is_some()
    }

    /// Drop every outstanding entry, resolving all waiters at once.
    ///
    /// Used by the disconnect path; returns how many calls were drained.
    pub fn drain(&mut self) -> usize {
        // ---
        let count = self.calls.len();
        self.calls.clear();
        count
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        // ---
        self.calls.len()
    }
}
