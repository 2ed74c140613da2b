//! In-flight request tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::oneshot;

/// Id of one dispatched event, unique per version and event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Completion senders keyed by strictly increasing request ids.
#[derive(Debug)]
pub struct PendingRequests<T> {
    next_id: u64,
    requests: BTreeMap<RequestId, oneshot::Sender<T>>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            requests: BTreeMap::new(),
        }
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id and return the receiver for its completion.
    pub fn add(&mut self) -> (RequestId, oneshot::Receiver<T>) {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.requests.insert(id, tx);
        (id, rx)
    }

    /// Resolve a request. Returns false for an unknown id.
    pub fn complete(&mut self, id: RequestId, value: T) -> bool {
        match self.requests.remove(&id) {
            Some(tx) => {
                // The waiter may have given up; that is not an error here.
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    /// Drop a request without resolving it.
    pub fn remove(&mut self, id: RequestId) -> bool {
        self.requests.remove(&id).is_some()
    }

    /// Resolve every outstanding request with `make()`, oldest first.
    pub fn flush(&mut self, make: impl Fn() -> T) -> usize {
        let drained = std::mem::take(&mut self.requests);
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(make());
        }
        count
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.requests.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
