// SPDX-License-Identifier: MIT

//! Correlation table for in-flight worker requests.
//!
//! Requests to a side context carry a correlation id; the matching response
//! completes a oneshot. An entry leaves the table exactly once: on response,
//! on timeout (the caller removes it), or en masse when the transport dies.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;

use crate::observability::messages::tier::PendingRequestsFailed;
use crate::tiers::protocol::WireError;

type PendingSender = oneshot::Sender<Result<Value, WireError>>;

#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<String, PendingSender>>,
    counter: AtomicU64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next correlation id, unique for the lifetime of this table.
    pub fn next_id(&self) -> String {
        format!("req-{}", self.counter.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert(&self, id: String, sender: PendingSender) {
        self.inner
            .lock()
            .expect("pending table lock poisoned")
            .insert(id, sender);
    }

    /// Complete an entry with its response. Unknown ids are ignored: the
    /// caller may already have timed out and removed the entry.
    pub fn complete(&self, id: &str, result: Result<Value, WireError>) {
        let sender = self
            .inner
            .lock()
            .expect("pending table lock poisoned")
            .remove(id);
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }

    /// Remove an entry without completing it (timeout path).
    pub fn remove(&self, id: &str) -> bool {
        self.inner
            .lock()
            .expect("pending table lock poisoned")
            .remove(id)
            .is_some()
    }

    /// Reject every in-flight request with one reason. Used when the side
    /// context dies or is torn down under in-flight work.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<(String, PendingSender)> = self
            .inner
            .lock()
            .expect("pending table lock poisoned")
            .drain()
            .collect();
        if drained.is_empty() {
            return;
        }
        tracing::warn!(
            "{}",
            PendingRequestsFailed {
                count: drained.len(),
                reason,
            }
        );
        for (_, sender) in drained {
            let _ = sender.send(Err(WireError::Internal {
                message: reason.to_string(),
            }));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
