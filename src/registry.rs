// SPDX-License-Identifier: MIT

//! Session registry for the external editing protocol.
//!
//! Editing clients hold opaque session ids, never document handles. The
//! registry maps one to the other and remembers the document class so the
//! protocol layer can pick command vocabularies without re-querying the
//! engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::session::{DocumentHandle, DocumentType};

/// What the registry knows about one open editing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEntry {
    pub handle: DocumentHandle,
    pub document_type: DocumentType,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    counter: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an open document and hand back its session id.
    pub fn open(&self, handle: DocumentHandle, document_type: DocumentType) -> String {
        let id = format!("session-{}", self.counter.fetch_add(1, Ordering::Relaxed));
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .insert(id.clone(), SessionEntry {
                handle,
                document_type,
            });
        id
    }

    pub fn get(&self, id: &str) -> Option<SessionEntry> {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .get(id)
            .copied()
    }

    /// Remove a session, returning its entry so the caller can destroy the
    /// underlying document handle.
    pub fn close(&self, id: &str) -> Option<SessionEntry> {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_get_close_round_trip() {
        let registry = SessionRegistry::new();
        let id = registry.open(DocumentHandle(42), DocumentType::Spreadsheet);

        let entry = registry.get(&id).unwrap();
        assert_eq!(entry.handle, DocumentHandle(42));
        assert_eq!(entry.document_type, DocumentType::Spreadsheet);
        assert_eq!(registry.len(), 1);

        let closed = registry.close(&id).unwrap();
        assert_eq!(closed.handle, DocumentHandle(42));
        assert!(registry.is_empty());
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn ids_are_unique_and_unknown_ids_miss() {
        let registry = SessionRegistry::new();
        let a = registry.open(DocumentHandle(1), DocumentType::Text);
        let b = registry.open(DocumentHandle(2), DocumentType::Text);
        assert_ne!(a, b);
        assert!(registry.get("session-999").is_none());
        assert!(registry.close("session-999").is_none());
    }
}
