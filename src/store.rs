//! Ordered mapping store.
//!
//! Mutations happen on the control side only. Readers (the listener and the
//! interception bridge) see immutable snapshots, republished after every
//! committed change.

use crate::config::{MappingEntry, RequestPattern, ResponsePlan};
use crate::error::{Error, Result};
use crate::matcher::{CompiledEntry, CompiledPattern};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// Read-only view of the mappings at one point in time.
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Entries in match priority order
    pub entries: Vec<CompiledEntry>,
    /// Pattern defined by `when()` and not yet paired with a response
    pub pending: Option<CompiledPattern>,
}

/// Cloneable handle to the latest published [`Snapshot`].
#[derive(Debug, Clone, Default)]
pub struct SnapshotHandle {
    current: Arc<RwLock<Arc<Snapshot>>>,
}

impl SnapshotHandle {
    pub fn load(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    fn store(&self, snapshot: Snapshot) {
        *self.current.write() = Arc::new(snapshot);
    }
}

/// Ordered request mappings plus the single pending-pattern slot.
#[derive(Debug, Default)]
pub struct MappingStore {
    entries: Vec<CompiledEntry>,
    pending: Option<RequestPattern>,
    published: SnapshotHandle,
}

impl MappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle through which readers observe committed mappings.
    pub fn handle(&self) -> SnapshotHandle {
        self.published.clone()
    }

    /// Set the pending pattern. An unconsumed previous pattern is replaced.
    pub fn define_pattern(&mut self, pattern: RequestPattern) {
        if let Some(previous) = self.pending.replace(pattern) {
            warn!(
                pattern = ?previous,
                "Pending request pattern replaced before a response was attached"
            );
        }
        debug!(pattern = ?self.pending, "Request pattern pending");
        self.publish();
    }

    /// Pair the pending pattern with `plan` and append the mapping.
    pub fn attach_response(&mut self, plan: ResponsePlan) -> Result<()> {
        let request = self.pending.take().ok_or(Error::UnmatchedPattern)?;
        self.entries.push(CompiledEntry::new(MappingEntry {
            request,
            response: plan,
        }));
        debug!(mappings = self.entries.len(), "Mapping added");
        self.publish();
        Ok(())
    }

    /// Drop every mapping and the pending pattern.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.pending = None;
        self.publish();
    }

    pub fn entries(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.iter().map(|e| &e.entry)
    }

    pub fn pending(&self) -> Option<&RequestPattern> {
        self.pending.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn publish(&self) {
        self.published.store(Snapshot {
            entries: self.entries.clone(),
            pending: self.pending.as_ref().map(CompiledPattern::compile),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{find_match, RequestDescriptor};

    #[test]
    fn test_define_then_attach() {
        let mut store = MappingStore::new();
        store.define_pattern(RequestPattern::new().url("/a"));
        assert!(store.pending().is_some());
        assert!(store.is_empty());

        store
            .attach_response(ResponsePlan::new().response_text("a"))
            .unwrap();
        assert!(store.pending().is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.entries().next().unwrap().request.url.as_deref(),
            Some("/a")
        );
    }

    #[test]
    fn test_attach_without_pattern_fails() {
        let mut store = MappingStore::new();
        let err = store.attach_response(ResponsePlan::new()).unwrap_err();
        assert!(matches!(err, Error::UnmatchedPattern));
        assert!(store.is_empty());

        // A consumed pattern cannot be reused either.
        store.define_pattern(RequestPattern::new());
        store.attach_response(ResponsePlan::new()).unwrap();
        assert!(store.attach_response(ResponsePlan::new()).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_last_pending_pattern_wins() {
        let mut store = MappingStore::new();
        store.define_pattern(RequestPattern::new().url("/first"));
        store.define_pattern(RequestPattern::new().url("/second"));
        store.attach_response(ResponsePlan::new()).unwrap();

        let urls: Vec<_> = store.entries().map(|e| e.request.url.clone()).collect();
        assert_eq!(urls, vec![Some("/second".to_string())]);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut store = MappingStore::new();
        for i in 0..3 {
            store.define_pattern(RequestPattern::new().url(format!("/{}", i)));
            store.attach_response(ResponsePlan::new()).unwrap();
        }
        store.define_pattern(RequestPattern::new());
        store.reset();

        assert!(store.is_empty());
        assert!(store.pending().is_none());

        let snapshot = store.handle().load();
        assert!(snapshot.entries.is_empty());
        assert!(snapshot.pending.is_none());
        let request = RequestDescriptor::new("GET", "/0", None);
        assert!(find_match(&snapshot.entries, &request).is_none());
    }

    #[test]
    fn test_snapshots_follow_mutations() {
        let mut store = MappingStore::new();
        let handle = store.handle();
        let before = handle.load();

        store.define_pattern(RequestPattern::new().method("POST"));
        assert!(handle.load().pending.is_some());

        store.attach_response(ResponsePlan::new().status(201)).unwrap();
        let after = handle.load();
        assert_eq!(after.entries.len(), 1);
        assert!(after.pending.is_none());

        // Old snapshots are never mutated in place.
        assert!(before.entries.is_empty());
    }
}
