//! Pin-count sandbox for network work done outside the write lock.
//!
//! Long-running refreshes have their logic intertwined with long-running
//! network operations.  A [`PendingTransaction`] lets that work happen
//! against a snapshot of the authoritative pin state taken under the lock:
//! pins and unpins are recorded as reference-count deltas, and the net
//! result is applied atomically on commit (or discarded on rollback) by
//! whoever holds the lock again.
//!
//! Another writer could in principle unpin a resource the transaction
//! assumes pinned; we rely on the store not aggressively collecting
//! recently unpinned data for that window.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use n0_future::boxed::BoxFuture;
use warren_base::{ChannelKey, ContentId};

use crate::error::{ConnectionError, ResolveError, SyncError};
use crate::net::NetworkOps;

/// Receiver for a transaction's outcome, implemented by the locked
/// authoritative state.
pub trait StateResolver {
    /// Applies net pin-count deltas and cleans up `false_pins`: pins the
    /// transaction issued on the network but then abandoned, which must
    /// not be trusted as real references.
    fn apply_pin_changes(
        &mut self,
        deltas: HashMap<ContentId, i64>,
        false_pins: HashSet<ContentId>,
    );
}

#[derive(Debug, Default)]
struct TxnState {
    changed_pin_counts: HashMap<ContentId, i64>,
    network_pins: HashSet<ContentId>,
}

/// A sandbox recording intended pin-count changes while network I/O runs
/// without the write lock.
#[derive(Debug)]
pub struct PendingTransaction {
    net: Arc<dyn NetworkOps>,
    existing_pins: HashSet<ContentId>,
    state: Mutex<TxnState>,
}

impl PendingTransaction {
    /// Opens a transaction over a snapshot of the currently pinned set.
    ///
    /// The snapshot must be taken while the caller holds the write lock.
    pub fn open(net: Arc<dyn NetworkOps>, existing_pins: HashSet<ContentId>) -> Self {
        Self {
            net,
            existing_pins,
            state: Mutex::new(TxnState::default()),
        }
    }

    /// Requests that `cid` be pinned.
    ///
    /// If the snapshot already holds a pin, or this transaction pinned it
    /// earlier, no network call is made and the returned future resolves
    /// immediately; the reference count delta is still recorded.
    pub fn pin(&self, cid: ContentId) -> BoxFuture<Result<(), ConnectionError>> {
        let mut state = self.state.lock().expect("poisoned");
        let count = state.changed_pin_counts.get(&cid).copied().unwrap_or(0);
        let result = if self.existing_pins.contains(&cid) || count > 0 {
            Box::pin(std::future::ready(Ok(()))) as BoxFuture<_>
        } else {
            // nobody has pinned this yet, go to the network; remember it
            // so a rollback can tell the resolver to undo it
            let newly = state.network_pins.insert(cid);
            debug_assert!(newly);
            self.net.pin(cid)
        };
        state.changed_pin_counts.insert(cid, count + 1);
        result
    }

    /// Records that `cid` should be unpinned.
    ///
    /// The actual unpin only happens when the transaction commits; until
    /// then the data stays reachable, which is what makes a mid-refresh
    /// abort safe.
    pub fn unpin(&self, cid: ContentId) {
        let mut state = self.state.lock().expect("poisoned");
        let count = state.changed_pin_counts.get(&cid).copied().unwrap_or(0);
        state.changed_pin_counts.insert(cid, count - 1);
    }

    /// Looks up the size of `cid` in bytes.
    pub fn size_bytes(&self, cid: ContentId) -> BoxFuture<Result<u64, ConnectionError>> {
        self.net.size_bytes(cid)
    }

    /// Reads data the transaction believes to be pinned.
    pub fn load_cached(&self, cid: ContentId) -> BoxFuture<Result<Bytes, ConnectionError>> {
        debug_assert!(
            self.existing_pins.contains(&cid)
                || self
                    .state
                    .lock()
                    .expect("poisoned")
                    .changed_pin_counts
                    .get(&cid)
                    .is_some_and(|count| *count > 0),
            "load_cached of unpinned {cid}"
        );
        self.net.load_cached(cid)
    }

    /// Fetches unpinned data with a size ceiling.
    pub fn load_not_cached(
        &self,
        cid: ContentId,
        context: &'static str,
        max_bytes: u64,
    ) -> BoxFuture<Result<Bytes, SyncError>> {
        self.net.load_not_cached(cid, context, max_bytes)
    }

    /// Resolves a channel key to its latest published root.
    pub fn resolve_key(&self, key: ChannelKey) -> BoxFuture<Result<ContentId, ResolveError>> {
        self.net.resolve_key(key)
    }

    /// Commits the recorded deltas to the resolver.  Must be called under
    /// the write lock.
    pub fn commit(self, resolver: &mut dyn StateResolver) {
        let state = self.state.into_inner().expect("poisoned");
        resolver.apply_pin_changes(state.changed_pin_counts, HashSet::new());
    }

    /// Rolls the transaction back.  No deltas are applied, but any pins
    /// issued on the network are reported so the resolver can undo them.
    pub fn rollback(self, resolver: &mut dyn StateResolver) {
        let state = self.state.into_inner().expect("poisoned");
        resolver.apply_pin_changes(HashMap::new(), state.network_pins);
    }
}
