//! The locked authoritative surface consumed by sessions and pruning.
//!
//! Implementations own the real pin table and followee projections behind
//! whatever lock the application uses.  Session setup/finish and global
//! pruning are only ever called while that lock is held; everything slow
//! happens against a [`PendingTransaction`] instead.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;
use warren_base::ContentId;

use crate::error::ConnectionError;
use crate::followees::FolloweeSet;
use crate::net::NetworkOps;
use crate::prefs::Prefs;
use crate::txn::{PendingTransaction, StateResolver};

/// Write access to the authoritative local state.
///
/// The [`StateResolver`] supertrait is how a transaction's pin deltas come
/// home on commit or rollback.
pub trait WriteAccess: StateResolver {
    /// The network layer.
    fn net(&self) -> Arc<dyn NetworkOps>;

    /// Current preferences.
    fn prefs(&self) -> &Prefs;

    /// Snapshot of every currently pinned content id.
    fn pinned_snapshot(&self) -> HashSet<ContentId>;

    /// The followee projections.
    fn followees(&mut self) -> &mut FolloweeSet;

    /// Unpins immediately, outside any transaction.  Used by pruning and
    /// LRU purges, which already run under the lock.
    fn unpin_now(&mut self, cid: ContentId) -> Result<(), ConnectionError>;
}

/// Opens a transaction over the access's current pin snapshot.
pub fn open_transaction<A: WriteAccess + ?Sized>(access: &A) -> PendingTransaction {
    PendingTransaction::open(access.net(), access.pinned_snapshot())
}

/// Applies transaction pin deltas to a reference-count table, the policy
/// every resolver shares.
///
/// Negative totals are clamped: removal of meta-data that was skipped for
/// size issues an unpin delta for something never pinned, and that must
/// not be treated as corruption.  `unpin` is called once for every id
/// whose count drops to zero and once per false pin.
pub fn apply_pin_deltas(
    counts: &mut HashMap<ContentId, u64>,
    deltas: HashMap<ContentId, i64>,
    false_pins: HashSet<ContentId>,
    mut unpin: impl FnMut(ContentId),
) {
    for (cid, delta) in deltas {
        let current = counts.get(&cid).copied().unwrap_or(0) as i64;
        let updated = current + delta;
        if updated > 0 {
            counts.insert(cid, updated as u64);
        } else {
            if updated < 0 {
                debug!(%cid, current, delta, "pin count clamped at zero");
            }
            if counts.remove(&cid).is_some() {
                unpin(cid);
            }
        }
    }
    for cid in false_pins {
        unpin(cid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::cid;

    #[test]
    fn test_deltas_update_counts_and_unpin_at_zero() {
        let mut counts = HashMap::from([(cid(1), 2u64), (cid(2), 1u64)]);
        let mut unpinned = Vec::new();
        apply_pin_deltas(
            &mut counts,
            HashMap::from([(cid(1), -1), (cid(2), -1), (cid(3), 2)]),
            HashSet::new(),
            |c| unpinned.push(c),
        );
        assert_eq!(counts.get(&cid(1)), Some(&1));
        assert_eq!(counts.get(&cid(2)), None);
        assert_eq!(counts.get(&cid(3)), Some(&2));
        assert_eq!(unpinned, vec![cid(2)]);
    }

    #[test]
    fn test_never_pinned_decrement_is_clamped() {
        let mut counts = HashMap::new();
        let mut unpinned = Vec::new();
        apply_pin_deltas(
            &mut counts,
            HashMap::from([(cid(9), -1)]),
            HashSet::new(),
            |c| unpinned.push(c),
        );
        assert!(counts.is_empty());
        // the id was never pinned, so nothing must be unpinned either
        assert!(unpinned.is_empty());
    }

    #[test]
    fn test_false_pins_are_undone() {
        let mut counts = HashMap::new();
        let mut unpinned = Vec::new();
        apply_pin_deltas(
            &mut counts,
            HashMap::new(),
            HashSet::from([cid(7)]),
            |c| unpinned.push(c),
        );
        assert_eq!(unpinned, vec![cid(7)]);
    }
}
