//! The lock/no-lock/lock refresh session.
//!
//! One session drives one reconciliation for one followee through three
//! phases: [`RefreshSession::setup`] under the caller's write lock,
//! [`PreparedRefresh::run`] without it (this is where all the slow network
//! work happens), and [`RanRefresh::finish`] under the lock again.  Each
//! phase consumes the session and returns the next phase's type, so
//! calling them out of order is a compile error rather than a runtime
//! assertion.
//!
//! Sessions are not internally synchronized; the caller must not run two
//! sessions for the same followee concurrently.  Sessions for different
//! followees can freely overlap their `run` phases, which is the point:
//! one followee's slow tree-walk never blocks another's setup or finish,
//! or any unrelated writer.

use std::collections::HashSet;
use std::sync::Mutex;

use bytes::Bytes;
use n0_future::boxed::BoxFuture;
use rand::Rng;
use tracing::{info, warn};
use warren_base::{ChannelKey, ContentId};

use crate::access::{self, WriteAccess};
use crate::accounting;
use crate::docs::Description;
use crate::error::{ConnectionError, ResolveError, SyncError};
use crate::followees::FollowingCacheElement;
use crate::prefs::Prefs;
use crate::progress::ProgressSink;
use crate::reconcile::{self, RefreshSupport};
use crate::txn::PendingTransaction;

/// Shrink target for a followee's very first refresh: extra headroom for
/// data we have never seen.
pub const NEW_FOLLOWEE_FULLNESS_FRACTION: f64 = 0.75;
/// Shrink target for a steady-state refresh.
pub const EXISTING_FOLLOWEE_FULLNESS_FRACTION: f64 = 0.90;
/// A deletion frees space by itself, so setup only prunes actual overflow.
pub const NO_RESIZE_FULLNESS_FRACTION: f64 = 1.0;

/// A refresh session before setup.
#[derive(Debug)]
pub struct RefreshSession {
    key: ChannelKey,
    previous_root: Option<ContentId>,
    prefs: Prefs,
    is_delete: bool,
}

impl RefreshSession {
    /// Creates a session to start following or refresh a followee.
    /// `previous_root` is the root from the last successful refresh,
    /// `None` when this is the first.
    pub fn new(key: ChannelKey, previous_root: Option<ContentId>, prefs: Prefs) -> Self {
        Self {
            key,
            previous_root,
            prefs,
            is_delete: false,
        }
    }

    /// Creates a session that stops following the channel, unpinning
    /// everything cached for it.
    pub fn for_deletion(
        key: ChannelKey,
        previous_root: Option<ContentId>,
        prefs: Prefs,
    ) -> Self {
        Self {
            key,
            previous_root,
            prefs,
            is_delete: true,
        }
    }

    /// Phase 1, under the caller's write lock: shrinks the global followee
    /// cache toward its target fullness, opens the transaction sandbox,
    /// snapshots cache state, and (except for deletions) starts resolving
    /// the followee's key.
    pub fn setup<A, R>(
        self,
        rng: &mut R,
        access: &mut A,
    ) -> Result<PreparedRefresh, ConnectionError>
    where
        A: WriteAccess,
        R: Rng + ?Sized,
    {
        let fraction = if self.is_delete {
            NO_RESIZE_FULLNESS_FRACTION
        } else if self.previous_root.is_none() {
            NEW_FOLLOWEE_FULLNESS_FRACTION
        } else {
            EXISTING_FOLLOWEE_FULLNESS_FRACTION
        };
        accounting::shrink_to_fraction(rng, access, fraction)?;

        let txn = access::open_transaction(access);
        let prior_elements = access.followees().snapshot_elements(&self.key);
        let current_cache_bytes = accounting::total_bytes(access.followees());
        let key_resolve = (!self.is_delete).then(|| access.net().resolve_key(self.key));
        Ok(PreparedRefresh {
            key: self.key,
            previous_root: self.previous_root,
            prefs: self.prefs,
            is_delete: self.is_delete,
            txn,
            prior_elements,
            current_cache_bytes,
            key_resolve,
        })
    }
}

/// A refresh session after setup, ready to run without the lock.
#[derive(derive_more::Debug)]
pub struct PreparedRefresh {
    key: ChannelKey,
    previous_root: Option<ContentId>,
    prefs: Prefs,
    is_delete: bool,
    txn: PendingTransaction,
    prior_elements: Vec<FollowingCacheElement>,
    current_cache_bytes: u64,
    #[debug(skip)]
    key_resolve: Option<BoxFuture<Result<ContentId, ResolveError>>>,
}

impl PreparedRefresh {
    /// Phase 2, outside the lock: awaits the key resolution and runs the
    /// reconciliation against the transaction sandbox.  All errors are
    /// caught and logged here; the returned session reports the outcome
    /// and must be finished either way.
    pub async fn run<R>(mut self, rng: &mut R, progress: &dyn ProgressSink) -> RanRefresh
    where
        R: Rng + ?Sized,
    {
        let is_existing = self.previous_root.is_some();
        if is_existing {
            progress.set_status(self.key, Some("Refreshing...".into()));
        }
        let key_resolve = self.key_resolve.take();
        let support = TransactionRefreshSupport::new(&self.txn);
        let outcome = async {
            let new_root = match key_resolve {
                Some(resolve) => Some(resolve.await?),
                None => None,
            };
            let elements = reconcile::refresh_followee(
                &support,
                rng,
                &self.prefs,
                self.previous_root,
                new_root,
                &self.prior_elements,
                self.current_cache_bytes,
            )
            .await?;
            Ok::<_, SyncError>((new_root, elements))
        }
        .await;
        let updated_description = support.into_updated_description();
        if is_existing {
            progress.set_status(self.key, None);
        }

        let result = match outcome {
            Ok((new_root, elements)) => {
                info!(followee = %self.key.fmt_short(), "refresh success");
                Ok((new_root, elements))
            }
            Err(err) => {
                warn!(
                    followee = %self.key.fmt_short(),
                    "refresh aborted, will be retried on schedule: {err:#}"
                );
                Err(err)
            }
        };
        RanRefresh {
            key: self.key,
            previous_root: self.previous_root,
            is_delete: self.is_delete,
            txn: self.txn,
            prior_elements: self.prior_elements,
            updated_description,
            result,
        }
    }
}

/// A refresh session after running, ready to commit or roll back.
#[derive(derive_more::Debug)]
pub struct RanRefresh {
    key: ChannelKey,
    previous_root: Option<ContentId>,
    is_delete: bool,
    txn: PendingTransaction,
    prior_elements: Vec<FollowingCacheElement>,
    updated_description: Option<Description>,
    #[debug(skip)]
    result: Result<(Option<ContentId>, Vec<FollowingCacheElement>), SyncError>,
}

impl RanRefresh {
    /// True if the run phase completed without error.
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    /// The followee's description, if this refresh saw a new or changed
    /// one.  Callers keeping user-info read caches refresh them from this.
    pub fn updated_description(&self) -> Option<&Description> {
        self.updated_description.as_ref()
    }

    /// Phase 3, under the caller's write lock again: on success commits
    /// the transaction's pin deltas and records the new root and element
    /// list; on failure rolls the transaction back and still advances the
    /// poll time, so a persistently broken followee is retried on the
    /// normal schedule rather than in a tight loop.
    ///
    /// The error captured during `run` is re-surfaced after state is
    /// settled; callers that already acted on [`RanRefresh::succeeded`]
    /// may ignore it.
    pub fn finish<A>(
        self,
        access: &mut A,
        progress: &dyn ProgressSink,
        now_ms: u64,
    ) -> Result<(), SyncError>
    where
        A: WriteAccess,
    {
        match self.result {
            Ok((new_root, elements)) => {
                let prior: HashSet<ContentId> =
                    self.prior_elements.iter().map(|e| e.element).collect();
                if self.is_delete {
                    access.followees().remove(&self.key);
                    for cid in &prior {
                        progress.element_disappeared(*cid);
                    }
                } else {
                    let root = new_root.expect("non-deletion refresh resolved a root");
                    let current: HashSet<ContentId> =
                        elements.iter().map(|e| e.element).collect();
                    access
                        .followees()
                        .record_success(self.key, root, elements, now_ms);
                    for cid in prior.difference(&current) {
                        progress.element_disappeared(*cid);
                    }
                    for cid in current.difference(&prior) {
                        progress.element_appeared(*cid);
                    }
                }
                self.txn.commit(access);
                Ok(())
            }
            Err(err) => {
                if self.previous_root.is_some() {
                    access.followees().record_failure(&self.key, now_ms);
                }
                self.txn.rollback(access);
                Err(err)
            }
        }
    }
}

/// [`RefreshSupport`] over a [`PendingTransaction`]: pins go through the
/// sandbox, unpins become deferred deltas.
#[derive(Debug)]
struct TransactionRefreshSupport<'a> {
    txn: &'a PendingTransaction,
    updated_description: Mutex<Option<Description>>,
}

impl<'a> TransactionRefreshSupport<'a> {
    fn new(txn: &'a PendingTransaction) -> Self {
        Self {
            txn,
            updated_description: Mutex::new(None),
        }
    }

    fn into_updated_description(self) -> Option<Description> {
        self.updated_description.into_inner().expect("poisoned")
    }
}

impl RefreshSupport for TransactionRefreshSupport<'_> {
    fn size_bytes(&self, cid: ContentId) -> BoxFuture<Result<u64, ConnectionError>> {
        self.txn.size_bytes(cid)
    }

    fn pin_meta(&self, cid: ContentId) -> BoxFuture<Result<(), ConnectionError>> {
        self.txn.pin(cid)
    }

    fn unpin_meta(&self, cid: ContentId) {
        self.txn.unpin(cid);
    }

    fn pin_leaf(&self, cid: ContentId) -> BoxFuture<Result<(), ConnectionError>> {
        self.txn.pin(cid)
    }

    fn unpin_leaf(&self, cid: ContentId) {
        self.txn.unpin(cid);
    }

    fn load_cached(&self, cid: ContentId) -> BoxFuture<Result<Bytes, ConnectionError>> {
        self.txn.load_cached(cid)
    }

    fn description_updated(&self, description: &Description) {
        *self.updated_description.lock().expect("poisoned") = Some(description.clone());
    }
}
