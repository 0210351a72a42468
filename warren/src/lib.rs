//! Mirror followed channels from a content-addressed store into a
//! size-bounded local cache.
//!
//! A channel publishes a small meta-data tree (index, description,
//! recommendations, record list) whose leaves are large media files.  The
//! engine in this crate keeps local pinned state converged with whatever
//! root a followed channel last published, without ever holding the
//! caller's write lock across slow network I/O:
//!
//! - [`admission`] decides what fits under a byte budget, randomized but
//!   reproducible under a seeded rng.
//! - [`reconcile`] diffs an old and new tree snapshot for one followee and
//!   emits the minimal pin/unpin operations, driven through the
//!   [`reconcile::RefreshSupport`] seam.
//! - [`session`] wraps one reconciliation in a lock/no-lock/lock typestate
//!   ([`session::RefreshSession`] → [`session::PreparedRefresh`] →
//!   [`session::RanRefresh`]), so calling phases out of order does not
//!   compile.
//! - [`explicit`] is a read-through LRU cache with the same pin discipline
//!   for content reached outside the followee relationship.
//! - [`accounting`] does cross-followee byte accounting and global pruning.
//!
//! Authoritative pin state only changes inside the locked setup/finish
//! phases; everything in between runs against a [`txn::PendingTransaction`]
//! sandbox that is committed or rolled back atomically.

pub mod access;
pub mod accounting;
pub mod admission;
pub mod docs;
pub mod error;
pub mod explicit;
pub mod followees;
pub mod limits;
pub mod net;
pub mod prefs;
pub mod progress;
pub mod reconcile;
pub mod session;
pub mod txn;

#[cfg(test)]
pub(crate) mod test_support;

pub use warren_base::{ChannelKey, ContentId};
