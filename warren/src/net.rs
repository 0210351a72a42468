//! The seam to the storage/network layer.
//!
//! Everything the engine knows about the content-addressed store comes
//! through [`NetworkOps`].  The trait is dyn-compatible on purpose: the
//! engine holds an `Arc<dyn NetworkOps>` and tests swap in a scripted
//! fake.

use std::fmt;

use bytes::Bytes;
use n0_future::boxed::BoxFuture;
use warren_base::{ChannelKey, ContentId};

use crate::error::{ConnectionError, ResolveError, SyncError};

/// Raw operations against the content-addressed store.
///
/// Returned futures are *hot*: the operation is underway by the time the
/// method returns, and awaiting only joins its completion.  The engine
/// relies on this to issue whole batches ("start all, then await all")
/// and still overlap the underlying I/O.
pub trait NetworkOps: fmt::Debug + Send + Sync + 'static {
    /// Pins `cid`, fetching its data if the local node does not have it.
    fn pin(&self, cid: ContentId) -> BoxFuture<Result<(), ConnectionError>>;

    /// Unpins `cid` on the local node.
    ///
    /// Unpinning is a local bookkeeping operation, so unlike the rest of
    /// the surface it completes synchronously.
    fn unpin(&self, cid: ContentId) -> Result<(), ConnectionError>;

    /// Looks up the size of `cid` in bytes.  The data may or may not be
    /// pinned locally.
    fn size_bytes(&self, cid: ContentId) -> BoxFuture<Result<u64, ConnectionError>>;

    /// Reads data which is already pinned on the local node.
    fn load_cached(&self, cid: ContentId) -> BoxFuture<Result<Bytes, ConnectionError>>;

    /// Fetches unpinned data, failing with a size error if it exceeds
    /// `max_bytes`.  `context` names the artifact type for the error.
    fn load_not_cached(
        &self,
        cid: ContentId,
        context: &'static str,
        max_bytes: u64,
    ) -> BoxFuture<Result<Bytes, SyncError>>;

    /// Resolves a channel key to its latest published root.
    fn resolve_key(&self, key: ChannelKey) -> BoxFuture<Result<ContentId, ResolveError>>;
}
