//! Tree reconciliation for one followee.
//!
//! [`refresh_followee`] converges local pinned state with a followee's
//! latest published root.  It is a pure algorithm over the
//! [`RefreshSupport`] seam: the same code drives starting to follow a
//! channel (`old_root` is `None`), a steady-state refresh, and stopping
//! (`new_root` is `None`).
//!
//! Failure semantics, which the whole retry story hangs off:
//!
//! - meta-data that is oversized, undecodable, or fails to pin aborts the
//!   entire refresh by propagating an error.  Nothing has been unpinned at
//!   that point (new artifacts are always pinned before their predecessors
//!   are let go), so the old state stays valid and the refresh can simply
//!   be retried later.
//! - leaf failures degrade the one affected record to metadata-only
//!   caching and are only logged.
//!
//! Errors are never caught here; the session boundary is responsible for
//! turning them into a logged, non-throwing outcome.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use n0_future::boxed::BoxFuture;
use rand::Rng;
use tracing::{debug, warn};
use warren_base::ContentId;

use crate::admission::{CacheAlgorithm, Candidate};
use crate::docs::{ChannelIndex, Description, Document, LeafSet, Record, RecordList, Recommendations};
use crate::error::{ConnectionError, SizeLimitSnafu, SyncError};
use crate::followees::FollowingCacheElement;
use crate::limits;
use crate::prefs::Prefs;

/// What the reconciliation algorithm needs from its caller.
///
/// Pin futures are hot (see [`crate::net::NetworkOps`]); unpins are
/// deferred, meaning the implementation must only let the data go once the
/// whole refresh has committed.  Meta-data and leaf pins are distinguished
/// so implementations can account for them separately.
pub trait RefreshSupport: Send + Sync {
    /// Size of a content id in bytes, pinned or not.
    fn size_bytes(&self, cid: ContentId) -> BoxFuture<Result<u64, ConnectionError>>;

    /// Pins a meta-data document.
    fn pin_meta(&self, cid: ContentId) -> BoxFuture<Result<(), ConnectionError>>;

    /// Schedules a meta-data unpin for when the refresh commits.  The id
    /// may never have been pinned (oversized records are skipped), which
    /// implementations must tolerate.
    fn unpin_meta(&self, cid: ContentId);

    /// Pins a leaf file.
    fn pin_leaf(&self, cid: ContentId) -> BoxFuture<Result<(), ConnectionError>>;

    /// Schedules a leaf unpin for when the refresh commits.
    fn unpin_leaf(&self, cid: ContentId);

    /// Reads data which is already pinned.
    fn load_cached(&self, cid: ContentId) -> BoxFuture<Result<Bytes, ConnectionError>>;

    /// Called when the followee is new or changed its description, so
    /// user-info read caches can be refreshed.
    fn description_updated(&self, _description: &Description) {}
}

/// Diffs `old_root` against `new_root` and emits the pin/unpin operations
/// needed to converge, returning the full replacement element list.
///
/// `prior_elements` is what the previous reconciliation produced;
/// `current_cache_bytes` is the aggregate followee cache occupancy used
/// for admission decisions.  If the root is unchanged (including both
/// `None`, meaning never fetched) this is a no-op that issues zero support
/// calls.
pub async fn refresh_followee<S, R>(
    support: &S,
    rng: &mut R,
    prefs: &Prefs,
    old_root: Option<ContentId>,
    new_root: Option<ContentId>,
    prior_elements: &[FollowingCacheElement],
    current_cache_bytes: u64,
) -> Result<Vec<FollowingCacheElement>, SyncError>
where
    S: RefreshSupport + ?Sized,
    R: Rng + ?Sized,
{
    if old_root == new_root {
        return Ok(prior_elements.to_vec());
    }

    if let Some(new_root) = new_root {
        check_size(
            support,
            ChannelIndex::CONTEXT,
            new_root,
            ChannelIndex::SIZE_LIMIT_BYTES,
        )
        .await?;
        support.pin_meta(new_root).await?;
    }
    let old_index = load_or_empty::<_, ChannelIndex>(support, old_root).await?;
    let new_index = load_or_empty::<_, ChannelIndex>(support, new_root).await?;

    refresh_description(support, old_index.description, new_index.description).await?;
    refresh_recommendations(support, old_index.recommendations, new_index.recommendations)
        .await?;

    let mut elements = prior_elements.to_vec();
    if old_index.records != new_index.records {
        if let Some(new_records) = new_index.records {
            check_size(
                support,
                RecordList::CONTEXT,
                new_records,
                RecordList::SIZE_LIMIT_BYTES,
            )
            .await?;
            support.pin_meta(new_records).await?;
        }
        let old_list = load_or_empty::<_, RecordList>(support, old_index.records).await?;
        let new_list = load_or_empty::<_, RecordList>(support, new_index.records).await?;

        let old_set: HashSet<ContentId> = old_list.records.iter().copied().collect();
        let new_set: HashSet<ContentId> = new_list.records.iter().copied().collect();

        let prior_by_record: HashMap<ContentId, FollowingCacheElement> =
            elements.iter().map(|e| (e.element, e.clone())).collect();
        let mut removed = HashSet::new();
        for record in &old_list.records {
            if !new_set.contains(record) && removed.insert(*record) {
                support.unpin_meta(*record);
                if let Some(element) = prior_by_record.get(record) {
                    if let Some(image) = element.image {
                        support.unpin_leaf(image);
                    }
                    if let Some(leaf) = element.leaf {
                        support.unpin_leaf(leaf);
                    }
                }
            }
        }
        elements.retain(|e| !removed.contains(&e.element));

        // added records, kept in the oldest-first order they are published
        let mut seen = HashSet::new();
        let added: Vec<ContentId> = new_list
            .records
            .iter()
            .copied()
            .filter(|record| !old_set.contains(record) && seen.insert(*record))
            .collect();
        debug!(
            removed = removed.len(),
            added = added.len(),
            "record list changed"
        );

        let new_elements =
            synchronize_added(support, rng, prefs, added, current_cache_bytes).await?;
        elements.extend(new_elements);

        if let Some(old_records) = old_index.records {
            support.unpin_meta(old_records);
        }
    }

    if let Some(old_root) = old_root {
        support.unpin_meta(old_root);
    }
    Ok(elements)
}

async fn refresh_description<S>(
    support: &S,
    old: Option<ContentId>,
    new: Option<ContentId>,
) -> Result<(), SyncError>
where
    S: RefreshSupport + ?Sized,
{
    if old == new {
        return Ok(());
    }
    if let Some(new) = new {
        check_size(
            support,
            Description::CONTEXT,
            new,
            Description::SIZE_LIMIT_BYTES,
        )
        .await?;
        support.pin_meta(new).await?;
        let description: Description = load_doc(support, new).await?;
        // the embedded user picture is mirrored as meta-data too
        if let Some(picture) = description.picture {
            check_size(
                support,
                "user picture",
                picture,
                limits::MAX_USER_PIC_SIZE_BYTES,
            )
            .await?;
            support.pin_meta(picture).await?;
        }
        support.description_updated(&description);
    }
    if let Some(old) = old {
        // the old description is still pinned, read it to find its picture
        let description: Description = load_doc(support, old).await?;
        support.unpin_meta(old);
        if let Some(picture) = description.picture {
            support.unpin_meta(picture);
        }
    }
    Ok(())
}

async fn refresh_recommendations<S>(
    support: &S,
    old: Option<ContentId>,
    new: Option<ContentId>,
) -> Result<(), SyncError>
where
    S: RefreshSupport + ?Sized,
{
    if old == new {
        return Ok(());
    }
    // the list is opaque, it is pinned and replaced as a whole; loading
    // both sides proves they parse
    if let Some(new) = new {
        check_size(
            support,
            Recommendations::CONTEXT,
            new,
            Recommendations::SIZE_LIMIT_BYTES,
        )
        .await?;
        support.pin_meta(new).await?;
        let _: Recommendations = load_doc(support, new).await?;
    }
    if let Some(old) = old {
        let _: Recommendations = load_doc(support, old).await?;
        support.unpin_meta(old);
    }
    Ok(())
}

/// Per-candidate intermediate state threaded through the size-check → pin
/// → leaf-selection passes.
#[derive(Debug)]
struct ElementScratch {
    record_cid: ContentId,
    thumbnail: Option<ContentId>,
    thumbnail_size_bytes: u64,
    leaf: Option<ContentId>,
    leaf_size_bytes: u64,
}

impl ElementScratch {
    fn leaf_bytes(&self) -> u64 {
        self.thumbnail_size_bytes + self.leaf_size_bytes
    }

    fn into_element(self) -> FollowingCacheElement {
        FollowingCacheElement {
            element: self.record_cid,
            image: self.thumbnail,
            leaf: self.leaf,
            combined_size_bytes: self.leaf_bytes(),
        }
    }

    fn strip_leaves(&mut self) {
        self.thumbnail = None;
        self.thumbnail_size_bytes = 0;
        self.leaf = None;
        self.leaf_size_bytes = 0;
    }
}

async fn synchronize_added<S, R>(
    support: &S,
    rng: &mut R,
    prefs: &Prefs,
    added: Vec<ContentId>,
    current_cache_bytes: u64,
) -> Result<Vec<FollowingCacheElement>, SyncError>
where
    S: RefreshSupport + ?Sized,
    R: Rng + ?Sized,
{
    if added.is_empty() {
        return Ok(Vec::new());
    }

    // check the sizes of every new record; requests all start before any
    // is awaited
    debug!(count = added.len(), "checking sizes of new records");
    let size_futures: Vec<_> = added.iter().map(|cid| support.size_bytes(*cid)).collect();
    let mut admitted = Vec::new();
    for (cid, future) in added.iter().zip(size_futures) {
        let size = future.await?;
        if size > Record::SIZE_LIMIT_BYTES {
            // not a failure, the record just never becomes part of the
            // cache
            warn!(record = %cid, size, limit = Record::SIZE_LIMIT_BYTES, "skipping oversized record");
        } else {
            admitted.push(*cid);
        }
    }

    // pin the meta-data of everything that passed
    debug!(count = admitted.len(), "pinning record meta-data");
    let pin_futures: Vec<_> = admitted.iter().map(|cid| support.pin_meta(*cid)).collect();
    for future in pin_futures {
        future.await?;
    }

    // now pinned, so these loads are local
    let load_futures: Vec<_> = admitted.iter().map(|cid| support.load_cached(*cid)).collect();
    let mut records = Vec::new();
    for (cid, future) in admitted.iter().zip(load_futures) {
        let bytes = future.await?;
        records.push((*cid, Record::decode(&bytes)?));
    }

    // choose candidate leaves and start their size lookups
    let mut scratch = Vec::new();
    let mut thumb_sizes = Vec::new();
    let mut leaf_sizes = Vec::new();
    for (cid, record) in &records {
        let leaves = LeafSet::parse(record);
        let video = leaves.largest_video_within(prefs.video_edge_pixel_max);
        let (leaf, leaf_limit) = match (video, leaves.audio) {
            // video wins when both exist
            (Some(video), _) => (Some(video.cid), prefs.followee_video_max_bytes),
            (None, Some(audio)) => (Some(audio), prefs.followee_audio_max_bytes),
            (None, None) => (None, 0),
        };
        thumb_sizes.push(leaves.thumbnail.map(|c| (c, support.size_bytes(c))));
        leaf_sizes.push(leaf.map(|c| (c, leaf_limit, support.size_bytes(c))));
        scratch.push(ElementScratch {
            record_cid: *cid,
            thumbnail: leaves.thumbnail,
            thumbnail_size_bytes: 0,
            leaf,
            leaf_size_bytes: 0,
        });
    }

    // collect the leaf sizes; a failed or over-preference leaf is dropped
    // on its own, the record itself stays a candidate
    for ((entry, thumb), leaf) in scratch.iter_mut().zip(thumb_sizes).zip(leaf_sizes) {
        if let Some((cid, future)) = thumb {
            match future.await {
                Ok(size) if size <= prefs.followee_thumbnail_max_bytes => {
                    entry.thumbnail_size_bytes = size;
                }
                Ok(size) => {
                    warn!(record = %entry.record_cid, thumbnail = %cid, size, "thumbnail over preference limit, skipping");
                    entry.thumbnail = None;
                }
                Err(err) => {
                    warn!(record = %entry.record_cid, thumbnail = %cid, "failed to size thumbnail: {err:#}");
                    entry.thumbnail = None;
                }
            }
        }
        if let Some((cid, limit, future)) = leaf {
            match future.await {
                Ok(size) if size <= limit => {
                    entry.leaf_size_bytes = size;
                }
                Ok(size) => {
                    warn!(record = %entry.record_cid, leaf = %cid, size, limit, "leaf over preference limit, skipping");
                    entry.leaf = None;
                }
                Err(err) => {
                    warn!(record = %entry.record_cid, leaf = %cid, "failed to size leaf: {err:#}");
                    entry.leaf = None;
                }
            }
        }
    }

    // decide whose leaves to cache; the admission walk favors the front of
    // the list, so feed it newest-first
    let mut newest_first: Vec<Candidate<usize>> = scratch
        .iter()
        .enumerate()
        .rev()
        .map(|(index, entry)| Candidate::new(entry.leaf_bytes(), index))
        .collect();
    let mut selected: HashSet<usize> = HashSet::new();
    let mut effective_bytes = current_cache_bytes;
    if !newest_first.is_empty() {
        // the newest record is always admitted, even if that transiently
        // overflows the budget, so a followee's latest post is immediately
        // visible
        let forced = newest_first.remove(0);
        effective_bytes += forced.size_bytes;
        selected.insert(forced.data);
    }
    let mut algorithm =
        CacheAlgorithm::new(prefs.followee_cache_target_bytes, effective_bytes);
    for candidate in algorithm.select_for_addition(rng, newest_first) {
        selected.insert(candidate.data);
    }

    // pin the selected leaves, all requests first
    let mut thumb_pins = Vec::with_capacity(scratch.len());
    let mut leaf_pins = Vec::with_capacity(scratch.len());
    for (index, entry) in scratch.iter_mut().enumerate() {
        if !selected.contains(&index) {
            // passed over by the admission walk: cached metadata-only
            entry.strip_leaves();
        }
        thumb_pins.push(entry.thumbnail.map(|c| support.pin_leaf(c)));
        leaf_pins.push(entry.leaf.map(|c| support.pin_leaf(c)));
    }

    let mut elements = Vec::with_capacity(scratch.len());
    for ((mut entry, thumb_pin), leaf_pin) in
        scratch.into_iter().zip(thumb_pins).zip(leaf_pins)
    {
        if let Some(future) = thumb_pin {
            if let Err(err) = future.await {
                let cid = entry.thumbnail.take().expect("pin implies thumbnail");
                warn!(record = %entry.record_cid, thumbnail = %cid, "failed to pin thumbnail: {err:#}");
                // a partially materialized pin must not leak
                support.unpin_leaf(cid);
                entry.thumbnail_size_bytes = 0;
            }
        }
        if let Some(future) = leaf_pin {
            if let Err(err) = future.await {
                let cid = entry.leaf.take().expect("pin implies leaf");
                warn!(record = %entry.record_cid, leaf = %cid, "failed to pin leaf: {err:#}");
                support.unpin_leaf(cid);
                entry.leaf_size_bytes = 0;
            }
        }
        elements.push(entry.into_element());
    }
    Ok(elements)
}

async fn load_doc<S, T>(support: &S, cid: ContentId) -> Result<T, SyncError>
where
    S: RefreshSupport + ?Sized,
    T: Document,
{
    let bytes = support.load_cached(cid).await?;
    Ok(T::decode(&bytes)?)
}

async fn load_or_empty<S, T>(support: &S, cid: Option<ContentId>) -> Result<T, SyncError>
where
    S: RefreshSupport + ?Sized,
    T: Document + Default,
{
    match cid {
        Some(cid) => load_doc(support, cid).await,
        None => Ok(T::default()),
    }
}

async fn check_size<S>(
    support: &S,
    context: &'static str,
    cid: ContentId,
    limit_bytes: u64,
) -> Result<u64, SyncError>
where
    S: RefreshSupport + ?Sized,
{
    let size_bytes = support.size_bytes(cid).await?;
    if size_bytes > limit_bytes {
        return Err(SizeLimitSnafu {
            context,
            size_bytes,
            limit_bytes,
        }
        .build()
        .into());
    }
    Ok(size_bytes)
}
