//! The explicit cache: read-through LRU for one-off lookups.
//!
//! Content reached outside any followee relationship (a shared link, a
//! direct lookup) still has to be pinned to be served, but nothing will
//! ever refresh or garbage-collect it through the followee machinery.
//! This cache owns that data: look-ups read through to the network on
//! miss, entries are purged least-recently-used under a fixed byte
//! budget, and every pin goes through the same transaction discipline as
//! a followee refresh.
//!
//! Lock structure mirrors the refresh sessions: the cache check and the
//! insert/commit happen under the write lock, the network fetch in
//! between does not hold it.  Because the lock is dropped mid-flight, the
//! insert path re-checks for a concurrent winner and rolls its own
//! transaction back when it lost the race.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use warren_base::{ChannelKey, ContentId};

use crate::access::WriteAccess;
use crate::docs::{ChannelIndex, Description, Document, LeafSet, Record, Recommendations};
use crate::error::{MissingReferenceSnafu, SizeLimitSnafu, SyncError};
use crate::limits;
use crate::txn::PendingTransaction;

/// Cached meta-data of one looked-up user, all four artifacts pinned as a
/// unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    /// The resolved root (index) cid; also the cache key.
    pub index: ContentId,
    /// The pinned description.
    pub description: ContentId,
    /// The pinned recommendations list.
    pub recommendations: ContentId,
    /// The pinned user picture, if the description references one.
    pub user_pic: Option<ContentId>,
    /// Combined size of everything pinned for this entry.
    pub combined_size_bytes: u64,
}

/// Cached meta-data and selected leaves of one looked-up record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    /// The record cid; also the cache key.
    pub record: ContentId,
    /// The pinned thumbnail, if any.
    pub thumbnail: Option<ContentId>,
    /// The pinned video leaf, if one was selected.
    pub video: Option<ContentId>,
    /// The pinned audio leaf, if one was selected instead.
    pub audio: Option<ContentId>,
    /// Combined size of everything pinned for this entry.
    pub combined_size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExplicitKey {
    User(ContentId),
    Record(ContentId),
}

/// LRU bookkeeping for the explicit cache.  One recency order covers both
/// keyspaces, so a burst of record lookups can age out user entries and
/// vice versa.
#[derive(Debug, Default)]
pub struct ExplicitCacheState {
    // front is least recently used
    lru: VecDeque<ExplicitKey>,
    users: HashMap<ContentId, UserInfo>,
    records: HashMap<ContentId, RecordInfo>,
    total_bytes: u64,
}

impl ExplicitCacheState {
    fn touch(&mut self, key: ExplicitKey) {
        if let Some(position) = self.lru.iter().position(|k| *k == key) {
            self.lru.remove(position);
            self.lru.push_back(key);
        }
    }

    fn get_user(&mut self, root: &ContentId) -> Option<UserInfo> {
        let info = self.users.get(root).cloned();
        if info.is_some() {
            self.touch(ExplicitKey::User(*root));
        }
        info
    }

    fn get_record(&mut self, record: &ContentId) -> Option<RecordInfo> {
        let info = self.records.get(record).cloned();
        if info.is_some() {
            self.touch(ExplicitKey::Record(*record));
        }
        info
    }

    fn peek_record(&self, record: &ContentId) -> Option<RecordInfo> {
        self.records.get(record).cloned()
    }

    fn insert_user(&mut self, info: UserInfo) {
        debug_assert!(!self.users.contains_key(&info.index));
        self.total_bytes += info.combined_size_bytes;
        self.lru.push_back(ExplicitKey::User(info.index));
        self.users.insert(info.index, info);
    }

    fn insert_record(&mut self, info: RecordInfo) {
        debug_assert!(!self.records.contains_key(&info.record));
        self.total_bytes += info.combined_size_bytes;
        self.lru.push_back(ExplicitKey::Record(info.record));
        self.records.insert(info.record, info);
    }

    /// Current total size of the cache in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Removes least-recently-used entries until the cache fits
    /// `limit_bytes`, calling `unpin` once per pinned artifact let go.
    fn purge_to(&mut self, limit_bytes: u64, mut unpin: impl FnMut(ContentId)) {
        while self.total_bytes > limit_bytes {
            let Some(evict) = self.lru.pop_front() else {
                break;
            };
            match evict {
                ExplicitKey::User(root) => {
                    let info = self.users.remove(&root).expect("lru entry has info");
                    unpin(info.index);
                    unpin(info.description);
                    unpin(info.recommendations);
                    if let Some(pic) = info.user_pic {
                        unpin(pic);
                    }
                    self.total_bytes -= info.combined_size_bytes;
                }
                ExplicitKey::Record(record) => {
                    let info = self.records.remove(&record).expect("lru entry has info");
                    unpin(info.record);
                    for cid in [info.thumbnail, info.video, info.audio].into_iter().flatten() {
                        unpin(cid);
                    }
                    self.total_bytes -= info.combined_size_bytes;
                }
            }
        }
    }
}

/// The explicit lookup cache.
///
/// Shares the authoritative state (and its lock) with the rest of the
/// system but owns its LRU bookkeeping.
#[derive(Debug)]
pub struct ExplicitCache<A: WriteAccess> {
    access: Arc<RwLock<A>>,
    state: Mutex<ExplicitCacheState>,
}

impl<A: WriteAccess> ExplicitCache<A> {
    /// Creates an empty cache over the shared authoritative state.
    pub fn new(access: Arc<RwLock<A>>) -> Self {
        Self {
            access,
            state: Mutex::new(ExplicitCacheState::default()),
        }
    }

    /// Looks up a user's channel meta-data, reading through to the
    /// network on miss.  A hit marks the entry most recently used.
    ///
    /// The key is re-resolved on every call, even for hits: trusting a
    /// cached resolution would keep serving an old version of the user
    /// forever, since it would keep being "found".
    pub async fn user_info(&self, key: ChannelKey) -> Result<UserInfo, SyncError> {
        let net = self.access.read().await.net();
        let root = net.resolve_key(key).await?;
        if let Some(info) = self.state.lock().await.get_user(&root) {
            debug!(user = %key.fmt_short(), "explicit cache hit");
            return Ok(info);
        }

        let txn = {
            let access = self.access.read().await;
            PendingTransaction::open(access.net(), access.pinned_snapshot())
        };
        match load_user_info(&txn, root).await {
            Err(err) => {
                txn.rollback(&mut *self.access.write().await);
                Err(err)
            }
            Ok(info) => {
                let mut access = self.access.write().await;
                let mut state = self.state.lock().await;
                if let Some(winner) = state.get_user(&root) {
                    // somebody cached it while we were fetching; our
                    // network work is redundant
                    txn.rollback(&mut *access);
                    return Ok(winner);
                }
                state.insert_user(info.clone());
                txn.commit(&mut *access);
                let limit = access.prefs().explicit_cache_target_bytes;
                state.purge_to(limit, |cid| {
                    if let Err(err) = access.unpin_now(cid) {
                        warn!(%cid, "failed to unpin evicted entry: {err:#}");
                    }
                });
                Ok(info)
            }
        }
    }

    /// Looks up one record, reading through to the network on miss.  A
    /// hit marks the entry most recently used.
    pub async fn record_info(&self, record: ContentId) -> Result<RecordInfo, SyncError> {
        if let Some(info) = self.state.lock().await.get_record(&record) {
            debug!(%record, "explicit cache hit");
            return Ok(info);
        }

        let (txn, video_edge_pixel_max) = {
            let access = self.access.read().await;
            (
                PendingTransaction::open(access.net(), access.pinned_snapshot()),
                access.prefs().video_edge_pixel_max,
            )
        };
        match load_record_info(&txn, video_edge_pixel_max, record).await {
            Err(err) => {
                txn.rollback(&mut *self.access.write().await);
                Err(err)
            }
            Ok(info) => {
                let mut access = self.access.write().await;
                let mut state = self.state.lock().await;
                if let Some(winner) = state.get_record(&record) {
                    txn.rollback(&mut *access);
                    return Ok(winner);
                }
                state.insert_record(info.clone());
                txn.commit(&mut *access);
                let limit = access.prefs().explicit_cache_target_bytes;
                state.purge_to(limit, |cid| {
                    if let Err(err) = access.unpin_now(cid) {
                        warn!(%cid, "failed to unpin evicted entry: {err:#}");
                    }
                });
                Ok(info)
            }
        }
    }

    /// Returns the cached record info without touching the network or the
    /// recency order.
    pub async fn existing_record_info(&self, record: ContentId) -> Option<RecordInfo> {
        self.state.lock().await.peek_record(&record)
    }

    /// Current total size of the cache in bytes.
    pub async fn total_bytes(&self) -> u64 {
        self.state.lock().await.total_bytes()
    }
}

/// Validates the full index → description → recommendations chain, then
/// pins all four artifacts as one unit.
async fn load_user_info(txn: &PendingTransaction, root: ContentId) -> Result<UserInfo, SyncError> {
    // read everything before pinning anything, to prove the chain valid
    let index_bytes = txn
        .load_not_cached(root, ChannelIndex::CONTEXT, ChannelIndex::SIZE_LIMIT_BYTES)
        .await?;
    let index = ChannelIndex::decode(&index_bytes)?;
    let description_cid = index.description.ok_or_else(|| {
        SyncError::from(MissingReferenceSnafu {
            context: Description::CONTEXT,
        }
        .build())
    })?;
    let recommendations_cid = index.recommendations.ok_or_else(|| {
        SyncError::from(MissingReferenceSnafu {
            context: Recommendations::CONTEXT,
        }
        .build())
    })?;
    let description = Description::decode(
        &txn.load_not_cached(
            description_cid,
            Description::CONTEXT,
            Description::SIZE_LIMIT_BYTES,
        )
        .await?,
    )?;
    let _: Recommendations = Recommendations::decode(
        &txn.load_not_cached(
            recommendations_cid,
            Recommendations::CONTEXT,
            Recommendations::SIZE_LIMIT_BYTES,
        )
        .await?,
    )?;
    let user_pic_size = match description.picture {
        Some(pic) => {
            let size = txn.size_bytes(pic).await?;
            if size > limits::MAX_USER_PIC_SIZE_BYTES {
                return Err(SizeLimitSnafu {
                    context: "user picture",
                    size_bytes: size,
                    limit_bytes: limits::MAX_USER_PIC_SIZE_BYTES,
                }
                .build()
                .into());
            }
            size
        }
        None => 0,
    };

    // everything validated; pin as one unit
    let pin_index = txn.pin(root);
    let pin_description = txn.pin(description_cid);
    let pin_recommendations = txn.pin(recommendations_cid);
    let pin_pic = description.picture.map(|pic| txn.pin(pic));
    pin_index.await?;
    pin_description.await?;
    pin_recommendations.await?;
    if let Some(pin) = pin_pic {
        pin.await?;
    }

    let size_index = txn.size_bytes(root);
    let size_description = txn.size_bytes(description_cid);
    let size_recommendations = txn.size_bytes(recommendations_cid);
    let combined_size_bytes =
        size_index.await? + size_description.await? + size_recommendations.await? + user_pic_size;
    Ok(UserInfo {
        index: root,
        description: description_cid,
        recommendations: recommendations_cid,
        user_pic: description.picture,
        combined_size_bytes,
    })
}

/// Loads and pins one record with its selected leaves, all or nothing:
/// any failure propagates and leaves cleanup to the caller's rollback.
async fn load_record_info(
    txn: &PendingTransaction,
    video_edge_pixel_max: u32,
    record_cid: ContentId,
) -> Result<RecordInfo, SyncError> {
    let bytes = txn
        .load_not_cached(record_cid, Record::CONTEXT, Record::SIZE_LIMIT_BYTES)
        .await?;
    let record = Record::decode(&bytes)?;
    let leaves = LeafSet::parse(&record);
    let video = leaves
        .largest_video_within(video_edge_pixel_max)
        .map(|v| v.cid);
    // video wins when both exist
    let audio = if video.is_some() { None } else { leaves.audio };
    let thumbnail = leaves.thumbnail;

    let pin_record = txn.pin(record_cid);
    let pin_thumbnail = thumbnail.map(|cid| txn.pin(cid));
    let pin_video = video.map(|cid| txn.pin(cid));
    let pin_audio = audio.map(|cid| txn.pin(cid));
    pin_record.await?;
    for pin in [pin_thumbnail, pin_video, pin_audio].into_iter().flatten() {
        pin.await?;
    }

    let mut combined_size_bytes = txn.size_bytes(record_cid).await?;
    for cid in [thumbnail, video, audio].into_iter().flatten() {
        combined_size_bytes += txn.size_bytes(cid).await?;
    }
    Ok(RecordInfo {
        record: record_cid,
        thumbnail,
        video,
        audio,
        combined_size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::Leaf;
    use crate::test_support::{FakeAccess, FakeNet, NetCall, cid, key};

    fn publish_user(net: &FakeNet, base: u8, pic: Option<ContentId>) -> ContentId {
        net.put_doc(
            cid(base + 1),
            &Description {
                name: "someone".into(),
                text: String::new(),
                picture: pic,
            },
        );
        net.put_doc(cid(base + 2), &Recommendations::default());
        net.put_doc(
            cid(base),
            &ChannelIndex {
                description: Some(cid(base + 1)),
                recommendations: Some(cid(base + 2)),
                records: Some(cid(base + 3)),
            },
        );
        cid(base)
    }

    fn cache(net: Arc<FakeNet>) -> ExplicitCache<FakeAccess> {
        ExplicitCache::new(Arc::new(RwLock::new(FakeAccess::new(net))))
    }

    #[tokio::test]
    async fn test_second_lookup_is_a_hit_but_still_resolves() {
        let net = FakeNet::new();
        let pic = cid(40);
        net.put_blob(pic, 500);
        let root = publish_user(&net, 100, Some(pic));
        net.set_key(key(1), root);
        let cache = cache(net.clone());

        let first = cache.user_info(key(1)).await.unwrap();
        assert_eq!(first.index, root);
        assert_eq!(first.user_pic, Some(pic));
        let fetches_after_first = net.count_calls(|c| matches!(c, NetCall::Fetch(_)));
        assert!(fetches_after_first > 0);

        let second = cache.user_info(key(1)).await.unwrap();
        assert_eq!(second, first);
        // no further network fetches, but the key was resolved again
        assert_eq!(
            net.count_calls(|c| matches!(c, NetCall::Fetch(_))),
            fetches_after_first
        );
        assert_eq!(net.count_calls(|c| matches!(c, NetCall::Resolve(_))), 2);
        // all four artifacts are pinned as one unit
        for pinned in [root, cid(101), cid(102), pic] {
            assert!(net.is_pinned(pinned), "{pinned}");
        }
    }

    #[tokio::test]
    async fn test_stale_resolution_is_never_trusted() {
        let net = FakeNet::new();
        let old_root = publish_user(&net, 100, None);
        let new_root = publish_user(&net, 120, None);
        net.set_key(key(1), old_root);
        let cache = cache(net.clone());

        let first = cache.user_info(key(1)).await.unwrap();
        assert_eq!(first.index, old_root);

        // the user republished; the next lookup must see the new root,
        // not the cached entry for the old one
        net.set_key(key(1), new_root);
        let second = cache.user_info(key(1)).await.unwrap();
        assert_eq!(second.index, new_root);
    }

    #[tokio::test]
    async fn test_record_lookup_all_or_nothing_unwind() {
        let net = FakeNet::new();
        let thumbnail = cid(60);
        let video = cid(61);
        net.put_blob(thumbnail, 1000);
        net.put_blob(video, 5000);
        net.put_doc(
            cid(50),
            &Record {
                thumbnail: Some(thumbnail),
                attachments: vec![Leaf {
                    cid: video,
                    mime: "video/mp4".into(),
                    width: 640,
                    height: 480,
                }],
                ..Default::default()
            },
        );
        net.fail_pin(video);
        let cache = cache(net.clone());

        let err = cache.record_info(cid(50)).await.unwrap_err();
        assert!(matches!(err, SyncError::Connection { .. }));
        // the single-entity fetch unwinds every partial pin
        for unpinned in [cid(50), thumbnail, video] {
            assert!(!net.is_pinned(unpinned), "{unpinned} must be unwound");
        }
        assert_eq!(cache.total_bytes().await, 0);

        // a later retry with the fault gone succeeds and pins everything
        net.clear_pin_failures();
        let info = cache.record_info(cid(50)).await.unwrap();
        assert_eq!(info.thumbnail, Some(thumbnail));
        assert_eq!(info.video, Some(video));
        assert!(info.audio.is_none());
        for pinned in [cid(50), thumbnail, video] {
            assert!(net.is_pinned(pinned), "{pinned}");
        }
    }

    #[tokio::test]
    async fn test_purge_evicts_least_recently_used_first() {
        let net = FakeNet::new();
        let root_a = publish_user(&net, 100, None);
        let root_b = publish_user(&net, 120, None);
        net.set_key(key(1), root_a);
        net.set_key(key(2), root_b);
        net.put_doc(cid(50), &Record::default());

        let access = Arc::new(RwLock::new(FakeAccess::new(net.clone())));
        let cache = ExplicitCache::new(access.clone());
        let a = cache.user_info(key(1)).await.unwrap();
        let b = cache.user_info(key(2)).await.unwrap();
        // touch A so B is now the least recently used
        cache.user_info(key(1)).await.unwrap();

        // one byte short of fitting all three entries
        let record_bytes = Record::default().encode().len() as u64;
        access.write().await.prefs.explicit_cache_target_bytes =
            a.combined_size_bytes + b.combined_size_bytes + record_bytes - 1;
        // inserting the record pushes the cache over budget
        cache.record_info(cid(50)).await.unwrap();

        // B was evicted and all its artifacts unpinned; A survived
        assert!(!net.is_pinned(b.index));
        assert!(!net.is_pinned(b.description));
        assert!(!net.is_pinned(b.recommendations));
        assert!(net.is_pinned(root_a));
        assert!(net.is_pinned(cid(50)));

        // the evicted entry is refetched on the next lookup
        let fetches = net.count_calls(|c| matches!(c, NetCall::Fetch(_)));
        cache.user_info(key(2)).await.unwrap();
        assert!(net.count_calls(|c| matches!(c, NetCall::Fetch(_))) > fetches);
    }
}
