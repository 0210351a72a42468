//! Local projections of what is cached per followee.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use warren_base::{ChannelKey, ContentId};

/// What is pinned locally for one remote post.
///
/// Created or replaced by the reconciliation engine; destroyed when the
/// post or the followee is removed.  The element's meta-data is always
/// pinned; `image` and `leaf` are only present when those leaves were
/// successfully pinned too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowingCacheElement {
    /// The record meta-data content id.
    pub element: ContentId,
    /// Pinned thumbnail, if any.
    pub image: Option<ContentId>,
    /// Pinned video-or-audio leaf, if any.
    pub leaf: Option<ContentId>,
    /// Combined size of the pinned leaves, in bytes.  Zero for a
    /// metadata-only element.
    pub combined_size_bytes: u64,
}

impl FollowingCacheElement {
    /// An element with no leaves cached: the record's existence stays
    /// pinned and known, but it accounts zero bytes.
    pub fn metadata_only(element: ContentId) -> Self {
        Self {
            element,
            image: None,
            leaf: None,
            combined_size_bytes: 0,
        }
    }
}

/// Per-followee cache record.
///
/// Only mutated inside a refresh session's locked phases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolloweeState {
    /// Root last successfully reconciled, `None` before the first
    /// successful refresh.
    pub last_fetched_root: Option<ContentId>,
    /// When the last refresh attempt (success or failure) happened.
    pub last_poll_ms: u64,
    elements: HashMap<ContentId, FollowingCacheElement>,
}

impl FolloweeState {
    /// The cached elements, unordered.
    pub fn elements(&self) -> impl Iterator<Item = &FollowingCacheElement> {
        self.elements.values()
    }

    /// Looks up the element cached for a record.
    pub fn element(&self, record: &ContentId) -> Option<&FollowingCacheElement> {
        self.elements.get(record)
    }

    /// Sum of leaf bytes cached for this followee.
    pub fn cached_bytes(&self) -> u64 {
        self.elements.values().map(|e| e.combined_size_bytes).sum()
    }
}

/// All followees, keyed by channel key.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FolloweeSet {
    followees: HashMap<ChannelKey, FolloweeState>,
}

impl FolloweeSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// All followed keys.
    pub fn keys(&self) -> impl Iterator<Item = &ChannelKey> {
        self.followees.keys()
    }

    /// State for one followee.
    pub fn get(&self, key: &ChannelKey) -> Option<&FolloweeState> {
        self.followees.get(key)
    }

    /// Iterates over all followees.
    pub fn iter(&self) -> impl Iterator<Item = (&ChannelKey, &FolloweeState)> {
        self.followees.iter()
    }

    /// Starts following `key`.  The state starts with no fetched root, so
    /// the next refresh is treated as a first fetch.
    pub fn follow(&mut self, key: ChannelKey, now_ms: u64) {
        self.followees.entry(key).or_insert(FolloweeState {
            last_fetched_root: None,
            last_poll_ms: now_ms,
            elements: HashMap::new(),
        });
    }

    /// Removes a followee entirely, returning its last state.
    pub fn remove(&mut self, key: &ChannelKey) -> Option<FolloweeState> {
        self.followees.remove(key)
    }

    /// Clones the cached elements of `key` for use outside the lock.
    pub fn snapshot_elements(&self, key: &ChannelKey) -> Vec<FollowingCacheElement> {
        self.followees
            .get(key)
            .map(|state| state.elements.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Records a successful refresh: new root, new element list, new poll
    /// time.
    pub fn record_success(
        &mut self,
        key: ChannelKey,
        root: ContentId,
        elements: Vec<FollowingCacheElement>,
        now_ms: u64,
    ) {
        let state = self.followees.entry(key).or_default();
        state.last_fetched_root = Some(root);
        state.last_poll_ms = now_ms;
        state.elements = elements.into_iter().map(|e| (e.element, e)).collect();
    }

    /// Records a failed refresh: the old root and elements stay, but the
    /// poll time advances so a persistently broken followee is retried on
    /// the normal schedule instead of in a tight loop.
    pub fn record_failure(&mut self, key: &ChannelKey, now_ms: u64) {
        if let Some(state) = self.followees.get_mut(key) {
            state.last_poll_ms = now_ms;
        }
    }

    /// Swaps one element for a metadata-only placeholder, used when global
    /// pruning reclaims its leaves.
    pub fn strip_element(&mut self, key: &ChannelKey, record: &ContentId) {
        if let Some(state) = self.followees.get_mut(key) {
            if let Some(element) = state.elements.get_mut(record) {
                *element = FollowingCacheElement::metadata_only(*record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{cid, key};

    #[test]
    fn test_success_replaces_elements_wholesale() {
        let mut set = FolloweeSet::new();
        set.follow(key(1), 100);
        set.record_success(
            key(1),
            cid(1),
            vec![FollowingCacheElement {
                element: cid(10),
                image: Some(cid(11)),
                leaf: None,
                combined_size_bytes: 500,
            }],
            200,
        );
        set.record_success(
            key(1),
            cid(2),
            vec![FollowingCacheElement::metadata_only(cid(20))],
            300,
        );
        let state = set.get(&key(1)).unwrap();
        assert_eq!(state.last_fetched_root, Some(cid(2)));
        assert_eq!(state.last_poll_ms, 300);
        assert!(state.element(&cid(10)).is_none());
        assert_eq!(state.cached_bytes(), 0);
    }

    #[test]
    fn test_failure_keeps_root_but_advances_poll() {
        let mut set = FolloweeSet::new();
        set.follow(key(1), 100);
        set.record_success(key(1), cid(1), Vec::new(), 200);
        set.record_failure(&key(1), 999);
        let state = set.get(&key(1)).unwrap();
        assert_eq!(state.last_fetched_root, Some(cid(1)));
        assert_eq!(state.last_poll_ms, 999);
    }

    #[test]
    fn test_strip_element_keeps_record_known() {
        let mut set = FolloweeSet::new();
        set.record_success(
            key(1),
            cid(1),
            vec![FollowingCacheElement {
                element: cid(10),
                image: Some(cid(11)),
                leaf: Some(cid(12)),
                combined_size_bytes: 700,
            }],
            100,
        );
        set.strip_element(&key(1), &cid(10));
        let element = set.get(&key(1)).unwrap().element(&cid(10)).unwrap();
        assert_eq!(element.image, None);
        assert_eq!(element.combined_size_bytes, 0);
    }
}
