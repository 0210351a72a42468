//! Cross-followee byte accounting and global pruning.

use rand::Rng;
use tracing::{debug, info};

use crate::access::WriteAccess;
use crate::admission::{CacheAlgorithm, Candidate};
use crate::error::ConnectionError;
use crate::followees::{FolloweeSet, FollowingCacheElement};
use warren_base::ChannelKey;

/// Sum of cached leaf bytes across every followee.
///
/// Content shared by multiple followees is counted once per followee on
/// purpose: each copy is an independent eviction candidate, so the
/// accounting has to match what eviction can actually reclaim.
pub fn total_bytes(followees: &FolloweeSet) -> u64 {
    followees.iter().map(|(_, state)| state.cached_bytes()).sum()
}

/// Evicts randomly chosen leaf data across all followees until the cache
/// fits `limit_bytes`.
///
/// Evicted elements are replaced with metadata-only placeholders: the
/// record itself stays pinned and known, only its heavy leaves are
/// reclaimed.
pub fn prune_to_limit<A, R>(
    rng: &mut R,
    access: &mut A,
    current_bytes: u64,
    limit_bytes: u64,
) -> Result<(), ConnectionError>
where
    A: WriteAccess + ?Sized,
    R: Rng + ?Sized,
{
    let candidates: Vec<Candidate<(ChannelKey, FollowingCacheElement)>> = access
        .followees()
        .iter()
        .flat_map(|(key, state)| {
            state
                .elements()
                .filter(|element| element.combined_size_bytes > 0)
                .map(move |element| {
                    Candidate::new(element.combined_size_bytes, (*key, element.clone()))
                })
        })
        .collect();

    let mut algorithm = CacheAlgorithm::new(limit_bytes, current_bytes);
    let evicted = algorithm.select_for_eviction(rng, candidates);
    for candidate in evicted {
        let (key, element) = candidate.data;
        debug!(
            followee = %key.fmt_short(),
            record = %element.element,
            bytes = element.combined_size_bytes,
            "evicting cached leaves"
        );
        if let Some(image) = element.image {
            access.unpin_now(image)?;
        }
        if let Some(leaf) = element.leaf {
            access.unpin_now(leaf)?;
        }
        access.followees().strip_element(&key, &element.element);
    }
    Ok(())
}

/// Shrinks the followee cache to `fraction` of its target size, if it is
/// over.  Refresh setup uses this to make room before fetching (75% for a
/// first fetch, 90% in steady state, 100% for a deletion).
pub fn shrink_to_fraction<A, R>(
    rng: &mut R,
    access: &mut A,
    fraction: f64,
) -> Result<(), ConnectionError>
where
    A: WriteAccess + ?Sized,
    R: Rng + ?Sized,
{
    let target_bytes = (access.prefs().followee_cache_target_bytes as f64 * fraction) as u64;
    let current_bytes = total_bytes(access.followees());
    if current_bytes > target_bytes {
        info!(current_bytes, target_bytes, "pruning followee cache");
        prune_to_limit(rng, access, current_bytes, target_bytes)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::test_support::{FakeAccess, FakeNet, cid, key};

    #[test]
    fn test_total_bytes_double_counts_shared_content() {
        let net = FakeNet::new();
        let mut access = FakeAccess::new(net);
        let shared = FollowingCacheElement {
            element: cid(1),
            image: Some(cid(2)),
            leaf: None,
            combined_size_bytes: 100,
        };
        access
            .followees
            .record_success(key(1), cid(10), vec![shared.clone()], 0);
        access
            .followees
            .record_success(key(2), cid(11), vec![shared], 0);
        assert_eq!(total_bytes(&access.followees), 200);
    }

    #[test]
    fn test_prune_strips_to_placeholders() {
        let net = FakeNet::new();
        let mut access = FakeAccess::new(net.clone());
        let mut elements = Vec::new();
        for n in 0..4u8 {
            let element = cid(10 + n);
            let image = cid(20 + n);
            let leaf = cid(30 + n);
            access.seed_pin(element);
            access.seed_pin(image);
            access.seed_pin(leaf);
            elements.push(FollowingCacheElement {
                element,
                image: Some(image),
                leaf: Some(leaf),
                combined_size_bytes: 1000,
            });
        }
        access.followees.record_success(key(1), cid(1), elements, 0);
        // a metadata-only element must never be an eviction candidate
        access.followees.record_success(
            key(2),
            cid(2),
            vec![FollowingCacheElement::metadata_only(cid(90))],
            0,
        );

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        prune_to_limit(&mut rng, &mut access, 4000, 1500).unwrap();

        let state = access.followees.get(&key(1)).unwrap();
        let remaining: u64 = state.cached_bytes();
        assert!(remaining <= 1500);
        let stripped = state
            .elements()
            .filter(|e| e.combined_size_bytes == 0)
            .count();
        assert_eq!(stripped, 3);
        // every stripped element keeps its record pinned but lost both
        // leaves
        for element in state.elements() {
            assert!(net.is_pinned(element.element));
            if element.combined_size_bytes == 0 {
                assert_eq!(element.image, None);
                assert_eq!(element.leaf, None);
            } else {
                assert!(net.is_pinned(element.image.unwrap()));
            }
        }
    }

    #[test]
    fn test_shrink_noop_when_under_target() {
        let net = FakeNet::new();
        let mut access = FakeAccess::new(net.clone());
        access.followees.record_success(
            key(1),
            cid(1),
            vec![FollowingCacheElement {
                element: cid(10),
                image: Some(cid(11)),
                leaf: None,
                combined_size_bytes: 50,
            }],
            0,
        );
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        shrink_to_fraction(&mut rng, &mut access, 0.9).unwrap();
        assert!(net.calls().is_empty());
        assert_eq!(total_bytes(&access.followees), 50);
    }
}
