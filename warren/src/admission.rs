//! Randomized admission and eviction under a byte budget.
//!
//! The algorithm operates only on the data it is given, with no storage of
//! its own, so the same type serves per-followee admission and global
//! pruning equally well.  Decisions favor entries at the front of the
//! candidate list, so callers order their lists newest-first to favor
//! recent content without any per-item recency bookkeeping.  All
//! randomness comes through an injected [`Rng`], which keeps every
//! decision reproducible under a seeded source.

use rand::Rng;

/// One entry offered for admission or eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate<T> {
    /// Size this entry would occupy (or free), in bytes.
    pub size_bytes: u64,
    /// Caller data carried through the decision.
    pub data: T,
}

impl<T> Candidate<T> {
    /// Creates a candidate.
    pub fn new(size_bytes: u64, data: T) -> Self {
        Self { size_bytes, data }
    }
}

/// Budget-tracking cache decision helper.
///
/// The tracked occupancy is updated by every decision, so one instance can
/// be threaded through a whole refresh and its final state reflects the
/// sum of everything it admitted or evicted.
#[derive(Debug)]
pub struct CacheAlgorithm {
    max_size_bytes: u64,
    current_size_bytes: u64,
}

impl CacheAlgorithm {
    /// Creates the algorithm with the given limit and current occupancy.
    pub fn new(max_size_bytes: u64, current_size_bytes: u64) -> Self {
        Self {
            max_size_bytes,
            current_size_bytes,
        }
    }

    /// The number of bytes still available under the budget.
    pub fn bytes_available(&self) -> u64 {
        self.max_size_bytes.saturating_sub(self.current_size_bytes)
    }

    /// The occupancy currently tracked.
    pub fn current_size_bytes(&self) -> u64 {
        self.current_size_bytes
    }

    /// Accounts for bytes added by an external decision-maker.
    ///
    /// Returns true if the cache is now over budget and needs cleaning.
    pub fn needs_clean_after_addition(&mut self, bytes_added: u64) -> bool {
        self.current_size_bytes += bytes_added;
        self.current_size_bytes > self.max_size_bytes
    }

    /// Selects candidates to evict, uniformly at random, until the tracked
    /// occupancy is back within budget or the candidates run out.
    pub fn select_for_eviction<T, R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        candidates: Vec<Candidate<T>>,
    ) -> Vec<Candidate<T>> {
        let mut candidates = candidates;
        let mut evictions = Vec::new();
        while !candidates.is_empty() && self.current_size_bytes > self.max_size_bytes {
            let index = rng.gen_range(0..candidates.len());
            let candidate = candidates.swap_remove(index);
            self.current_size_bytes = self
                .current_size_bytes
                .saturating_sub(candidate.size_bytes);
            evictions.push(candidate);
        }
        evictions
    }

    /// Walks candidates in order and selects a subset to admit.
    ///
    /// The walk stops entirely once the tracked occupancy is over budget,
    /// and skips (without stopping) any single candidate that would
    /// overflow on its own.  Otherwise a candidate is admitted with
    /// probability `1 - occupancy`, so admission gets steadily less likely
    /// as the cache fills.  Callers must clean the cache first or nothing
    /// may be admitted at all.
    pub fn select_for_addition<T, R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        candidates: Vec<Candidate<T>>,
    ) -> Vec<Candidate<T>> {
        let mut additions = Vec::new();
        for candidate in candidates {
            if self.current_size_bytes > self.max_size_bytes {
                // could be the first iteration, so check before touching
                // anything
                break;
            }
            if self.current_size_bytes + candidate.size_bytes > self.max_size_bytes {
                // this one alone would overflow, skip it
                continue;
            }
            let occupancy = self.current_size_bytes as f64 / self.max_size_bytes as f64;
            if rng.r#gen::<f64>() >= occupancy {
                self.current_size_bytes += candidate.size_bytes;
                additions.push(candidate);
            }
        }
        additions
    }
}
