//! Deterministic minimizer ordering using ahash.
//!
//! A seeded AHasher state gives a fixed, uniform total order on m-mer
//! values. Every phase of the pipeline must rank m-mers identically, so
//! the state is built from explicit seeds and never from process
//! randomness.

use ahash::RandomState;
use std::hash::{BuildHasher, Hasher};

/// A deterministic hasher with a seeded state
#[derive(Clone)]
pub struct MinimizerHasher {
    seed: u64,
    state: RandomState,
}

impl MinimizerHasher {
    /// Create a new deterministic hasher with the given seed
    pub fn new(seed: u64) -> Self {
        let state = RandomState::with_seeds(seed, !seed, seed, !seed);
        Self { seed, state }
    }

    /// Hash a packed m-mer value.
    #[inline]
    pub fn hash_u64(&self, value: u64) -> u64 {
        let mut hasher = self.state.build_hasher();
        hasher.write_u64(value);
        hasher.finish()
    }

    /// Rank of an m-mer given its forward and reverse-complement packed
    /// values. The minimum over both orientations makes the rank
    /// orientation-invariant, so a k-mer and its reverse complement
    /// always share a minimizer and land in the same bucket.
    #[inline]
    pub fn canonical_rank(&self, fwd: u64, rc: u64) -> u64 {
        self.hash_u64(fwd).min(self.hash_u64(rc))
    }

    /// Get the seed value
    pub fn seed(&self) -> u64 {
        self.seed
    }
}
