//! Minimizer scheme selection.
//!
//! The selector inspects a single sampling block and fixes every global
//! parameter of the run: the minimizer length, the super-mer length
//! bound, the bucket count, and all derived byte widths. The result is
//! an immutable [`Scheme`] passed by shared reference to every phase;
//! nothing mutates it afterwards.

use rlimit::Resource;
use tracing::info;

use crate::constants::{
    bits_for, bytes_for_bits, is_valid_k, FD_RESERVE, MAX_K, MAX_MMER, MIN_K, MIN_RMAX,
};
use crate::error::{FastkError, Result};
use crate::input::Block;

/// User-chosen inputs to scheme selection.
#[derive(Debug, Clone)]
pub struct SchemeParams {
    /// K-mer length.
    pub kmer: usize,
    /// Target bucket footprint in bytes for the sort phase.
    pub sort_memory: u64,
    /// Worker thread count.
    pub nthreads: usize,
    /// Seed for the minimizer hash.
    pub seed: u64,
}

/// All derived parameters of a counting run.
///
/// Sizes follow from `kmer` and the sampling block; see the field docs
/// for the exact definitions. `Scheme` is cheap to clone and never
/// mutated after [`Scheme::determine`].
#[derive(Debug, Clone)]
pub struct Scheme {
    /// K-mer length.
    pub kmer: usize,
    /// Minimizer length, `min(kmer - 1, 11)`.
    pub mmer: usize,
    /// Window ring capacity: smallest power of two > `kmer`.
    pub mod_len: usize,
    /// `mod_len - 1`.
    pub mod_msk: usize,
    /// Maximum k-mers per super-mer; a longer run is force-split.
    pub max_super: usize,
    /// Maximum super-mer length in bases: `max_super + kmer - 1`.
    pub smer: usize,
    /// Number of on-disk buckets.
    pub nparts: usize,
    /// Bytes of a packed k-mer.
    pub kmer_bytes: usize,
    /// Bytes of a maximal packed super-mer.
    pub smer_bytes: usize,
    /// Bits needed to encode `max_super`.
    pub slen_bits: usize,
    /// Bytes of the super-mer length prefix.
    pub slen_bytes: usize,
    /// Fixed sort-record width: `smer_bytes + slen_bytes`.
    pub smer_word: usize,
    /// Table record width: `kmer_bytes + 2` (u16 count).
    pub tmer_word: usize,
    /// Bytes of a profile-fragment length prefix.
    pub plen_bytes: usize,
    /// Bytes of a run index on disk.
    pub run_bytes: usize,
    /// Largest representable per-thread run index.
    pub rmax: u64,
    /// Minimizer hash seed.
    pub seed: u64,
}

impl Scheme {
    /// Choose the scheme from the sampling block.
    ///
    /// `ratio` projects the sample onto the full data set (total source
    /// bytes over bytes consumed by the sample). Fails when the sampled
    /// reads are on average shorter than 1.5x the k-mer size.
    pub fn determine(block: &Block, ratio: f64, params: &SchemeParams) -> Result<Scheme> {
        let k = params.kmer;
        if !is_valid_k(k) {
            return Err(FastkError::config(format!(
                "k-mer length must be in [{MIN_K}, {MAX_K}], got {k}"
            )));
        }
        if params.nthreads == 0 {
            return Err(FastkError::config("thread count must be positive"));
        }
        if params.sort_memory == 0 {
            return Err(FastkError::config("sort memory must be positive"));
        }

        let kmer_bytes = (2 * k + 7) >> 3;
        let tmer_word = kmer_bytes + 2;

        let nreads = block.nreads() as i64;
        let totlen = block.totlen() as i64;
        let distinct = totlen - (k as i64) * nreads;
        if nreads > 0 && distinct < totlen / 3 {
            return Err(FastkError::input(
                "sequences are on average smaller than 1.5x the k-mer size",
            ));
        }

        let est_kmers = distinct.max(0) as f64 * ratio;
        let est_bytes = (est_kmers * tmer_word as f64).ceil() as u64;
        let nparts = est_bytes.div_ceil(params.sort_memory).max(1) as usize;

        let mmer = (k - 1).min(MAX_MMER);
        let mod_len = (k + 1).next_power_of_two();
        let max_super = 2 * (k - mmer + 1);
        let smer = max_super + k - 1;
        let slen_bits = bits_for(max_super as u64);
        let slen_bytes = bytes_for_bits(slen_bits);
        let smer_bytes = (2 * smer + 7) >> 3;
        // +2 bits: a u16 count delta can occupy three var-bytes, so a
        // fragment payload can reach 3 * max_super bytes.
        let plen_bytes = bytes_for_bits(slen_bits + 2);

        let est_runs_per_thread = nreads as f64 * ratio / params.nthreads as f64;
        let rmax = ((est_runs_per_thread * 8.0) as u64)
            .max(MIN_RMAX + 1)
            .next_power_of_two()
            - 1;
        let run_bytes = bytes_for_bits(bits_for(rmax));

        info!(
            "scheme: k={} m={} max_super={} nparts={} (est {:.3}M k-mer records)",
            k,
            mmer,
            max_super,
            nparts,
            est_kmers / 1e6
        );

        Ok(Scheme {
            kmer: k,
            mmer,
            mod_len,
            mod_msk: mod_len - 1,
            max_super,
            smer,
            nparts,
            kmer_bytes,
            smer_bytes,
            slen_bits,
            slen_bytes,
            smer_word: smer_bytes + slen_bytes,
            tmer_word,
            plen_bytes,
            run_bytes,
            rmax,
            seed: params.seed,
        })
    }

    /// Bucket owning a minimizer rank.
    #[inline]
    pub fn bucket_of(&self, rank: u64) -> usize {
        (rank % self.nparts as u64) as usize
    }

    /// Mask selecting the low `2 * mmer` bits of a rolling m-mer value.
    #[inline]
    pub fn mmer_mask(&self) -> u64 {
        (1u64 << (2 * self.mmer)) - 1
    }
}

/// Descriptors the run needs open at once.
pub fn fd_budget(nparts: usize, nthreads: usize) -> u64 {
    (nparts as u64 + 2) * nthreads as u64 + FD_RESERVE
}

/// Raise the open-file limit to the run's budget, failing when the hard
/// limit is below it.
pub fn ensure_fd_limit(nparts: usize, nthreads: usize) -> Result<u64> {
    let required = fd_budget(nparts, nthreads);
    let (soft, hard) = rlimit::getrlimit(Resource::NOFILE)
        .map_err(|e| FastkError::resource(format!("cannot query open-file limit: {e}")))?;
    if soft >= required {
        return Ok(required);
    }
    if hard < required {
        return Err(FastkError::resource(format!(
            "cannot open {required} files simultaneously (hard limit is {hard})"
        )));
    }
    rlimit::setrlimit(Resource::NOFILE, required, hard).map_err(|e| {
        FastkError::resource(format!("failed to raise open-file limit to {required}: {e}"))
    })?;
    Ok(required)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{DEFAULT_SEED, DEFAULT_SORT_MEMORY};
    use crate::input::Block;

    fn params(kmer: usize) -> SchemeParams {
        SchemeParams {
            kmer,
            sort_memory: DEFAULT_SORT_MEMORY,
            nthreads: 4,
            seed: DEFAULT_SEED,
        }
    }

    fn block_of(lens: &[usize]) -> Block {
        let mut block = Block::default();
        for &len in lens {
            // Alternate bases so compression-free runs of any length exist.
            let codes: Vec<u8> = (0..len).map(|i| (i % 4) as u8).collect();
            block.push_run(&codes);
        }
        block
    }

    #[test]
    fn test_derived_sizes_k40() {
        let block = block_of(&[1000; 16]);
        let scheme = Scheme::determine(&block, 1.0, &params(40)).unwrap();
        assert_eq!(scheme.kmer_bytes, 10);
        assert_eq!(scheme.tmer_word, 12);
        assert_eq!(scheme.mmer, 11);
        assert_eq!(scheme.mod_len, 64);
        assert_eq!(scheme.max_super, 60);
        assert_eq!(scheme.smer, 99);
        assert_eq!(scheme.slen_bits, 6);
        assert_eq!(scheme.slen_bytes, 1);
        assert_eq!(scheme.smer_bytes, 25);
        assert_eq!(scheme.smer_word, 26);
        assert_eq!(scheme.plen_bytes, 1);
        assert_eq!(scheme.nparts, 1);
    }

    #[test]
    fn test_small_k() {
        let block = block_of(&[100; 4]);
        let scheme = Scheme::determine(&block, 1.0, &params(5)).unwrap();
        assert_eq!(scheme.mmer, 4);
        assert_eq!(scheme.mod_len, 8);
        assert_eq!(scheme.max_super, 4);
    }

    #[test]
    fn test_too_short_sequences() {
        let block = block_of(&[50; 8]);
        let err = Scheme::determine(&block, 1.0, &params(40)).unwrap_err();
        assert!(err.to_string().contains("1.5x"));
    }

    #[test]
    fn test_empty_sample_is_allowed() {
        // Every read may have been skipped; the run then produces
        // empty outputs rather than failing.
        let block = Block::default();
        let scheme = Scheme::determine(&block, 1.0, &params(40)).unwrap();
        assert_eq!(scheme.nparts, 1);
    }

    #[test]
    fn test_nparts_scales_with_memory() {
        let block = block_of(&[1000; 100]);
        let mut p = params(40);
        p.sort_memory = 64 * 1024;
        let scheme = Scheme::determine(&block, 1.0, &p).unwrap();
        // 100 * 960 k-mers * 12 bytes ~ 1.15 MB over a 64 KB budget.
        assert!(scheme.nparts >= 4, "nparts = {}", scheme.nparts);
    }

    #[test]
    fn test_bucket_assignment_in_range() {
        let block = block_of(&[1000; 100]);
        let mut p = params(40);
        p.sort_memory = 64 * 1024;
        let scheme = Scheme::determine(&block, 1.0, &p).unwrap();
        for rank in [0u64, 1, u64::MAX, 0x1234_5678_9abc_def0] {
            assert!(scheme.bucket_of(rank) < scheme.nparts);
        }
    }

    #[test]
    fn test_fd_budget() {
        assert_eq!(fd_budget(1, 1), 3 + FD_RESERVE);
        assert_eq!(fd_budget(8, 4), 40 + FD_RESERVE);
    }

    #[test]
    fn test_rmax_floor() {
        let block = block_of(&[1000; 4]);
        let scheme = Scheme::determine(&block, 1.0, &params(40)).unwrap();
        assert_eq!(scheme.rmax, MIN_RMAX);
        assert_eq!(scheme.run_bytes, 3);
    }
}
