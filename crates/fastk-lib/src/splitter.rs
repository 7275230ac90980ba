//! Splitter: scans reads and distributes canonical super-mers into
//! on-disk buckets.
//!
//! Each worker thread pulls blocks from a shared reader and walks every
//! run with a sliding minimizer window. The window minimum over the
//! `k - m + 1` m-mer ranks of the current k-mer is maintained with a
//! monotonic deque, amortized O(1) per base. A super-mer is emitted
//! when the reigning minimizer rank changes, when it would exceed
//! `MAX_SUPER` k-mers, or at the end of the run, and is appended to the
//! worker's own file for bucket `rank % NPARTS`. Thread x bucket files
//! are write-disjoint, so the phase needs no locks beyond the block
//! reader.
//!
//! When profiles are requested a parallel index file records, per
//! super-mer, the run index and the position of its first k-mer; the
//! profile merger uses those to stitch fragments back into reads.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;

use tracing::info;

use crate::encoding::pack_codes;
use crate::error::{FastkError, Result};
use crate::hasher::MinimizerHasher;
use crate::input::{Block, Input};
use crate::pipeline::TempLayout;
use crate::scheme::Scheme;

/// Tallies produced by the split phase.
#[derive(Debug)]
pub struct SplitOutput {
    /// Runs (accepted reads) handled by each thread.
    pub nruns: Vec<u64>,
    /// Super-mers written to each bucket.
    pub supers_per_bucket: Vec<u64>,
    /// K-mers covered by each bucket's super-mers.
    pub kmers_per_bucket: Vec<u64>,
}

impl SplitOutput {
    /// Total super-mers over all buckets.
    pub fn total_supers(&self) -> u64 {
        self.supers_per_bucket.iter().sum()
    }

    /// Total runs over all threads.
    pub fn total_runs(&self) -> u64 {
        self.nruns.iter().sum()
    }
}

/// Run the split phase with `nthreads` workers.
pub fn split_phase(
    input: &Input,
    scheme: &Scheme,
    layout: &TempLayout,
    nthreads: usize,
    profiles: bool,
) -> Result<SplitOutput> {
    let reader = Mutex::new(input.blocks());

    let stats: Vec<ThreadStats> = thread::scope(|s| {
        let mut handles = Vec::with_capacity(nthreads);
        for t in 0..nthreads {
            let reader = &reader;
            handles.push(s.spawn(move || -> Result<ThreadStats> {
                let mut worker = SplitWorker::new(scheme, layout, t, profiles)?;
                loop {
                    let block = {
                        let mut guard = reader
                            .lock()
                            .map_err(|_| FastkError::invariant("block reader lock poisoned"))?;
                        guard.next_block()?
                    };
                    let Some(block) = block else {
                        break;
                    };
                    worker.process_block(&block)?;
                }
                worker.finish()
            }));
        }
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .map_err(|_| FastkError::invariant("split worker panicked"))?
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut out = SplitOutput {
        nruns: vec![0; nthreads],
        supers_per_bucket: vec![0; scheme.nparts],
        kmers_per_bucket: vec![0; scheme.nparts],
    };
    for (t, st) in stats.into_iter().enumerate() {
        out.nruns[t] = st.nruns;
        for b in 0..scheme.nparts {
            out.supers_per_bucket[b] += st.supers[b];
            out.kmers_per_bucket[b] += st.kmers[b];
        }
    }
    info!(
        "split {} runs into {} super-mers over {} buckets",
        out.total_runs(),
        out.total_supers(),
        scheme.nparts
    );
    Ok(out)
}

struct ThreadStats {
    nruns: u64,
    supers: Vec<u64>,
    kmers: Vec<u64>,
}

struct SplitWorker<'a> {
    scheme: &'a Scheme,
    hasher: MinimizerHasher,
    writers: Vec<BufWriter<File>>,
    paths: Vec<PathBuf>,
    idx_writers: Vec<BufWriter<File>>,
    idx_paths: Vec<PathBuf>,
    rid: u64,
    supers: Vec<u64>,
    kmers: Vec<u64>,
    // scratch
    codes: Vec<u8>,
    ranks: Vec<u64>,
    window: VecDeque<(u32, u64)>,
    packed: Vec<u8>,
}

impl<'a> SplitWorker<'a> {
    fn new(
        scheme: &'a Scheme,
        layout: &TempLayout,
        t: usize,
        profiles: bool,
    ) -> Result<Self> {
        let mut writers = Vec::with_capacity(scheme.nparts);
        let mut paths = Vec::with_capacity(scheme.nparts);
        let mut idx_writers = Vec::new();
        let mut idx_paths = Vec::new();
        for b in 0..scheme.nparts {
            let path = layout.smer(t, b);
            let file = File::create(&path).map_err(|e| FastkError::io(&path, "create", e))?;
            writers.push(BufWriter::with_capacity(1 << 16, file));
            paths.push(path);
            if profiles {
                let path = layout.sidx(t, b);
                let file =
                    File::create(&path).map_err(|e| FastkError::io(&path, "create", e))?;
                idx_writers.push(BufWriter::with_capacity(1 << 16, file));
                idx_paths.push(path);
            }
        }
        Ok(Self {
            scheme,
            hasher: MinimizerHasher::new(scheme.seed),
            writers,
            paths,
            idx_writers,
            idx_paths,
            rid: 0,
            supers: vec![0; scheme.nparts],
            kmers: vec![0; scheme.nparts],
            codes: Vec::new(),
            ranks: Vec::new(),
            window: VecDeque::with_capacity(scheme.mod_len),
            packed: Vec::new(),
        })
    }

    fn process_block(&mut self, block: &Block) -> Result<()> {
        let mut codes = std::mem::take(&mut self.codes);
        for i in 0..block.nreads() {
            block.copy_codes(i, &mut codes);
            self.process_run(&codes)?;
        }
        self.codes = codes;
        Ok(())
    }

    fn process_run(&mut self, codes: &[u8]) -> Result<()> {
        self.rid += 1;
        if self.rid > self.scheme.rmax {
            return Err(FastkError::resource(format!(
                "run index exceeded {} on one thread; input is far larger than the sample suggested",
                self.scheme.rmax
            )));
        }
        let rid = self.rid;
        let k = self.scheme.kmer;
        let m = self.scheme.mmer;
        let nk = codes.len() - k + 1;
        let wspan = k - m;

        // Rank every m-mer of the run up front.
        let mask = self.scheme.mmer_mask();
        let shift = 2 * (m - 1);
        self.ranks.clear();
        let mut fwd = 0u64;
        let mut rc = 0u64;
        for (i, &c) in codes.iter().enumerate() {
            fwd = ((fwd << 2) | c as u64) & mask;
            rc = (rc >> 2) | (((3 - c) as u64) << shift);
            if i + 1 >= m {
                self.ranks.push(self.hasher.canonical_rank(fwd, rc));
            }
        }

        self.window.clear();
        let mut start = 0usize;
        let mut cur_rank = 0u64;
        for p in 0..nk {
            if p == 0 {
                for q in 0..=wspan {
                    self.push_mpos(q);
                }
            } else {
                self.push_mpos(p + wspan);
                while self
                    .window
                    .front()
                    .is_some_and(|&(q, _)| (q as usize) < p)
                {
                    self.window.pop_front();
                }
            }
            let r = self
                .window
                .front()
                .map(|&(_, r)| r)
                .ok_or_else(|| FastkError::invariant("minimizer window empty"))?;
            if p == 0 {
                cur_rank = r;
                continue;
            }
            if r != cur_rank || p - start >= self.scheme.max_super {
                self.emit(rid, start, p, cur_rank, codes)?;
                start = p;
                cur_rank = r;
            }
        }
        self.emit(rid, start, nk, cur_rank, codes)
    }

    // Keep equal ranks: the front stays the leftmost occurrence, and a
    // super-mer continues over a repeated minimizer value.
    fn push_mpos(&mut self, q: usize) {
        let r = self.ranks[q];
        while self.window.back().is_some_and(|&(_, rb)| rb > r) {
            self.window.pop_back();
        }
        self.window.push_back((q as u32, r));
    }

    fn emit(
        &mut self,
        rid: u64,
        start: usize,
        end: usize,
        rank: u64,
        codes: &[u8],
    ) -> Result<()> {
        let slen = end - start;
        if slen == 0 || slen > self.scheme.max_super {
            return Err(FastkError::invariant(format!(
                "super-mer length {slen} out of [1, {}]",
                self.scheme.max_super
            )));
        }
        let nbases = slen + self.scheme.kmer - 1;
        let b = self.scheme.bucket_of(rank);
        pack_codes(&codes[start..start + nbases], &mut self.packed);

        let slen_bytes = self.scheme.slen_bytes;
        let w = &mut self.writers[b];
        w.write_all(&(slen as u64).to_le_bytes()[..slen_bytes])
            .and_then(|_| w.write_all(&self.packed))
            .map_err(|e| FastkError::io(&self.paths[b], "write", e))?;

        if !self.idx_writers.is_empty() {
            let iw = &mut self.idx_writers[b];
            iw.write_all(&rid.to_le_bytes()[..self.scheme.run_bytes])
                .and_then(|_| iw.write_all(&(start as u32).to_le_bytes()))
                .map_err(|e| FastkError::io(&self.idx_paths[b], "write", e))?;
        }

        self.supers[b] += 1;
        self.kmers[b] += slen as u64;
        Ok(())
    }

    fn finish(mut self) -> Result<ThreadStats> {
        for (w, path) in self.writers.iter_mut().zip(&self.paths) {
            w.flush().map_err(|e| FastkError::io(path, "write", e))?;
        }
        for (w, path) in self.idx_writers.iter_mut().zip(&self.idx_paths) {
            w.flush().map_err(|e| FastkError::io(path, "write", e))?;
        }
        Ok(ThreadStats {
            nruns: self.rid,
            supers: self.supers,
            kmers: self.kmers,
        })
    }
}
