//! Input partition: presents reads as blocks of packed 2-bit bases.
//!
//! Sequences come from FASTA/FASTQ files (gzip handled transparently by
//! needletail). Before a read enters a block it is prepared: reads
//! shorter than `KMER + bc_prefix` are silently skipped, the barcode
//! prefix is stripped, homopolymer runs are collapsed when requested,
//! and non-ACGT characters split the remainder into runs; runs shorter
//! than `KMER` are dropped. Each surviving run is one block entry and
//! will receive one run index downstream.
//!
//! The scheme selector consumes a single sampling block read through a
//! byte-counting reader, which also yields the expansion `ratio` used to
//! project the sample onto the full data set. The split phase then
//! re-opens the sources and streams bounded blocks.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use needletail::parser::FastxReader;
use needletail::{parse_fastx_file, parse_fastx_reader};
use tracing::debug;

use crate::constants::BLOCK_BASES;
use crate::encoding::{base_code, packed_len};
use crate::error::{FastkError, Result};

/// Read preparation applied to every input sequence.
#[derive(Debug, Clone)]
pub struct ReadPrep {
    /// K-mer length; runs shorter than this are dropped.
    pub kmer: usize,
    /// Bases ignored at the start of every read (e.g. a bar code).
    pub bc_prefix: usize,
    /// Collapse homopolymer runs before k-mer extraction.
    pub compress: bool,
}

/// A block of prepared runs, bases packed two bits each.
///
/// Every run starts on a byte boundary so it can be handed out as a
/// plain sub-slice of the packed buffer.
#[derive(Debug, Default)]
pub struct Block {
    packed: Vec<u8>,
    runs: Vec<(usize, usize)>, // (byte offset, length in bases)
    totlen: u64,
}

impl Block {
    fn new() -> Self {
        Self::default()
    }

    /// Number of runs in the block.
    pub fn nreads(&self) -> usize {
        self.runs.len()
    }

    /// Total bases over all runs.
    pub fn totlen(&self) -> u64 {
        self.totlen
    }

    /// True when the block holds no runs.
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Length in bases of run `i`.
    pub fn run_len(&self, i: usize) -> usize {
        self.runs[i].1
    }

    pub(crate) fn push_run(&mut self, codes: &[u8]) {
        let off = self.packed.len();
        self.packed.resize(off + packed_len(codes.len()), 0);
        for (i, &c) in codes.iter().enumerate() {
            self.packed[off + (i >> 2)] |= (c & 0b11) << (6 - 2 * (i & 3));
        }
        self.runs.push((off, codes.len()));
        self.totlen += codes.len() as u64;
    }

    /// Decode run `i` into 2-bit codes (cleared first).
    pub fn copy_codes(&self, i: usize, out: &mut Vec<u8>) {
        let (off, len) = self.runs[i];
        out.clear();
        out.reserve(len);
        for j in 0..len {
            out.push((self.packed[off + (j >> 2)] >> (6 - 2 * (j & 3))) & 0b11);
        }
    }
}

/// Prepare one raw read: skip, strip, compress, split. Returns the
/// surviving runs as 2-bit code sequences.
pub(crate) fn prepare_read(seq: &[u8], prep: &ReadPrep) -> Vec<Vec<u8>> {
    if seq.len() < prep.kmer + prep.bc_prefix {
        return Vec::new();
    }
    let body = &seq[prep.bc_prefix..];
    let mut runs = Vec::new();
    let mut cur: Vec<u8> = Vec::new();
    for &b in body {
        match base_code(b) {
            Some(c) => {
                if !(prep.compress && cur.last() == Some(&c)) {
                    cur.push(c);
                }
            }
            None => {
                if cur.len() >= prep.kmer {
                    runs.push(std::mem::take(&mut cur));
                } else {
                    cur.clear();
                }
            }
        }
    }
    if cur.len() >= prep.kmer {
        runs.push(cur);
    }
    runs
}

/// The set of input sources plus the preparation applied to each read.
#[derive(Debug)]
pub struct Input {
    sources: Vec<PathBuf>,
    prep: ReadPrep,
}

impl Input {
    /// Open a set of sequence files. Fails early when a source is
    /// missing or unreadable.
    pub fn open<P: AsRef<Path>>(sources: &[P], prep: ReadPrep) -> Result<Self> {
        if sources.is_empty() {
            return Err(FastkError::config("no input sources given"));
        }
        let sources: Vec<PathBuf> = sources.iter().map(|p| p.as_ref().to_path_buf()).collect();
        for src in &sources {
            fs::metadata(src).map_err(|e| FastkError::io(src, "open", e))?;
        }
        Ok(Self { sources, prep })
    }

    /// The read preparation in effect.
    pub fn prep(&self) -> &ReadPrep {
        &self.prep
    }

    /// Read up to `budget_bases` of prepared sequence into a single
    /// sampling block. Returns the block and the expansion ratio
    /// (total source bytes over source bytes consumed, 1.0 when the
    /// sample covered everything).
    pub fn first_block(&self, budget_bases: u64) -> Result<(Block, f64)> {
        let mut total_bytes = 0u64;
        for src in &self.sources {
            total_bytes += fs::metadata(src)
                .map_err(|e| FastkError::io(src, "stat", e))?
                .len();
        }

        let mut block = Block::new();
        let mut consumed = 0u64;
        let mut exhausted = true;

        'outer: for src in &self.sources {
            let counter = Arc::new(AtomicU64::new(0));
            let file = File::open(src).map_err(|e| FastkError::io(src, "open", e))?;
            let reader = CountingReader {
                inner: file,
                count: Arc::clone(&counter),
            };
            let mut rdr = parse_fastx_reader(reader)
                .map_err(|e| FastkError::input(format!("{}: {}", src.display(), e)))?;
            while let Some(rec) = rdr.next() {
                let rec =
                    rec.map_err(|e| FastkError::input(format!("{}: {}", src.display(), e)))?;
                for run in prepare_read(&rec.seq(), &self.prep) {
                    block.push_run(&run);
                }
                if block.totlen >= budget_bases {
                    consumed += counter.load(Ordering::Relaxed);
                    exhausted = false;
                    break 'outer;
                }
            }
            consumed += counter.load(Ordering::Relaxed);
        }

        let ratio = if exhausted || consumed == 0 {
            1.0
        } else {
            (total_bytes as f64 / consumed as f64).max(1.0)
        };
        debug!(
            "sampled {} runs / {} bases, ratio {:.2}",
            block.nreads(),
            block.totlen(),
            ratio
        );
        Ok((block, ratio))
    }

    /// Stream the sources as bounded blocks, from the beginning.
    pub fn blocks(&self) -> BlockReader {
        BlockReader {
            sources: self.sources.clone(),
            prep: self.prep.clone(),
            idx: 0,
            cur: None,
        }
    }
}

/// Lazy block iterator over all sources. Splitter threads share one of
/// these behind a mutex and pull blocks as they go.
pub struct BlockReader {
    sources: Vec<PathBuf>,
    prep: ReadPrep,
    idx: usize,
    cur: Option<Box<dyn FastxReader>>,
}

impl BlockReader {
    /// Next block, or `None` when all sources are drained.
    pub fn next_block(&mut self) -> Result<Option<Block>> {
        let mut block = Block::new();
        loop {
            let Some(rdr) = self.cur.as_mut() else {
                if self.idx >= self.sources.len() {
                    break;
                }
                let src = &self.sources[self.idx];
                let rdr = parse_fastx_file(src)
                    .map_err(|e| FastkError::input(format!("{}: {}", src.display(), e)))?;
                self.cur = Some(rdr);
                continue;
            };
            match rdr.next() {
                Some(rec) => {
                    let src = &self.sources[self.idx];
                    let rec =
                        rec.map_err(|e| FastkError::input(format!("{}: {}", src.display(), e)))?;
                    for run in prepare_read(&rec.seq(), &self.prep) {
                        block.push_run(&run);
                    }
                    if block.totlen >= BLOCK_BASES {
                        return Ok(Some(block));
                    }
                }
                None => {
                    self.cur = None;
                    self.idx += 1;
                }
            }
        }
        if block.is_empty() {
            Ok(None)
        } else {
            Ok(Some(block))
        }
    }
}

/// Read adapter that counts bytes pulled from the underlying source.
struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::decode_base;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn run_str(codes: &[u8]) -> String {
        codes.iter().map(|&c| decode_base(c) as char).collect()
    }

    fn prep(kmer: usize, bc_prefix: usize, compress: bool) -> ReadPrep {
        ReadPrep {
            kmer,
            bc_prefix,
            compress,
        }
    }

    #[test]
    fn test_prepare_short_read_skipped() {
        assert!(prepare_read(b"ACGT", &prep(5, 0, false)).is_empty());
        // Long enough without the prefix, too short with it.
        assert!(prepare_read(b"ACGTA", &prep(5, 2, false)).is_empty());
    }

    #[test]
    fn test_prepare_splits_on_n() {
        let runs = prepare_read(b"ACGTACNTTGCAA", &prep(4, 0, false));
        assert_eq!(runs.len(), 2);
        assert_eq!(run_str(&runs[0]), "ACGTAC");
        assert_eq!(run_str(&runs[1]), "TTGCAA");
    }

    #[test]
    fn test_prepare_drops_short_runs() {
        // Second run has 3 < 4 bases and is dropped.
        let runs = prepare_read(b"ACGTACNTTG", &prep(4, 0, false));
        assert_eq!(runs.len(), 1);
        assert_eq!(run_str(&runs[0]), "ACGTAC");
    }

    #[test]
    fn test_prepare_bc_before_compression() {
        // Prefix "GGG" is stripped first, then AAAA collapses to A.
        let runs = prepare_read(b"GGGAAAATTTGCGC", &prep(4, 3, true));
        assert_eq!(runs.len(), 1);
        assert_eq!(run_str(&runs[0]), "ATGCGC");
    }

    #[test]
    fn test_prepare_compression_can_drop_read() {
        // AAACCGGGT compresses to ACGT (4 bases), below k = 5.
        assert!(prepare_read(b"AAACCGGGT", &prep(5, 0, true)).is_empty());
    }

    #[test]
    fn test_block_pack_roundtrip() {
        let mut block = Block::new();
        let runs = prepare_read(b"ACGTACGTAC", &prep(5, 0, false));
        for run in &runs {
            block.push_run(run);
        }
        assert_eq!(block.nreads(), 1);
        assert_eq!(block.totlen(), 10);
        let mut codes = Vec::new();
        block.copy_codes(0, &mut codes);
        assert_eq!(run_str(&codes), "ACGTACGTAC");
    }

    #[test]
    fn test_blocks_from_fasta() -> std::io::Result<()> {
        let mut f = NamedTempFile::new()?;
        writeln!(f, ">r1\nACGTACGTAC\n>r2\nTTTTGGGGCCCCAAAA")?;
        f.flush()?;

        let input = Input::open(&[f.path()], prep(5, 0, false)).unwrap();
        let mut reader = input.blocks();
        let block = reader.next_block().unwrap().unwrap();
        assert_eq!(block.nreads(), 2);
        assert_eq!(block.totlen(), 26);
        assert!(reader.next_block().unwrap().is_none());
        Ok(())
    }

    #[test]
    fn test_first_block_ratio_exhausted() -> std::io::Result<()> {
        let mut f = NamedTempFile::new()?;
        writeln!(f, ">r1\nACGTACGTACGTACGT")?;
        f.flush()?;

        let input = Input::open(&[f.path()], prep(5, 0, false)).unwrap();
        let (block, ratio) = input.first_block(1_000_000).unwrap();
        assert_eq!(block.nreads(), 1);
        assert_eq!(ratio, 1.0);
        Ok(())
    }

    #[test]
    fn test_open_missing_source() {
        let err = Input::open(&["/no/such/file.fa"], prep(5, 0, false)).unwrap_err();
        assert!(err.to_string().contains("/no/such/file.fa"));
    }
}
