//! Global k-mer table: N-way bucket merge and the `.ktab` output.
//!
//! Bucket tables are sorted and pairwise disjoint, so the merge only
//! orders records, it never sums across buckets; an equal key in two
//! buckets is a bug. Output shards split the leading-byte prefix space
//! into `nthreads` equal ranges so downstream consumers can process
//! shards independently.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{FastkError, Result};
use crate::pipeline::TempLayout;
use crate::profile::read_full;
use crate::scheme::Scheme;

struct BucketCursor {
    reader: BufReader<File>,
    path: PathBuf,
    rec: Vec<u8>,
    done: bool,
}

impl BucketCursor {
    fn open(path: PathBuf, tmer_word: usize) -> Result<Self> {
        let file = File::open(&path).map_err(|e| FastkError::io(&path, "open", e))?;
        let mut cursor = Self {
            reader: BufReader::with_capacity(1 << 20, file),
            path,
            rec: vec![0u8; tmer_word],
            done: false,
        };
        cursor.advance()?;
        Ok(cursor)
    }

    fn advance(&mut self) -> Result<()> {
        match read_full(&mut self.reader, &mut self.rec) {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.done = true;
                Ok(())
            }
            Err(e) => Err(FastkError::io(&self.path, "read", e)),
        }
    }
}

/// First-byte boundary of output shard `i` of `nthreads`.
fn shard_bound(i: usize, nthreads: usize) -> usize {
    i * 256 / nthreads
}

/// Merge all bucket tables into the final table, dropping entries with
/// count below `cutoff`. Returns the number of entries written.
pub fn merge_tables(
    scheme: &Scheme,
    layout: &TempLayout,
    out_dir: &Path,
    root: &str,
    nthreads: usize,
    cutoff: u16,
) -> Result<u64> {
    let kmer_bytes = scheme.kmer_bytes;
    let mut cursors = Vec::with_capacity(scheme.nparts);
    for b in 0..scheme.nparts {
        cursors.push(BucketCursor::open(layout.bucket_table(b), scheme.tmer_word)?);
    }

    let mut heap = BinaryHeap::new();
    for (b, c) in cursors.iter().enumerate() {
        if !c.done {
            heap.push(Reverse((c.rec[..kmer_bytes].to_vec(), b)));
        }
    }

    let mut shards = Vec::with_capacity(nthreads);
    let mut shard_paths = Vec::with_capacity(nthreads);
    let mut shard_counts = vec![0i64; nthreads];
    for i in 1..=nthreads {
        let path = out_dir.join(format!(".{root}.ktab.{i}"));
        let file = File::create(&path).map_err(|e| FastkError::io(&path, "create", e))?;
        let mut w = BufWriter::with_capacity(1 << 20, file);
        w.write_all(&0i64.to_le_bytes())
            .map_err(|e| FastkError::io(&path, "write", e))?;
        shards.push(w);
        shard_paths.push(path);
    }

    let mut cur_shard = 0usize;
    let mut prev_key: Option<Vec<u8>> = None;
    let mut total = 0u64;
    while let Some(Reverse((key, b))) = heap.pop() {
        if prev_key.as_deref() == Some(&key[..]) {
            return Err(FastkError::invariant(
                "equal k-mer in two buckets; the minimizer partition is not disjoint",
            ));
        }
        let count = u16::from_le_bytes([cursors[b].rec[kmer_bytes], cursors[b].rec[kmer_bytes + 1]]);
        if count >= cutoff {
            let fb = key[0] as usize;
            while cur_shard + 1 < nthreads && fb >= shard_bound(cur_shard + 1, nthreads) {
                cur_shard += 1;
            }
            let w = &mut shards[cur_shard];
            w.write_all(&key)
                .and_then(|_| w.write_all(&count.to_le_bytes()))
                .map_err(|e| FastkError::io(&shard_paths[cur_shard], "write", e))?;
            shard_counts[cur_shard] += 1;
            total += 1;
        }
        prev_key = Some(key);

        cursors[b].advance()?;
        if !cursors[b].done {
            heap.push(Reverse((cursors[b].rec[..kmer_bytes].to_vec(), b)));
        }
    }

    // Patch each shard's entry count into its header.
    for (i, w) in shards.into_iter().enumerate() {
        let path = &shard_paths[i];
        let mut file = w
            .into_inner()
            .map_err(|e| FastkError::io(path, "write", e.into_error()))?;
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&shard_counts[i].to_le_bytes()))
            .map_err(|e| FastkError::io(path, "write", e))?;
    }

    let stub_path = out_dir.join(format!("{root}.ktab"));
    let mut stub = BufWriter::new(
        File::create(&stub_path).map_err(|e| FastkError::io(&stub_path, "create", e))?,
    );
    stub.write_all(&(scheme.kmer as i32).to_le_bytes())
        .and_then(|_| stub.write_all(&(nthreads as i32).to_le_bytes()))
        .and_then(|_| stub.flush())
        .map_err(|e| FastkError::io(&stub_path, "write", e))?;

    info!(
        "wrote {} k-mers with count >= {} to {}",
        total,
        cutoff,
        stub_path.display()
    );
    Ok(total)
}

/// Read `{ i32 kmer, i32 nthreads }` from a `.ktab` stub.
pub fn read_stub(stub_path: &Path) -> Result<(usize, usize)> {
    let mut stub = File::open(stub_path).map_err(|e| FastkError::io(stub_path, "open", e))?;
    let mut head = [0u8; 8];
    stub.read_exact(&mut head)
        .map_err(|e| FastkError::io(stub_path, "read", e))?;
    let kmer = i32::from_le_bytes(head[..4].try_into().unwrap_or_default());
    let nthreads = i32::from_le_bytes(head[4..].try_into().unwrap_or_default());
    if kmer <= 0 || nthreads <= 0 {
        return Err(FastkError::config(format!(
            "{} is not a k-mer table stub",
            stub_path.display()
        )));
    }
    Ok((kmer as usize, nthreads as usize))
}

/// Load an entire table (packed canonical k-mer, count) from its stub,
/// shards concatenated in order. Intended for tests and small tables.
pub fn read_table(stub_path: &Path) -> Result<Vec<(Vec<u8>, u16)>> {
    let (kmer, nthreads) = read_stub(stub_path)?;
    let kmer_bytes = (2 * kmer + 7) >> 3;

    let dir = stub_path.parent().unwrap_or(Path::new("."));
    let name = stub_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FastkError::config("table stub has no file name"))?;

    let mut entries = Vec::new();
    for i in 1..=nthreads {
        let shard_path = dir.join(format!(".{name}.{i}"));
        let file = File::open(&shard_path).map_err(|e| FastkError::io(&shard_path, "open", e))?;
        let mut r = BufReader::with_capacity(1 << 20, file);
        let mut head = [0u8; 8];
        r.read_exact(&mut head)
            .map_err(|e| FastkError::io(&shard_path, "read", e))?;
        let n = i64::from_le_bytes(head) as usize;
        let mut rec = vec![0u8; kmer_bytes + 2];
        for _ in 0..n {
            r.read_exact(&mut rec)
                .map_err(|e| FastkError::io(&shard_path, "read", e))?;
            let count = u16::from_le_bytes([rec[kmer_bytes], rec[kmer_bytes + 1]]);
            entries.push((rec[..kmer_bytes].to_vec(), count));
        }
    }
    Ok(entries)
}
