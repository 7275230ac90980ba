//! RAM-bounded sorting of fixed-width byte records.
//!
//! Both stages of the bucket sort funnel their records through a
//! [`RunSorter`]: records accumulate in a flat buffer; when the memory
//! budget fills, the buffer is sorted in parallel and flushed to a temp
//! run file; [`RunSorter::finish`] hands back a [`SortedStream`] that
//! either walks the single in-memory buffer or performs a linear-scan
//! k-way merge over the memory-mapped runs. Runs are `SORT_MEMORY`
//! sized, so the fan-in stays small and a linear scan beats a tree.
//!
//! Records compare as raw bytes; callers lay their fields out so that
//! byte order equals the order they need.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use rayon::prelude::*;
use tracing::debug;

use crate::error::{FastkError, Result};

/// Sorter for records of one fixed width.
pub struct RunSorter {
    dir: PathBuf,
    tag: String,
    rec: usize,
    budget_recs: usize,
    buf: Vec<u8>,
    runs: Vec<PathBuf>,
}

impl RunSorter {
    /// Create a sorter writing spill runs to `dir` under names derived
    /// from `tag` (which must be unique per concurrent sorter).
    pub fn new(dir: &Path, tag: String, rec: usize, budget_bytes: u64) -> Self {
        // Half the budget: the sort gathers into a second buffer.
        let budget_recs = ((budget_bytes / 2) as usize / rec)
            .max(64)
            .min(u32::MAX as usize);
        Self {
            dir: dir.to_path_buf(),
            tag,
            rec,
            budget_recs,
            buf: Vec::new(),
            runs: Vec::new(),
        }
    }

    /// Append one record, spilling a sorted run first if the buffer is
    /// at its budget.
    pub fn push(&mut self, record: &[u8]) -> Result<()> {
        debug_assert_eq!(record.len(), self.rec);
        if self.buf.len() / self.rec >= self.budget_recs {
            self.flush_run()?;
        }
        self.buf.extend_from_slice(record);
        Ok(())
    }

    fn run_path(&self, id: usize) -> PathBuf {
        self.dir.join(format!("{}.run{}", self.tag, id))
    }

    fn sort_buf(rec: usize, buf: &[u8]) -> Vec<u8> {
        let n = buf.len() / rec;
        let mut order: Vec<u32> = (0..n as u32).collect();
        order.par_sort_unstable_by(|&a, &b| {
            let a = &buf[a as usize * rec..(a as usize + 1) * rec];
            let b = &buf[b as usize * rec..(b as usize + 1) * rec];
            a.cmp(b)
        });
        let mut sorted = Vec::with_capacity(buf.len());
        for &i in &order {
            sorted.extend_from_slice(&buf[i as usize * rec..(i as usize + 1) * rec]);
        }
        sorted
    }

    fn flush_run(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let sorted = Self::sort_buf(self.rec, &self.buf);
        let path = self.run_path(self.runs.len());
        let file = File::create(&path).map_err(|e| FastkError::io(&path, "create", e))?;
        let mut w = BufWriter::with_capacity(1 << 20, file);
        w.write_all(&sorted)
            .map_err(|e| FastkError::io(&path, "write", e))?;
        w.flush().map_err(|e| FastkError::io(&path, "write", e))?;
        debug!(
            "spilled run {} ({} records of {} bytes)",
            path.display(),
            sorted.len() / self.rec,
            self.rec
        );
        self.runs.push(path);
        self.buf.clear();
        Ok(())
    }

    /// Sort whatever remains and return the merged, ordered stream.
    pub fn finish(mut self) -> Result<SortedStream> {
        if self.runs.is_empty() {
            let sorted = Self::sort_buf(self.rec, &self.buf);
            return Ok(SortedStream {
                rec: self.rec,
                inner: Inner::Mem {
                    buf: sorted,
                    pos: 0,
                },
            });
        }
        self.flush_run()?;
        let mut mmaps = Vec::with_capacity(self.runs.len());
        for path in &self.runs {
            let file = File::open(path).map_err(|e| FastkError::io(path, "open", e))?;
            let mmap =
                unsafe { Mmap::map(&file) }.map_err(|e| FastkError::io(path, "mmap", e))?;
            mmaps.push(mmap);
        }
        let pos = vec![0; mmaps.len()];
        Ok(SortedStream {
            rec: self.rec,
            inner: Inner::Runs {
                paths: std::mem::take(&mut self.runs),
                mmaps,
                pos,
            },
        })
    }
}

impl Drop for RunSorter {
    fn drop(&mut self) {
        for path in &self.runs {
            let _ = fs::remove_file(path);
        }
    }
}

enum Inner {
    Mem {
        buf: Vec<u8>,
        pos: usize,
    },
    Runs {
        paths: Vec<PathBuf>,
        mmaps: Vec<Mmap>,
        pos: Vec<usize>,
    },
}

/// Ordered stream of fixed-width records out of a finished sorter.
pub struct SortedStream {
    rec: usize,
    inner: Inner,
}

impl SortedStream {
    /// Next record in ascending byte order, or `None` at the end.
    pub fn next(&mut self) -> Option<&[u8]> {
        let rec = self.rec;
        match &mut self.inner {
            Inner::Mem { buf, pos } => {
                if *pos >= buf.len() {
                    return None;
                }
                let r = &buf[*pos..*pos + rec];
                *pos += rec;
                Some(r)
            }
            Inner::Runs { mmaps, pos, .. } => {
                let mut min: Option<usize> = None;
                for i in 0..mmaps.len() {
                    if pos[i] >= mmaps[i].len() {
                        continue;
                    }
                    let cand = &mmaps[i][pos[i]..pos[i] + rec];
                    min = match min {
                        None => Some(i),
                        Some(j) if cand < &mmaps[j][pos[j]..pos[j] + rec] => Some(i),
                        keep => keep,
                    };
                }
                let i = min?;
                let p = pos[i];
                pos[i] += rec;
                Some(&mmaps[i][p..p + rec])
            }
        }
    }
}

impl Drop for SortedStream {
    fn drop(&mut self) {
        if let Inner::Runs { paths, .. } = &self.inner {
            for path in paths {
                let _ = fs::remove_file(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn drain(mut s: SortedStream) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(r) = s.next() {
            out.push(r.to_vec());
        }
        out
    }

    fn records(n: usize) -> Vec<[u8; 8]> {
        // Deterministic LCG shuffle of record contents.
        let mut state: u64 = 0xdeadbeef;
        (0..n)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                state.to_be_bytes()
            })
            .collect()
    }

    #[test]
    fn test_in_memory_sort() {
        let tmp = TempDir::new().unwrap();
        let mut sorter = RunSorter::new(tmp.path(), "mem".into(), 8, 1 << 30);
        let recs = records(500);
        for r in &recs {
            sorter.push(r).unwrap();
        }
        let out = drain(sorter.finish().unwrap());
        assert_eq!(out.len(), 500);
        assert!(out.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_spilled_equals_in_memory() {
        let tmp = TempDir::new().unwrap();
        let recs = records(5000);

        let mut big = RunSorter::new(tmp.path(), "big".into(), 8, 1 << 30);
        for r in &recs {
            big.push(r).unwrap();
        }
        let expect = drain(big.finish().unwrap());

        // Budget so small every few thousand records spill a run.
        let mut small = RunSorter::new(tmp.path(), "small".into(), 8, 1);
        for r in &recs {
            small.push(r).unwrap();
        }
        let got = drain(small.finish().unwrap());

        assert_eq!(expect, got);
    }

    #[test]
    fn test_run_files_removed() {
        let tmp = TempDir::new().unwrap();
        let mut sorter = RunSorter::new(tmp.path(), "rm".into(), 8, 1);
        for r in records(4000) {
            sorter.push(&r).unwrap();
        }
        let stream = sorter.finish().unwrap();
        drop(stream);
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_duplicates_stay_adjacent() {
        let tmp = TempDir::new().unwrap();
        let mut sorter = RunSorter::new(tmp.path(), "dup".into(), 4, 1);
        for i in 0..3000u32 {
            sorter.push(&(i % 7).to_be_bytes()).unwrap();
        }
        let out = drain(sorter.finish().unwrap());
        assert_eq!(out.len(), 3000);
        // Equal records form one contiguous group each.
        let mut seen = std::collections::HashSet::new();
        let mut prev: Option<Vec<u8>> = None;
        for r in out {
            if prev.as_deref() != Some(&r[..]) {
                assert!(seen.insert(r.clone()), "group for {r:?} split");
                prev = Some(r);
            }
        }
    }
}
