//! Bucket sorter: the two-stage super-mer / weighted k-mer sort.
//!
//! Stage 1 loads every thread's super-mer records for one bucket as
//! fixed-width `SMER_WORD` records (packed bases zero-padded, length
//! appended big-endian so raw byte order equals (bases, length) order),
//! sorts them, and folds identical records into weighted super-mers. At
//! low error rates identical super-mers recur across coverage, so the
//! fold shrinks stage 2 by roughly the coverage factor.
//!
//! Stage 2 expands each weighted super-mer into its canonical k-mers
//! carrying the weight, sorts the fixed-width `TMER_WORD` records, and
//! folds equal k-mers by saturating addition into the bucket's table
//! file. Both stages run through [`RunSorter`], so a bucket that
//! overflows `SORT_MEMORY` spills sorted runs and merges them with
//! identical folding semantics.
//!
//! The profile branch then re-reads the bucket's super-mer stream in
//! original order and derives each instance's count vector from the
//! memory-mapped bucket table.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::thread;

use memmap2::Mmap;
use tracing::info;

use crate::encoding::{pack_canonical, packed_len, unpack_codes};
use crate::error::{FastkError, Result};
use crate::pipeline::TempLayout;
use crate::profile::{encode_counts, read_full};
use crate::runsort::RunSorter;
use crate::scheme::Scheme;

/// Tallies from the sort phase.
#[derive(Debug, Default, Clone, Copy)]
pub struct SortStats {
    /// Distinct canonical k-mers across all bucket tables.
    pub distinct_kmers: u64,
    /// Weighted super-mers that survived stage 1 folding.
    pub weighted_supers: u64,
}

/// Sort every bucket, parallelized across worker threads. Each worker
/// owns its buckets exclusively.
pub fn sort_phase(
    scheme: &Scheme,
    layout: &TempLayout,
    nthreads: usize,
    sort_memory: u64,
    profiles: bool,
) -> Result<SortStats> {
    let nworkers = nthreads.min(scheme.nparts).max(1);
    let per_worker: Vec<SortStats> = thread::scope(|s| {
        let mut handles = Vec::with_capacity(nworkers);
        for w in 0..nworkers {
            handles.push(s.spawn(move || -> Result<SortStats> {
                let mut stats = SortStats::default();
                let mut b = w;
                while b < scheme.nparts {
                    let (distinct, weighted) =
                        sort_bucket(scheme, layout, b, nthreads, sort_memory, profiles)?;
                    stats.distinct_kmers += distinct;
                    stats.weighted_supers += weighted;
                    b += nworkers;
                }
                Ok(stats)
            }));
        }
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .map_err(|_| FastkError::invariant("sort worker panicked"))?
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut total = SortStats::default();
    for st in per_worker {
        total.distinct_kmers += st.distinct_kmers;
        total.weighted_supers += st.weighted_supers;
    }
    info!(
        "sorted {} buckets: {} weighted super-mers, {} distinct k-mers",
        scheme.nparts, total.weighted_supers, total.distinct_kmers
    );
    Ok(total)
}

fn sort_bucket(
    scheme: &Scheme,
    layout: &TempLayout,
    b: usize,
    nthreads: usize,
    sort_memory: u64,
    profiles: bool,
) -> Result<(u64, u64)> {
    let k = scheme.kmer;

    // Stage 1: gather this bucket's super-mers from every thread file.
    let mut sorter = RunSorter::new(
        layout.dir(),
        layout.sort_tag(b, "smer"),
        scheme.smer_word,
        sort_memory,
    );
    let mut rec = vec![0u8; scheme.smer_word];
    for t in 0..nthreads {
        let path = layout.smer(t, b);
        let file = File::open(&path).map_err(|e| FastkError::io(&path, "open", e))?;
        let mut r = BufReader::with_capacity(1 << 20, file);
        let mut lenbuf = [0u8; 8];
        loop {
            match read_full(&mut r, &mut lenbuf[..scheme.slen_bytes]) {
                Ok(false) => break,
                Ok(true) => {}
                Err(e) => return Err(FastkError::io(&path, "read", e)),
            }
            let mut slen = 0u64;
            for (i, &byte) in lenbuf[..scheme.slen_bytes].iter().enumerate() {
                slen |= (byte as u64) << (8 * i);
            }
            if slen == 0 || slen > scheme.max_super as u64 {
                return Err(FastkError::invariant(format!(
                    "super-mer length {slen} out of [1, {}] in {}",
                    scheme.max_super,
                    path.display()
                )));
            }
            let nbases = slen as usize + k - 1;
            let nbytes = packed_len(nbases);
            rec.fill(0);
            match read_full(&mut r, &mut rec[..nbytes]) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(FastkError::invariant(format!(
                        "truncated super-mer record in {}",
                        path.display()
                    )))
                }
                Err(e) => return Err(FastkError::io(&path, "read", e)),
            }
            let be = slen.to_be_bytes();
            rec[scheme.smer_bytes..].copy_from_slice(&be[8 - scheme.slen_bytes..]);
            sorter.push(&rec)?;
        }
    }
    let mut stream = sorter.finish()?;

    // Fold identical super-mers, expanding each survivor into weighted
    // canonical k-mers as it completes.
    let mut ksorter = RunSorter::new(
        layout.dir(),
        layout.sort_tag(b, "kmer"),
        scheme.tmer_word,
        sort_memory,
    );
    let mut codes: Vec<u8> = Vec::new();
    let mut kpack = vec![0u8; scheme.kmer_bytes];
    let mut krec = vec![0u8; scheme.tmer_word];
    let mut prev = vec![0u8; scheme.smer_word];
    let mut have = false;
    let mut mult = 0u64;
    let mut weighted = 0u64;
    while let Some(r) = stream.next() {
        if have && prev[..] == *r {
            mult += 1;
            continue;
        }
        if have {
            weighted += 1;
            expand(scheme, &prev, mult, &mut codes, &mut kpack, &mut krec, &mut ksorter)?;
        }
        prev.copy_from_slice(r);
        have = true;
        mult = 1;
    }
    if have {
        weighted += 1;
        expand(scheme, &prev, mult, &mut codes, &mut kpack, &mut krec, &mut ksorter)?;
    }
    drop(stream);

    // Stage 2 fold: equal k-mers sum saturating into the bucket table.
    let table_path = layout.bucket_table(b);
    let mut distinct = 0u64;
    {
        let file =
            File::create(&table_path).map_err(|e| FastkError::io(&table_path, "create", e))?;
        let mut w = BufWriter::with_capacity(1 << 20, file);
        let mut kstream = ksorter.finish()?;
        let mut cur = vec![0u8; scheme.kmer_bytes];
        let mut have = false;
        let mut count = 0u64;
        while let Some(r) = kstream.next() {
            let (key, cb) = r.split_at(scheme.kmer_bytes);
            let c = u16::from_le_bytes([cb[0], cb[1]]) as u64;
            if have && cur[..] == *key {
                count += c;
                continue;
            }
            if have {
                write_entry(&mut w, &table_path, &cur, count)?;
                distinct += 1;
            }
            cur.copy_from_slice(key);
            have = true;
            count = c;
        }
        if have {
            write_entry(&mut w, &table_path, &cur, count)?;
            distinct += 1;
        }
        w.flush()
            .map_err(|e| FastkError::io(&table_path, "write", e))?;
    }

    if profiles {
        build_profiles(scheme, layout, b, nthreads, &table_path)?;
    }

    // The split-phase inputs for this bucket are consumed.
    for t in 0..nthreads {
        let path = layout.smer(t, b);
        fs::remove_file(&path).map_err(|e| FastkError::io(&path, "unlink", e))?;
        if profiles {
            let path = layout.sidx(t, b);
            fs::remove_file(&path).map_err(|e| FastkError::io(&path, "unlink", e))?;
        }
    }

    Ok((distinct, weighted))
}

fn write_entry(
    w: &mut impl Write,
    path: &std::path::Path,
    key: &[u8],
    count: u64,
) -> Result<()> {
    let count = count.min(u16::MAX as u64) as u16;
    w.write_all(key)
        .and_then(|_| w.write_all(&count.to_le_bytes()))
        .map_err(|e| FastkError::io(path, "write", e))
}

fn expand(
    scheme: &Scheme,
    srec: &[u8],
    mult: u64,
    codes: &mut Vec<u8>,
    kpack: &mut [u8],
    krec: &mut [u8],
    ksorter: &mut RunSorter,
) -> Result<()> {
    let k = scheme.kmer;
    let mut slen = 0usize;
    for &byte in &srec[scheme.smer_bytes..] {
        slen = (slen << 8) | byte as usize;
    }
    let nbases = slen + k - 1;
    unpack_codes(srec, nbases, codes);
    let weight = mult.min(u16::MAX as u64) as u16;
    for j in 0..slen {
        pack_canonical(&codes[j..j + k], kpack);
        krec[..scheme.kmer_bytes].copy_from_slice(kpack);
        krec[scheme.kmer_bytes..].copy_from_slice(&weight.to_le_bytes());
        ksorter.push(krec)?;
    }
    Ok(())
}

fn build_profiles(
    scheme: &Scheme,
    layout: &TempLayout,
    b: usize,
    nthreads: usize,
    table_path: &std::path::Path,
) -> Result<()> {
    let file = File::open(table_path).map_err(|e| FastkError::io(table_path, "open", e))?;
    let table_len = file
        .metadata()
        .map_err(|e| FastkError::io(table_path, "stat", e))?
        .len();
    let mmap = if table_len > 0 {
        Some(unsafe { Mmap::map(&file) }.map_err(|e| FastkError::io(table_path, "mmap", e))?)
    } else {
        None
    };

    let k = scheme.kmer;
    let head_len = scheme.run_bytes + 4;
    let max_plen = (1u64 << (8 * scheme.plen_bytes)) - 1;
    let mut codes: Vec<u8> = Vec::new();
    let mut kpack = vec![0u8; scheme.kmer_bytes];
    let mut pbuf = vec![0u8; scheme.smer_bytes];
    let mut counts: Vec<u16> = Vec::new();
    let mut payload: Vec<u8> = Vec::new();
    let mut lenbuf = [0u8; 8];
    let mut idxbuf = [0u8; 24];

    for t in 0..nthreads {
        let spath = layout.smer(t, b);
        let ipath = layout.sidx(t, b);
        let opath = layout.frag(t, b);
        let mut sr = BufReader::with_capacity(
            1 << 20,
            File::open(&spath).map_err(|e| FastkError::io(&spath, "open", e))?,
        );
        let mut ir = BufReader::with_capacity(
            1 << 16,
            File::open(&ipath).map_err(|e| FastkError::io(&ipath, "open", e))?,
        );
        let mut out = BufWriter::with_capacity(
            1 << 16,
            File::create(&opath).map_err(|e| FastkError::io(&opath, "create", e))?,
        );

        loop {
            match read_full(&mut sr, &mut lenbuf[..scheme.slen_bytes]) {
                Ok(false) => break,
                Ok(true) => {}
                Err(e) => return Err(FastkError::io(&spath, "read", e)),
            }
            let mut slen = 0usize;
            for (i, &byte) in lenbuf[..scheme.slen_bytes].iter().enumerate() {
                slen |= (byte as usize) << (8 * i);
            }
            let nbases = slen + k - 1;
            let nbytes = packed_len(nbases);
            match read_full(&mut sr, &mut pbuf[..nbytes]) {
                Ok(true) => {}
                _ => {
                    return Err(FastkError::invariant(format!(
                        "truncated super-mer record in {}",
                        spath.display()
                    )))
                }
            }
            match read_full(&mut ir, &mut idxbuf[..head_len]) {
                Ok(true) => {}
                _ => {
                    return Err(FastkError::invariant(format!(
                        "run index file out of sync with {}",
                        spath.display()
                    )))
                }
            }

            unpack_codes(&pbuf, nbases, &mut codes);
            counts.clear();
            for j in 0..slen {
                pack_canonical(&codes[j..j + k], &mut kpack);
                let table = mmap
                    .as_deref()
                    .ok_or_else(|| FastkError::invariant("super-mers but empty bucket table"))?;
                let count = lookup_count(table, scheme.tmer_word, scheme.kmer_bytes, &kpack)
                    .ok_or_else(|| {
                        FastkError::invariant("k-mer missing from its own bucket table")
                    })?;
                counts.push(count);
            }
            encode_counts(&counts, &mut payload);
            if payload.len() as u64 > max_plen {
                return Err(FastkError::invariant(format!(
                    "profile fragment of {} bytes exceeds the length prefix",
                    payload.len()
                )));
            }
            let plen = (payload.len() as u64).to_le_bytes();
            out.write_all(&idxbuf[..head_len])
                .and_then(|_| out.write_all(&plen[..scheme.plen_bytes]))
                .and_then(|_| out.write_all(&payload))
                .map_err(|e| FastkError::io(&opath, "write", e))?;
        }
        out.flush().map_err(|e| FastkError::io(&opath, "write", e))?;
    }
    Ok(())
}

/// Binary search a sorted table of fixed-width records for a packed
/// canonical k-mer; returns its count.
fn lookup_count(table: &[u8], tmer_word: usize, kmer_bytes: usize, key: &[u8]) -> Option<u16> {
    let n = table.len() / tmer_word;
    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let rec = &table[mid * tmer_word..mid * tmer_word + kmer_bytes];
        match rec.cmp(key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => {
                let off = mid * tmer_word + kmer_bytes;
                return Some(u16::from_le_bytes([table[off], table[off + 1]]));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_count() {
        // Records of 4 bytes each: 2-byte key + u16 count.
        let mut table = Vec::new();
        for (key, count) in [([0x10u8, 0x00], 3u16), ([0x4c, 0x00], 7), ([0xf0, 0x40], 1)] {
            table.extend_from_slice(&key);
            table.extend_from_slice(&count.to_le_bytes());
        }
        assert_eq!(lookup_count(&table, 4, 2, &[0x10, 0x00]), Some(3));
        assert_eq!(lookup_count(&table, 4, 2, &[0x4c, 0x00]), Some(7));
        assert_eq!(lookup_count(&table, 4, 2, &[0xf0, 0x40]), Some(1));
        assert_eq!(lookup_count(&table, 4, 2, &[0x00, 0x01]), None);
        assert_eq!(lookup_count(&table, 4, 2, &[0xff, 0xff]), None);
        assert_eq!(lookup_count(&[], 4, 2, &[0x00, 0x00]), None);
    }
}
