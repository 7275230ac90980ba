//! Integration tests for the counting pipeline.
//!
//! These exercise the full pipeline from FASTA input to the final table
//! and profile outputs, checking results against brute-force canonical
//! k-mer counting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use fastk_lib::encoding::decode_string;
use fastk_lib::profile::read_profiles;
use fastk_lib::table::read_table;
use fastk_lib::{run, CountOptions};
use tempfile::TempDir;

fn write_fasta(dir: &Path, name: &str, seqs: &[&str]) -> PathBuf {
    let path = dir.join(name);
    let mut contents = String::new();
    for (i, seq) in seqs.iter().enumerate() {
        contents.push_str(&format!(">read{i}\n{seq}\n"));
    }
    std::fs::write(&path, contents).unwrap();
    path
}

fn opts_for(dir: &Path, source: PathBuf, k: usize) -> CountOptions {
    let mut opts = CountOptions::new(vec![source]);
    opts.kmer = k;
    opts.table_cutoff = Some(1);
    opts.out = Some(dir.join("out"));
    opts.tmp_dir = dir.to_path_buf();
    opts.nthreads = 1;
    opts
}

fn revcomp(s: &str) -> String {
    s.chars()
        .rev()
        .map(|c| match c {
            'A' => 'T',
            'C' => 'G',
            'G' => 'C',
            _ => 'A',
        })
        .collect()
}

fn canonical(s: &str) -> String {
    let rc = revcomp(s);
    if rc.as_str() < s {
        rc
    } else {
        s.to_string()
    }
}

/// Canonical k-mer counts of N-free sequences, the slow way.
fn brute_counts(seqs: &[&str], k: usize) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for seq in seqs {
        if seq.len() < k {
            continue;
        }
        for i in 0..=(seq.len() - k) {
            *counts.entry(canonical(&seq[i..i + k])).or_insert(0) += 1;
        }
    }
    counts
}

fn table_as_map(stub: &Path, k: usize) -> HashMap<String, u32> {
    read_table(stub)
        .unwrap()
        .into_iter()
        .map(|(packed, count)| (decode_string(&packed, k), count as u32))
        .collect()
}

/// Deterministic random DNA (LCG, same across runs).
fn random_reads(n: usize, len: usize, mut state: u64) -> Vec<String> {
    const BASES: [char; 4] = ['A', 'C', 'G', 'T'];
    (0..n)
        .map(|_| {
            (0..len)
                .map(|_| {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                    BASES[((state >> 33) & 3) as usize]
                })
                .collect()
        })
        .collect()
}

#[test]
fn test_single_read_table_and_profile() {
    let tmp = TempDir::new().unwrap();
    let seq = "ACGTACGTAC"; // six 5-mers, some repeating
    let source = write_fasta(tmp.path(), "in.fa", &[seq]);
    let mut opts = opts_for(tmp.path(), source, 5);
    opts.profiles = true;

    let summary = run(&opts).unwrap();
    assert_eq!(summary.nreads, 1);

    let expect = brute_counts(&[seq], 5);
    let got = table_as_map(&summary.table_path.clone().unwrap(), 5);
    assert_eq!(got, expect);

    // Profile: one read, six positions, each the k-mer's global count.
    let profiles = read_profiles(&summary.profile_path.clone().unwrap()).unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].len(), 6);
    for (j, &count) in profiles[0].iter().enumerate() {
        let key = canonical(&seq[j..j + 5]);
        assert_eq!(count as u32, expect[&key], "position {j}");
    }
}

#[test]
fn test_table_entries_are_sorted_and_distinct() {
    let tmp = TempDir::new().unwrap();
    let reads = random_reads(20, 120, 7);
    let refs: Vec<&str> = reads.iter().map(|s| s.as_str()).collect();
    let source = write_fasta(tmp.path(), "in.fa", &refs);
    let opts = opts_for(tmp.path(), source, 9);

    let summary = run(&opts).unwrap();
    let entries = read_table(&summary.table_path.clone().unwrap()).unwrap();
    assert_eq!(entries.len() as u64, summary.table_entries.unwrap());
    for pair in entries.windows(2) {
        assert!(pair[0].0 < pair[1].0, "table keys out of order");
    }
}

#[test]
fn test_compression_drops_short_read() {
    let tmp = TempDir::new().unwrap();
    // AAACCGGGT homopolymer-compresses to ACGT, below k = 5.
    let source = write_fasta(tmp.path(), "in.fa", &["AAACCGGGT"]);
    let mut opts = opts_for(tmp.path(), source, 5);
    opts.compress = true;

    let summary = run(&opts).unwrap();
    assert_eq!(summary.nreads, 0);
    assert_eq!(summary.table_entries, Some(0));
    assert!(table_as_map(&summary.table_path.clone().unwrap(), 5).is_empty());
}

#[test]
fn test_cutoff_filters_singletons() {
    let tmp = TempDir::new().unwrap();
    let seq = "ACGTACGTACGT";
    let source = write_fasta(tmp.path(), "in.fa", &[seq, seq]);
    let mut opts = opts_for(tmp.path(), source, 4);
    opts.table_cutoff = Some(2);

    let summary = run(&opts).unwrap();
    let expect: HashMap<String, u32> = brute_counts(&[seq, seq], 4)
        .into_iter()
        .filter(|&(_, c)| c >= 2)
        .collect();
    assert!(!expect.is_empty());
    let got = table_as_map(&summary.table_path.clone().unwrap(), 4);
    assert_eq!(got, expect);
}

#[test]
fn test_parallel_partitioned_run_matches_serial() {
    let tmp = TempDir::new().unwrap();
    let reads = random_reads(200, 250, 42);
    let refs: Vec<&str> = reads.iter().map(|s| s.as_str()).collect();
    let source = write_fasta(tmp.path(), "in.fa", &refs);

    let serial_dir = tmp.path().join("serial");
    std::fs::create_dir(&serial_dir).unwrap();
    let mut serial = opts_for(&serial_dir, source.clone(), 4);
    serial.out = Some(serial_dir.join("out"));

    let parallel_dir = tmp.path().join("parallel");
    std::fs::create_dir(&parallel_dir).unwrap();
    let mut parallel = opts_for(&parallel_dir, source, 4);
    parallel.out = Some(parallel_dir.join("out"));
    parallel.nthreads = 2;
    // Tiny budget: forces a multi-bucket partition and spill runs.
    parallel.sort_memory = 4096;

    let a = run(&serial).unwrap();
    let b = run(&parallel).unwrap();
    assert_eq!(a.scheme.nparts, 1);
    assert!(b.scheme.nparts >= 4, "nparts = {}", b.scheme.nparts);

    let expect = brute_counts(&refs, 4);
    let got_a = table_as_map(&a.table_path.clone().unwrap(), 4);
    let got_b = table_as_map(&b.table_path.clone().unwrap(), 4);
    assert_eq!(got_a, expect);
    assert_eq!(got_b, expect);
}

#[test]
fn test_embedded_n_splits_profile() {
    let tmp = TempDir::new().unwrap();
    let k = 6;
    let left = "ACGTTGCATCAGGT"; // 14 bases
    let right = "TACCAGATTGACCAG"; // 15 bases
    let read = format!("{left}N{right}");
    let source = write_fasta(tmp.path(), "in.fa", &[&read]);
    let mut opts = opts_for(tmp.path(), source, k);
    opts.profiles = true;

    let summary = run(&opts).unwrap();
    assert_eq!(summary.nreads, 2);

    let profiles = read_profiles(&summary.profile_path.clone().unwrap()).unwrap();
    assert_eq!(profiles.len(), 2);
    let total: usize = profiles.iter().map(|p| p.len()).sum();
    assert_eq!(total, read.len() - 1 - 2 * (k - 1));

    let expect = brute_counts(&[left, right], k);
    for (seq, profile) in [left, right].iter().zip(&profiles) {
        assert_eq!(profile.len(), seq.len() - k + 1);
        for (j, &count) in profile.iter().enumerate() {
            assert_eq!(count as u32, expect[&canonical(&seq[j..j + k])]);
        }
    }
}

#[test]
fn test_barcode_stripped_before_compression() {
    let tmp = TempDir::new().unwrap();
    // Strip GGG first, then AAAATTTGCGC compresses to ATGCGC.
    let source = write_fasta(tmp.path(), "in.fa", &["GGGAAAATTTGCGC"]);
    let mut opts = opts_for(tmp.path(), source, 4);
    opts.compress = true;
    opts.bc_prefix = 3;

    let summary = run(&opts).unwrap();
    let expect = brute_counts(&["ATGCGC"], 4);
    let got = table_as_map(&summary.table_path.clone().unwrap(), 4);
    assert_eq!(got, expect);
}

#[test]
fn test_profiles_agree_with_table_on_random_input() {
    let tmp = TempDir::new().unwrap();
    let reads = random_reads(40, 90, 1234);
    let refs: Vec<&str> = reads.iter().map(|s| s.as_str()).collect();
    let source = write_fasta(tmp.path(), "in.fa", &refs);
    let mut opts = opts_for(tmp.path(), source, 8);
    opts.profiles = true;

    let summary = run(&opts).unwrap();
    let table = table_as_map(&summary.table_path.clone().unwrap(), 8);
    let profiles = read_profiles(&summary.profile_path.clone().unwrap()).unwrap();
    assert_eq!(profiles.len(), refs.len());

    // Single-threaded, so profile order is input order; every entry
    // must equal the k-mer's global table count.
    for (seq, profile) in refs.iter().zip(&profiles) {
        assert_eq!(profile.len(), seq.len() - 8 + 1);
        for (j, &count) in profile.iter().enumerate() {
            assert_eq!(count as u32, table[&canonical(&seq[j..j + 8])]);
        }
    }
}

#[test]
fn test_gzip_input() {
    use std::io::Write as _;
    let tmp = TempDir::new().unwrap();
    let seq = "ACGTACGTACGTACGTACGT";

    // Minimal uncompressed-deflate gzip member, enough for needletail.
    let payload = format!(">r\n{seq}\n").into_bytes();
    let path = tmp.path().join("in.fa.gz");
    {
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&[0x1f, 0x8b, 8, 0, 0, 0, 0, 0, 0, 255]).unwrap();
        let len = payload.len() as u16;
        f.write_all(&[1, (len & 0xff) as u8, (len >> 8) as u8]).unwrap();
        f.write_all(&[(!len & 0xff) as u8, ((!len) >> 8) as u8]).unwrap();
        f.write_all(&payload).unwrap();
        let crc = crc32(&payload);
        f.write_all(&crc.to_le_bytes()).unwrap();
        f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
    }

    let opts = opts_for(tmp.path(), path, 5);
    let summary = run(&opts).unwrap();
    let got = table_as_map(&summary.table_path.clone().unwrap(), 5);
    assert_eq!(got, brute_counts(&[seq], 5));
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &b in data {
        crc ^= b as u32;
        for _ in 0..8 {
            crc = (crc >> 1) ^ (0xedb88320 & (0u32.wrapping_sub(crc & 1)));
        }
    }
    !crc
}
