//! Phase orchestration: sample, select scheme, split, sort, merge.
//!
//! The phases run strictly in order with a full join between them; the
//! first worker error aborts the run. The developer [`Stage`] values
//! stop the pipeline after an intermediate phase with temporaries left
//! on disk; they exist for tests and are never produced by the CLI.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::constants::{
    DEFAULT_KMER, DEFAULT_SEED, DEFAULT_SORT_MEMORY, DEFAULT_THREADS, SAMPLE_BASES,
};
use crate::error::{FastkError, Result};
use crate::input::{Input, ReadPrep};
use crate::profile;
use crate::scheme::{ensure_fd_limit, Scheme, SchemeParams};
use crate::sorter;
use crate::splitter;
use crate::table;

/// Naming of every temporary file of one run. The tag embeds the
/// output root and the process id so concurrent runs in one temp
/// directory cannot collide.
pub struct TempLayout {
    dir: PathBuf,
    tag: String,
}

impl TempLayout {
    /// Layout rooted at `dir` for the given output root.
    pub fn new(dir: &Path, root: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            tag: format!("{root}.{}", std::process::id()),
        }
    }

    /// The temp directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Super-mer bucket file of one splitter thread.
    pub fn smer(&self, t: usize, b: usize) -> PathBuf {
        self.dir.join(format!("{}.T{t}.B{b}.smer", self.tag))
    }

    /// Run-index file parallel to [`TempLayout::smer`].
    pub fn sidx(&self, t: usize, b: usize) -> PathBuf {
        self.dir.join(format!("{}.T{t}.B{b}.sidx", self.tag))
    }

    /// Profile fragment file of one thread x bucket pair.
    pub fn frag(&self, t: usize, b: usize) -> PathBuf {
        self.dir.join(format!("{}.T{t}.B{b}.prof", self.tag))
    }

    /// Per-thread scratch file for assembling a profile shard.
    pub fn prof_data(&self, t: usize) -> PathBuf {
        self.dir.join(format!("{}.T{t}.pdata", self.tag))
    }

    /// Sorted k-mer table of one bucket.
    pub fn bucket_table(&self, b: usize) -> PathBuf {
        self.dir.join(format!("{}.B{b}.ktab", self.tag))
    }

    /// Unique prefix for a bucket's spill runs.
    pub fn sort_tag(&self, b: usize, stage: &str) -> String {
        format!("{}.B{b}.{stage}", self.tag)
    }

    /// Best-effort removal of every temporary this run may have left.
    pub fn cleanup(&self, nparts: usize, nthreads: usize) {
        for b in 0..nparts {
            let _ = fs::remove_file(self.bucket_table(b));
            for t in 0..nthreads {
                let _ = fs::remove_file(self.smer(t, b));
                let _ = fs::remove_file(self.sidx(t, b));
                let _ = fs::remove_file(self.frag(t, b));
            }
        }
        for t in 0..nthreads {
            let _ = fs::remove_file(self.prof_data(t));
        }
    }
}

/// Everything a counting run needs to know; mirrors the CLI surface.
#[derive(Debug, Clone)]
pub struct CountOptions {
    /// K-mer length.
    pub kmer: usize,
    /// Write a table of k-mers with count at least this cutoff.
    pub table_cutoff: Option<u16>,
    /// Write per-read count profiles.
    pub profiles: bool,
    /// Homopolymer-compress every sequence before extraction.
    pub compress: bool,
    /// Bases ignored at the start of every read.
    pub bc_prefix: usize,
    /// Output directory and root override (`-N`).
    pub out: Option<PathBuf>,
    /// Directory for temporary files.
    pub tmp_dir: PathBuf,
    /// Sort-memory budget in bytes.
    pub sort_memory: u64,
    /// Worker thread count.
    pub nthreads: usize,
    /// Minimizer hash seed.
    pub seed: u64,
    /// Input sequence files.
    pub sources: Vec<PathBuf>,
}

impl CountOptions {
    /// Defaults matching the CLI, counting the given sources.
    pub fn new(sources: Vec<PathBuf>) -> Self {
        Self {
            kmer: DEFAULT_KMER,
            table_cutoff: None,
            profiles: false,
            compress: false,
            bc_prefix: 0,
            out: None,
            tmp_dir: std::env::temp_dir(),
            sort_memory: DEFAULT_SORT_MEMORY,
            nthreads: DEFAULT_THREADS,
            seed: DEFAULT_SEED,
            sources,
        }
    }
}

/// How far to take the pipeline. Only tests use anything but
/// [`Stage::RunAll`]; intermediate stages leave temporaries on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// All phases plus temp cleanup.
    RunAll,
    /// Stop after the split phase.
    Split,
    /// Stop after the bucket sorts.
    Sort,
    /// Stop after the table merge.
    MergeTable,
    /// Stop after the profile merge.
    MergeProfile,
}

/// What a finished run produced.
#[derive(Debug)]
pub struct CountSummary {
    /// The scheme the run used.
    pub scheme: Scheme,
    /// Accepted runs (reads after splitting).
    pub nreads: u64,
    /// Super-mers distributed into buckets.
    pub nsupers: u64,
    /// Distinct canonical k-mers across all buckets, before the cutoff.
    pub distinct_kmers: u64,
    /// Entries written to the final table, when one was requested.
    pub table_entries: Option<u64>,
    /// Path of the table stub, when one was written.
    pub table_path: Option<PathBuf>,
    /// Reads written to the profile output, when requested.
    pub profile_reads: Option<u64>,
    /// Path of the profile stub, when one was written.
    pub profile_path: Option<PathBuf>,
}

/// Run the full pipeline.
pub fn run(opts: &CountOptions) -> Result<CountSummary> {
    run_stage(opts, Stage::RunAll)
}

/// Run the pipeline up to `stage`.
pub fn run_stage(opts: &CountOptions, stage: Stage) -> Result<CountSummary> {
    let meta = fs::metadata(&opts.tmp_dir)
        .map_err(|e| FastkError::io(&opts.tmp_dir, "open", e))?;
    if !meta.is_dir() {
        return Err(FastkError::config(format!(
            "temp path {} is not a directory",
            opts.tmp_dir.display()
        )));
    }

    let (out_dir, root) = output_root(opts)?;

    let input = Input::open(
        &opts.sources,
        ReadPrep {
            kmer: opts.kmer,
            bc_prefix: opts.bc_prefix,
            compress: opts.compress,
        },
    )?;

    info!(
        "determining minimizer scheme and partition for {root} ({}{}-mers)",
        if opts.compress { "hoco-" } else { "" },
        opts.kmer
    );
    let (block, ratio) = input.first_block(SAMPLE_BASES)?;
    let scheme = Scheme::determine(
        &block,
        ratio,
        &SchemeParams {
            kmer: opts.kmer,
            sort_memory: opts.sort_memory,
            nthreads: opts.nthreads,
            seed: opts.seed,
        },
    )?;
    drop(block);
    ensure_fd_limit(scheme.nparts, opts.nthreads)?;

    let layout = TempLayout::new(&opts.tmp_dir, &root);
    let split = splitter::split_phase(&input, &scheme, &layout, opts.nthreads, opts.profiles)?;
    let mut summary = CountSummary {
        nreads: split.total_runs(),
        nsupers: split.total_supers(),
        distinct_kmers: 0,
        table_entries: None,
        table_path: None,
        profile_reads: None,
        profile_path: None,
        scheme: scheme.clone(),
    };
    if stage == Stage::Split {
        return Ok(summary);
    }

    let sort = sorter::sort_phase(
        &scheme,
        &layout,
        opts.nthreads,
        opts.sort_memory,
        opts.profiles,
    )?;
    summary.distinct_kmers = sort.distinct_kmers;
    if stage == Stage::Sort {
        return Ok(summary);
    }

    if let Some(cutoff) = opts.table_cutoff {
        let entries = table::merge_tables(
            &scheme,
            &layout,
            &out_dir,
            &root,
            opts.nthreads,
            cutoff,
        )?;
        summary.table_entries = Some(entries);
        summary.table_path = Some(out_dir.join(format!("{root}.ktab")));
    }
    if stage == Stage::MergeTable {
        return Ok(summary);
    }

    if opts.profiles {
        let reads = profile::merge_profiles(
            &scheme,
            &layout,
            &out_dir,
            &root,
            opts.nthreads,
            &split.nruns,
        )?;
        summary.profile_reads = Some(reads);
        summary.profile_path = Some(out_dir.join(format!("{root}.prof")));
    }
    if stage == Stage::MergeProfile {
        return Ok(summary);
    }

    layout.cleanup(scheme.nparts, opts.nthreads);
    Ok(summary)
}

/// Resolve the output directory and root name: the `-N` override when
/// given, otherwise the first source's stem in the current directory.
fn output_root(opts: &CountOptions) -> Result<(PathBuf, String)> {
    if let Some(out) = &opts.out {
        let root = out
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                FastkError::config(format!("output name {} has no root", out.display()))
            })?
            .to_string();
        let dir = match out.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        return Ok((dir, root));
    }
    let first = opts
        .sources
        .first()
        .ok_or_else(|| FastkError::config("no input sources given"))?;
    let name = first
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            FastkError::config(format!("source name {} is not valid UTF-8", first.display()))
        })?;
    Ok((PathBuf::from("."), strip_seq_extensions(name).to_string()))
}

fn strip_seq_extensions(name: &str) -> &str {
    let name = name.strip_suffix(".gz").unwrap_or(name);
    for ext in [".fa", ".fasta", ".fq", ".fastq"] {
        if let Some(stripped) = name.strip_suffix(ext) {
            return stripped;
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_seq_extensions() {
        assert_eq!(strip_seq_extensions("reads.fa"), "reads");
        assert_eq!(strip_seq_extensions("reads.fastq.gz"), "reads");
        assert_eq!(strip_seq_extensions("reads.bin"), "reads.bin");
        assert_eq!(strip_seq_extensions("reads"), "reads");
    }

    #[test]
    fn test_output_root_override() {
        let mut opts = CountOptions::new(vec![PathBuf::from("data/reads.fq.gz")]);
        let (dir, root) = output_root(&opts).unwrap();
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(root, "reads");

        opts.out = Some(PathBuf::from("/results/sample1"));
        let (dir, root) = output_root(&opts).unwrap();
        assert_eq!(dir, PathBuf::from("/results"));
        assert_eq!(root, "sample1");
    }

    #[test]
    fn test_temp_layout_names_are_disjoint() {
        let layout = TempLayout::new(Path::new("/tmp"), "x");
        let names = [
            layout.smer(0, 1),
            layout.smer(1, 0),
            layout.sidx(0, 1),
            layout.frag(0, 1),
            layout.bucket_table(1),
            layout.prof_data(0),
        ];
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                assert_ne!(a, b);
            }
        }
        // Tag embeds the pid for collision-free concurrent runs.
        let pid = std::process::id().to_string();
        assert!(layout.smer(0, 0).to_str().is_some_and(|s| s.contains(&pid)));
    }

    #[test]
    fn test_missing_tmp_dir_is_an_error() {
        let mut opts = CountOptions::new(vec![PathBuf::from("x.fa")]);
        opts.tmp_dir = PathBuf::from("/no/such/dir");
        assert!(run(&opts).is_err());
    }
}
