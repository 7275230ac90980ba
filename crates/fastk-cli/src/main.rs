use anyhow::{bail, Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use fastk_lib::constants::{DEFAULT_KMER, DEFAULT_THREADS};
use fastk_lib::{run, table, CountOptions};

#[derive(Parser)]
#[command(name = "fastk")]
#[command(version = "0.1.0")]
#[command(about = "Disk-based k-mer counter for high-fidelity shotgun reads", long_about = None)]
struct Cli {
    /// K-mer length
    #[arg(short = 'k', value_name = "INT", default_value_t = DEFAULT_KMER)]
    kmer: usize,

    /// Produce a table of sorted k-mers with counts >= the cutoff
    #[arg(short = 't', value_name = "CUTOFF", num_args = 0..=1, default_missing_value = "4")]
    table: Option<u16>,

    /// Produce per-read count profiles (":TABLE.ktab" reserves profiling
    /// against a pre-existing table)
    #[arg(short = 'p', value_name = ":TABLE", num_args = 0..=1, default_missing_value = "")]
    profiles: Option<String>,

    /// Homopolymer-compress every sequence before counting
    #[arg(short = 'c')]
    compress: bool,

    /// Ignore a prefix of each read of the given length (e.g. a bar code)
    #[arg(long = "bc", value_name = "INT", default_value_t = 0)]
    bc_prefix: usize,

    /// Verbose mode, report progress statistics
    #[arg(short = 'v')]
    verbose: bool,

    /// Path for the output directory and root name prefix
    #[arg(short = 'N', value_name = "PATH")]
    out: Option<PathBuf>,

    /// Directory for temporary bucket files
    #[arg(short = 'P', value_name = "DIR", default_value = "/tmp")]
    tmp_dir: PathBuf,

    /// Memory budget for the sorting steps, in GB
    #[arg(short = 'M', value_name = "GB", default_value_t = 12)]
    memory_gb: u64,

    /// Number of worker threads
    #[arg(short = 'T', value_name = "INT", default_value_t = DEFAULT_THREADS)]
    threads: usize,

    /// Input sequence files: FASTA/FASTQ, optionally gzipped
    #[arg(required = true, value_name = "SOURCE")]
    sources: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            e.print().ok();
            std::process::exit(1);
        }
    };

    // Initialize tracing: use RUST_LOG if set, otherwise -v selects info
    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut opts = CountOptions::new(cli.sources);
    opts.kmer = cli.kmer;
    opts.table_cutoff = cli.table.map(|c| c.max(1));
    opts.compress = cli.compress;
    opts.bc_prefix = cli.bc_prefix;
    opts.out = cli.out;
    opts.tmp_dir = cli.tmp_dir;
    opts.sort_memory = cli
        .memory_gb
        .checked_mul(1_000_000_000)
        .context("-M value is out of range")?;
    opts.nthreads = cli.threads;
    if opts.nthreads == 0 {
        bail!("-T thread count must be positive");
    }

    if let Some(target) = &cli.profiles {
        opts.profiles = true;
        let target = target.strip_prefix(':').unwrap_or(target);
        if !target.is_empty() {
            // Reserved surface: validate the stub, then refuse.
            let mut stub = PathBuf::from(target);
            if stub.extension().and_then(|e| e.to_str()) != Some("ktab") {
                stub.set_extension("ktab");
            }
            let (table_k, _shards) = table::read_stub(&stub)
                .with_context(|| format!("cannot read table stub {}", stub.display()))?;
            if table_k != opts.kmer {
                bail!(
                    "-p table k-mer size ({table_k}) != k-mer specified ({})",
                    opts.kmer
                );
            }
            bail!("profiles relative to a pre-existing table are not supported");
        }
    }

    if opts.table_cutoff.is_none() && !opts.profiles {
        bail!("nothing to do: request a table (-t) and/or profiles (-p)");
    }

    let summary = run(&opts)?;

    info!(
        "done: {} reads, {} super-mers, {} distinct {}-mers",
        summary.nreads, summary.nsupers, summary.distinct_kmers, summary.scheme.kmer
    );
    if let (Some(n), Some(path)) = (summary.table_entries, &summary.table_path) {
        info!("table: {} entries in {}", n, path.display());
    }
    if let (Some(n), Some(path)) = (summary.profile_reads, &summary.profile_path) {
        info!("profiles: {} reads in {}", n, path.display());
    }

    Ok(())
}
