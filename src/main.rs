use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use polycall::context::Context;
use polycall::fm_index::FmIndex;
use polycall::genome::Genome;
use polycall::params::{CallOpt, SearchMode};
use polycall::{caller, reads, utils};

#[derive(Parser)]
#[command(name = "polycall")]
#[command(about = "polycall - short-read variant caller over a multi-genome", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the FM-index of the reverse multi-genome
    Index {
        /// Reference multi-genome (FASTA or raw sequence, may be gzipped)
        #[arg(short = 'g', long, value_name = "FILE")]
        genome: PathBuf,

        /// Output index directory
        #[arg(short = 'i', long, value_name = "DIR")]
        index_dir: PathBuf,

        /// Verbose level: 1=error, 2=warning, 3=message, 4+=debugging
        #[arg(short = 'v', long, value_name = "INT", default_value = "3")]
        verbosity: i32,
    },

    /// Align paired reads and call variants
    Call {
        /// Reference multi-genome (FASTA or raw sequence, may be gzipped)
        #[arg(short = 'g', long, value_name = "FILE")]
        genome: PathBuf,

        /// Variant catalogue: POS<TAB>ALLELE:FREQ[,ALLELE:FREQ...] per line
        #[arg(short = 's', long, value_name = "FILE")]
        variants: PathBuf,

        /// Index directory built by the `index` subcommand
        #[arg(short = 'i', long, value_name = "DIR")]
        index_dir: PathBuf,

        /// First-end FASTQ file
        #[arg(short = '1', long, value_name = "FILE")]
        reads1: PathBuf,

        /// Second-end FASTQ file
        #[arg(short = '2', long, value_name = "FILE")]
        reads2: PathBuf,

        /// Output file for variant calls
        #[arg(short = 'o', long, value_name = "FILE")]
        output: PathBuf,

        /// Seed search mode: 1=random, 2=deterministic
        #[arg(short = 'm', long, value_name = "INT", default_value = "1")]
        search_mode: u8,

        /// Starting anchor position on reads
        #[arg(short = 'p', long, value_name = "INT", default_value = "0")]
        start_pos: usize,

        /// Anchor step in deterministic mode
        #[arg(short = 'j', long, value_name = "INT", default_value = "5")]
        search_step: usize,

        /// Upper bound on worker threads (0 = no bound)
        #[arg(short = 'w', long, value_name = "INT", default_value = "0")]
        max_procs: usize,

        /// Number of extender workers (default: all available cores)
        #[arg(short = 't', long, value_name = "INT")]
        workers: Option<usize>,

        /// Skip seeds with more than INT candidate positions
        #[arg(short = 'n', long, value_name = "INT", default_value = "1024")]
        max_match: usize,

        /// Distance threshold override (default: derived from the rates)
        #[arg(short = 'd', long, value_name = "INT")]
        dist_thres: Option<usize>,

        /// Iteration count override (default: derived from the threshold)
        #[arg(short = 'r', long, value_name = "INT")]
        iter_num: Option<usize>,

        /// Expected per-base sequencing error rate
        #[arg(long, value_name = "FLOAT", default_value = "0.001")]
        err_rate: f64,

        /// Expected per-base mutation rate
        #[arg(long, value_name = "FLOAT", default_value = "0.001")]
        mut_rate: f64,

        /// Seed for the anchor PRNG (for reproducible runs)
        #[arg(long, value_name = "INT")]
        seed: Option<u64>,

        /// Verbose level: 1=error, 2=warning, 3=message, 4+=debugging
        #[arg(short = 'v', long, value_name = "INT", default_value = "3")]
        verbosity: i32,
    },
}

fn init_logger(verbosity: i32) {
    let log_level = match verbosity {
        v if v <= 1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Index {
            genome,
            index_dir,
            verbosity,
        } => {
            init_logger(verbosity);
            let started = utils::realtime();

            let genome = match Genome::load(&genome.to_string_lossy()) {
                Ok(g) => g,
                Err(e) => {
                    log::error!("loading reference failed: {}", e);
                    std::process::exit(1);
                }
            };
            let index = match FmIndex::build(&genome.reversed()) {
                Ok(idx) => idx,
                Err(e) => {
                    log::error!("index construction failed: {}", e);
                    std::process::exit(1);
                }
            };
            if let Err(e) = index.save(&index_dir) {
                log::error!("writing index to {} failed: {}", index_dir.display(), e);
                std::process::exit(1);
            }
            utils::log_mem("index built");
            log::info!(
                "indexed {} bases in {:.2} s",
                genome.len(),
                utils::realtime() - started
            );
        }

        Commands::Call {
            genome,
            variants,
            index_dir,
            reads1,
            reads2,
            output,
            search_mode,
            start_pos,
            search_step,
            max_procs,
            workers,
            max_match,
            dist_thres,
            iter_num,
            err_rate,
            mut_rate,
            seed,
            verbosity,
        } => {
            init_logger(verbosity);
            let started = utils::realtime();

            let reads1 = reads1.to_string_lossy().to_string();
            let reads2 = reads2.to_string_lossy().to_string();

            // the scratch matrices are sized from the first record
            let read_len = match reads::probe_read_len(&reads1) {
                Ok(Some(len)) => len,
                Ok(None) => {
                    log::error!("{}: no reads", reads1);
                    std::process::exit(1);
                }
                Err(e) => {
                    log::error!("{}: {}", reads1, e);
                    std::process::exit(1);
                }
            };

            let mut opt = CallOpt {
                read_len,
                err_rate,
                mut_rate,
                max_match,
                start_pos,
                search_step,
                rng_seed: seed,
                ..CallOpt::default()
            };
            opt.search_mode = match search_mode {
                1 => SearchMode::Random,
                2 => SearchMode::Deterministic,
                other => {
                    log::error!("unknown search mode {} (use 1 or 2)", other);
                    std::process::exit(1);
                }
            };
            let mut n_workers = workers.unwrap_or_else(num_cpus::get).max(1);
            if max_procs > 0 && n_workers > max_procs {
                log::warn!("capping {} workers at --max-procs {}", n_workers, max_procs);
                n_workers = max_procs;
            }
            opt.workers = n_workers;
            opt.derive_thresholds(dist_thres, iter_num);

            let ctx = match Context::load(
                &genome.to_string_lossy(),
                &variants.to_string_lossy(),
                &index_dir,
                opt,
            ) {
                Ok(ctx) => Arc::new(ctx),
                Err(e) => {
                    log::error!("initialisation failed: {}", e);
                    std::process::exit(1);
                }
            };

            match caller::call_variants(ctx, &reads1, &reads2, &output.to_string_lossy()) {
                Ok(stats) => {
                    log::info!(
                        "done: {} read pairs, {} with calls, {:.2} s",
                        stats.pairs,
                        stats.pairs_with_calls,
                        utils::realtime() - started
                    );
                }
                Err(e) => {
                    log::error!("variant calling failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}
