// ========================================================================================
//
//                           The strategic orchestrator: grist
//
// ========================================================================================
//
// This binary is orchestration only. It parses arguments, builds an engine
// over the requested store, and hands every real decision to the library. No
// statistics live here.

#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Parser, Subcommand, ValueEnum};
use grist::aggregate::Statistic;
use grist::api::{Engine, size_of};
use grist::io::TextFormat;
use grist::types::{DType, Partition};
use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

// ========================================================================================
//                              Command-line interface definition
// ========================================================================================

#[derive(Parser, Debug)]
#[clap(
    name = "grist",
    version,
    about = "An out-of-core engine for chunked aggregation and incremental regression."
)]
struct Args {
    /// Spool backing storage to files under this directory instead of RAM.
    #[clap(long, global = true)]
    spool: Option<PathBuf>,

    /// Field delimiter is a tab instead of a comma.
    #[clap(long, global = true)]
    tsv: bool,

    /// Split work into exactly this many chunks.
    #[clap(long, global = true, conflicts_with = "chunk_size")]
    chunks: Option<usize>,

    /// Split work into chunks of this many rows.
    #[clap(long, global = true)]
    chunk_size: Option<usize>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute one statistic over a column of a delimited text file.
    Aggregate {
        /// Path to the input file.
        input: PathBuf,

        /// Zero-based column index.
        #[clap(long, default_value_t = 0)]
        column: usize,

        /// The statistic to compute.
        #[clap(long, value_enum)]
        stat: StatArg,

        /// Bin count for the approximate median.
        #[clap(long, default_value_t = 256)]
        bins: usize,
    },
    /// Fit a linear model without materializing the design matrix.
    Fit {
        /// Path to the input file.
        input: PathBuf,

        /// Zero-based response column index.
        #[clap(long)]
        response: usize,

        /// Zero-based predictor column indices.
        #[clap(long, value_delimiter = ',', required = true)]
        predictors: Vec<usize>,

        /// Ridge penalty on the coefficient block (0 = ordinary least squares).
        #[clap(long, default_value_t = 0.0)]
        ridge: f64,
    },
    /// Import a file and report its shape and quantized storage size.
    Info {
        /// Path to the input file.
        input: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StatArg {
    Mean,
    Variance,
    MedianExact,
    MedianApprox,
}

fn main() {
    env_logger::init();
    if let Err(e) = run(Args::parse()) {
        eprintln!("grist: error: {e}");
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let engine = match &args.spool {
        Some(dir) => Engine::spooled(dir.clone())?,
        None => Engine::in_memory(),
    };
    let format = if args.tsv {
        TextFormat::tsv()
    } else {
        TextFormat::csv()
    };
    let partition = match (args.chunks, args.chunk_size) {
        (Some(n), _) => Partition::ByCount(n),
        (None, Some(s)) => Partition::BySize(s),
        (None, None) => Partition::ByCount(num_cpus::get().max(1) * 4),
    };

    let started = Instant::now();
    match args.command {
        Command::Aggregate {
            input,
            column,
            stat,
            bins,
        } => {
            let container = engine.open(&input, format, DType::F64)?;
            let statistic = match stat {
                StatArg::Mean => Statistic::Mean,
                StatArg::Variance => Statistic::Variance,
                StatArg::MedianExact => Statistic::MedianExact,
                StatArg::MedianApprox => Statistic::MedianApprox { bins },
            };
            let value = engine.aggregate(&container, column, statistic, partition)?;
            println!("{value}");
        }
        Command::Fit {
            input,
            response,
            predictors,
            ridge,
        } => {
            let container = engine.open(&input, format, DType::F64)?;
            let fit =
                engine.fit_linear_model(&container, response, &predictors, partition, ridge)?;
            println!("observations: {}", fit.observations);
            println!("intercept: {}", fit.coefficients[0]);
            for (p, coef) in predictors.iter().zip(&fit.coefficients[1..]) {
                println!("column {p}: {coef}");
            }
            println!("rss: {}", fit.rss);
        }
        Command::Info { input } => {
            let container = engine.open(&input, format, DType::F64)?;
            println!("shape: {}", container.shape());
            println!("dtype: {}", container.dtype());
            println!("quantized bytes: {}", size_of([&container]));
        }
    }
    log::info!("done in {:.2?}", started.elapsed());
    Ok(())
}
