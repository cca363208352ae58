//! jobherd CLI entry point.
//!
//! Usage:
//!   jobherd [-v] [-i inputfile] [--pace ms] jobfile

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use jobherd::parser::load_jobs;
use jobherd::{Config, InputStream, JobSpec, JobTable, SignalBridge, Supervisor};

const USAGE_EXIT: u8 = 1;
const JOBFILE_EXIT: u8 = 2;
const INPUTFILE_EXIT: u8 = 3;

#[derive(Parser)]
#[command(name = "jobherd")]
#[command(about = "Run and supervise a fixed set of worker commands", long_about = None)]
struct Cli {
    /// Report worker registration, spawns, restarts and EOFs.
    #[arg(short = 'v')]
    verbose: bool,

    /// Read input lines from this file instead of stdin.
    #[arg(short = 'i', value_name = "INPUTFILE")]
    input: Option<PathBuf>,

    /// Output collection window per cycle, in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    pace: u64,

    /// One `restarts:input:output:command` entry per line.
    jobfile: PathBuf,
}

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(USAGE_EXIT)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let input = match &cli.input {
        Some(path) => match File::open(path) {
            Ok(file) => InputStream::new(file),
            Err(_) => {
                eprintln!("Error: Unable to read input file");
                return ExitCode::from(INPUTFILE_EXIT);
            }
        },
        None => match InputStream::stdin() {
            Ok(input) => input,
            Err(e) => {
                eprintln!("Error: {e:?}");
                return ExitCode::FAILURE;
            }
        },
    };

    let loaded = File::open(&cli.jobfile).and_then(|f| load_jobs(BufReader::new(f), cli.verbose));
    let specs = match loaded {
        Ok(specs) => specs,
        Err(_) => {
            eprintln!("Error: Unable to read job file");
            return ExitCode::from(JOBFILE_EXIT);
        }
    };

    match run(&cli, specs, input) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, specs: Vec<JobSpec>, input: InputStream) -> Result<ExitCode> {
    let config = Config {
        verbose: cli.verbose,
        pace: Duration::from_millis(cli.pace),
        ..Config::default()
    };

    let jobs = JobTable::from_specs(specs, config.verbose);
    let bridge = SignalBridge::install().context("installing signal handlers")?;

    Supervisor::new(jobs, input, bridge, config).run();
    Ok(ExitCode::SUCCESS)
}
