//! DFE example client binary
//!
//! Run with: cargo run --bin dfe-client -- --help

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dfe_session::client::{ClientConfig, DfeClient};
use dfe_session::protocol::ANY_ENGINE;
use dfe_session::suite::{run_example, Example, ExampleReport, DEFAULT_SIZE};
use dfe_session::transport::TransportConfig;
use rand::prelude::*;
use serde::Serialize;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "dfe-client")]
#[command(about = "Runs the DFE examples against a remote service and checks the results")]
struct Args {
    /// Service host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Service port
    #[arg(long, default_value = "9090")]
    port: u16,

    /// Number of elements per array
    #[arg(long, default_value_t = DEFAULT_SIZE)]
    size: usize,

    /// Engine selector used when loading an image
    #[arg(long, default_value = ANY_ENGINE)]
    selector: String,

    /// Seed for randomly generated inputs
    #[arg(long)]
    seed: Option<u64>,

    /// Print a JSON report instead of the per-stage listing
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Example to run; all of them when omitted
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Commands {
    /// a + b staged through LMem
    LmemLoopback,
    /// Copy the input through the engine
    PassThrough,
    /// y = x * x + x
    Simple,
    /// Three-point moving average
    MovingAverage,
    /// s = x + y + A, with x staged in LMem
    VectorAddition,
}

impl Commands {
    fn example(self) -> Example {
        match self {
            Commands::LmemLoopback => Example::LMemLoopback,
            Commands::PassThrough => Example::PassThrough,
            Commands::Simple => Example::Simple,
            Commands::MovingAverage => Example::MovingAverage,
            Commands::VectorAddition => Example::VectorAddition,
        }
    }
}

#[derive(Serialize)]
struct ExampleFailure {
    example: Example,
    error: String,
}

#[derive(Serialize)]
struct RunSummary {
    server: String,
    /// Examples requested, including any never started
    planned: usize,
    connect_seconds: f64,
    reports: Vec<ExampleReport>,
    errors: Vec<ExampleFailure>,
}

impl RunSummary {
    /// Examples skipped after the connection was lost
    fn skipped(&self) -> usize {
        self.planned.saturating_sub(self.reports.len() + self.errors.len())
    }

    /// Failed examples; skipped ones count as failed
    fn failed(&self) -> usize {
        self.errors.len() + self.reports.iter().filter(|r| !r.passed()).count() + self.skipped()
    }
}

fn print_report(report: &ExampleReport) {
    println!("== {} (N = {}) ==", report.example, report.size);
    for timing in report.timings.iter() {
        println!(
            "{}:\t{:.6}s",
            timing.stage.label(),
            timing.elapsed.as_secs_f64()
        );
    }
    for mismatch in &report.mismatches {
        eprintln!("{}", mismatch);
    }
    if report.passed() {
        println!("Test passed!");
    } else {
        println!("Test failed {} times!", report.failures);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; stdout is reserved for results
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let examples: Vec<Example> = match args.command {
        Some(command) => vec![command.example()],
        None => Example::ALL.to_vec(),
    };
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let config = ClientConfig {
        transport: TransportConfig {
            host: args.host.clone(),
            port: args.port,
            ..Default::default()
        },
        engine_selector: args.selector.clone(),
    };

    let start = Instant::now();
    let client = DfeClient::connect(config)
        .await
        .with_context(|| format!("Failed to connect to {}:{}", args.host, args.port))?;
    let connect_seconds = start.elapsed().as_secs_f64();
    if !args.json {
        println!("Opening connection:\t{:.6}s", connect_seconds);
    }

    let mut summary = RunSummary {
        server: client.peer(),
        planned: examples.len(),
        connect_seconds,
        reports: Vec::new(),
        errors: Vec::new(),
    };

    for example in examples {
        match run_example(&client, example, args.size, &mut rng).await {
            Ok(report) => {
                if !args.json {
                    print_report(&report);
                }
                summary.reports.push(report);
            }
            Err(e) => {
                eprintln!("{} failed: {}", example, e);
                let connection_lost = e.is_transport();
                summary.errors.push(ExampleFailure {
                    example,
                    error: e.to_string(),
                });
                // Nothing further can reach the service
                if connection_lost {
                    break;
                }
            }
        }
    }

    let start = Instant::now();
    if let Err(e) = client.close().await {
        tracing::warn!("Error closing connection: {}", e);
    }
    if !args.json {
        println!("Closing connection:\t{:.6}s", start.elapsed().as_secs_f64());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    let failed = summary.failed();
    if failed > 0 {
        if summary.skipped() > 0 {
            eprintln!("{} examples skipped after the connection was lost", summary.skipped());
        }
        bail!("{} of {} examples failed", failed, summary.planned);
    }
    Ok(())
}
