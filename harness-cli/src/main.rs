//! # perf-harness
//!
//! Run distributed performance test plans.
//!
//! ## Commands
//!
//! - `run`: Provision nodes, run a plan, collect artifacts
//! - `validate`: Check a plan without provisioning anything
//!
//! ## Example
//!
//! ```bash
//! # Check the plan
//! perf-harness validate --plan kv-put.toml
//!
//! # Run it on three local nodes
//! perf-harness run --plan kv-put.toml --nodes 3
//!
//! # Run it on SSH hosts from harness.toml, results in ./results
//! perf-harness --config harness.toml run --plan kv-put.toml --nodes 3 --output results
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{run, validate};

/// Run distributed performance test plans.
#[derive(Parser, Debug)]
#[command(name = "perf-harness")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Harness configuration file (default: ./harness.toml if present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision nodes, run a test plan and collect node output
    Run {
        /// Test plan (TOML)
        #[arg(long, short)]
        plan: PathBuf,

        /// Number of nodes to provision
        #[arg(long, short)]
        nodes: usize,

        /// Local artifact directory (overrides the config file)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a test plan without running it
    Validate {
        /// Test plan (TOML)
        #[arg(long, short)]
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// `RUST_LOG` directives when set and valid, `info` otherwise.
fn log_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run {
            plan,
            nodes,
            output,
            json,
        } => {
            run::run(run::RunArgs {
                config: cli.config,
                plan,
                nodes,
                output,
                json,
            })
            .await
        }
        Commands::Validate { plan } => validate::run(&plan),
    }
}
