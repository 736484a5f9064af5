//! Run a test plan.

use anyhow::{Context, Result};
use perf_harness_core::{HarnessError, RunSummary, TestRunner};
use std::path::PathBuf;

use super::{load_config, load_plan};

/// Arguments of `perf-harness run`.
#[derive(Debug)]
pub struct RunArgs {
    /// Harness config file, if given.
    pub config: Option<PathBuf>,
    /// Test plan file.
    pub plan: PathBuf,
    /// Nodes to provision.
    pub nodes: usize,
    /// Artifact directory override.
    pub output: Option<PathBuf>,
    /// Print the summary as JSON.
    pub json: bool,
}

/// Run the run command.
pub async fn run(args: RunArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(output) = args.output {
        config.output.directory = output;
    }
    let plan = load_plan(&args.plan)?;

    let runner = TestRunner::from_config(&config).context("Invalid harness configuration")?;
    tracing::info!(
        plan = %args.plan.display(),
        nodes = args.nodes,
        infra = ?config.infra.kind,
        "Starting test run"
    );

    match runner.run_test(&plan, args.nodes).await {
        Ok(summary) => print_summary(&summary, args.json),
        Err(e) => {
            report_suppressed(&e);
            Err(e).context("Test run failed")
        }
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("Run {} complete", summary.run_id);
    println!("  Nodes:   {}", summary.node_count);
    println!("  Workers: {}", summary.worker_count);
    println!("  Artifacts:");
    for dir in &summary.artifact_dirs {
        println!("    {}", dir.display());
    }
    Ok(())
}

fn report_suppressed(error: &HarnessError) {
    for suppressed in error.suppressed() {
        tracing::warn!(error = %suppressed, "Release also failed");
    }
}
