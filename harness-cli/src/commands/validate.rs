//! Check a test plan without provisioning anything.

use anyhow::{Context, Result};
use perf_harness_core::{PerformanceTest, Phase, TestConfig};
use std::path::Path;

use super::load_plan;

/// Run the validate command.
pub fn run(plan_path: &Path) -> Result<()> {
    let plan = load_plan(plan_path)?;
    let config = check(&plan)?;

    println!("Plan: {}", plan.name.as_deref().unwrap_or("(unnamed)"));
    println!("  Workers: {}", config.worker_count());
    for (role, count) in config.roles() {
        println!("    {role}: {count}");
    }
    for phase in Phase::ALL {
        println!("  {}: {} step(s)", phase, config.steps(phase).len());
    }
    println!("OK");
    Ok(())
}

/// Configure `test` on a fresh config and validate it.
fn check(test: &dyn PerformanceTest) -> Result<TestConfig> {
    let mut config = TestConfig::new();
    test.configure(&mut config);
    config.validate().context("Plan is invalid")?;
    Ok(config)
}
