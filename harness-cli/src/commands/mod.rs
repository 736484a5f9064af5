//! CLI command implementations.

pub mod run;
pub mod validate;

use anyhow::{Context, Result};
use perf_harness_core::{HarnessConfig, TestPlan};
use std::path::{Path, PathBuf};

/// Config file picked up from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "harness.toml";

/// Load harness configuration.
///
/// An explicit path must exist. Without one, `./harness.toml` is used if
/// present and built-in defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    let path: PathBuf = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !default.exists() {
                tracing::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                return Ok(HarnessConfig::default());
            }
            default
        }
    };

    HarnessConfig::from_file(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

/// Load a test plan.
pub fn load_plan(path: &Path) -> Result<TestPlan> {
    TestPlan::from_file(path).with_context(|| format!("Failed to load plan from {}", path.display()))
}
