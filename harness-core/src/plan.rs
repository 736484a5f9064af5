//! Test plans: performance tests written as TOML instead of Rust.
//!
//! ```toml
//! name = "kv-put"
//!
//! [roles]
//! server = 1
//! client = 2
//!
//! [[setup]]
//! name = "start-server"
//! command = "./server --daemon --log $PERF_OUTPUT_DIR/server.log"
//! roles = ["server"]
//!
//! [[workload]]
//! command = "./bench put --duration 60 > $PERF_OUTPUT_DIR/put.txt"
//! roles = ["client"]
//!
//! [[teardown]]
//! command = "pkill -f ./server"
//! roles = ["server"]
//! ```
//!
//! Every step becomes a [`CommandTask`].

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::ConfigError;
use crate::definition::{PerformanceTest, Phase, TestConfig, TestStep};
use crate::task::CommandTask;

/// A performance test loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestPlan {
    /// Optional human-readable name.
    #[serde(default)]
    pub name: Option<String>,
    /// Role name to worker count.
    #[serde(default)]
    pub roles: BTreeMap<String, usize>,
    /// Setup steps.
    #[serde(default)]
    pub setup: Vec<PlanStep>,
    /// Workload steps.
    #[serde(default)]
    pub workload: Vec<PlanStep>,
    /// Teardown steps.
    #[serde(default)]
    pub teardown: Vec<PlanStep>,
}

/// One shell command run on the workers of the listed roles.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanStep {
    /// Name shown in logs (default: the command).
    #[serde(default)]
    pub name: Option<String>,
    /// Shell command, run in the node's working directory.
    pub command: String,
    /// Roles whose workers run the command.
    pub roles: Vec<String>,
}

impl TestPlan {
    /// Parse a plan from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Load a plan from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::PlanReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::from_toml(&content).map_err(|e| ConfigError::PlanParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Steps of a phase.
    pub fn steps(&self, phase: Phase) -> &[PlanStep] {
        match phase {
            Phase::Setup => &self.setup,
            Phase::Workload => &self.workload,
            Phase::Teardown => &self.teardown,
        }
    }
}

impl PerformanceTest for TestPlan {
    fn configure(&self, config: &mut TestConfig) {
        for (role, count) in &self.roles {
            config.role(role.clone(), *count);
        }
        for phase in Phase::ALL {
            for step in self.steps(phase) {
                let task = match &step.name {
                    Some(name) => CommandTask::named(name.clone(), step.command.clone()),
                    None => CommandTask::new(step.command.clone()),
                };
                config.step(phase, TestStep::new(task, step.roles.iter().cloned()));
            }
        }
    }
}
