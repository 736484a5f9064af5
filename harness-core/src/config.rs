//! Harness configuration.
//!
//! Configuration is loaded from a TOML file (default: `harness.toml`). Every
//! section and field is optional.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::definition::Phase;

/// Root configuration for the harness.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HarnessConfig {
    /// Artifact locations.
    #[serde(default)]
    pub output: OutputConfig,
    /// Which provisioner to use.
    #[serde(default)]
    pub infra: InfraConfig,
    /// Local provisioner settings.
    #[serde(default)]
    pub local: LocalConfig,
    /// SSH provisioner settings.
    #[serde(default)]
    pub ssh: SshConfig,
}

/// Artifact locations.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Local directory receiving one `node-<index>` subdirectory per node
    /// (default: `output`).
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
    /// Output directory on each node, relative to the node's working
    /// directory (default: `output`).
    #[serde(default = "default_remote_path")]
    pub remote_path: String,
}

/// Provisioner selection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InfraConfig {
    /// Provisioner kind (default: `local`).
    #[serde(default)]
    pub kind: InfraKind,
}

/// Available provisioners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfraKind {
    /// Nodes are temporary directories on this machine.
    #[default]
    Local,
    /// Nodes are pre-existing hosts reached over SSH.
    Ssh,
}

/// Local provisioner settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalConfig {
    /// Parent directory for node directories (default: system temp dir).
    pub base_dir: Option<PathBuf>,
}

/// SSH provisioner settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Hosts as `host` or `user@host`, used in order.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Remote parent directory for per-run scratch directories
    /// (default: `/tmp/perf-harness`).
    #[serde(default = "default_scratch_root")]
    pub scratch_root: String,
    /// SSH connection timeout in seconds (default: 30).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("output")
}

fn default_remote_path() -> String {
    "output".to_string()
}

fn default_scratch_root() -> String {
    "/tmp/perf-harness".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
            remote_path: default_remote_path(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            scratch_root: default_scratch_root(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse a configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },

    /// An SSH host entry could not be parsed.
    #[error("invalid ssh host entry: {0:?}")]
    InvalidHost(String),

    /// The same SSH host is listed more than once.
    #[error("ssh host {0:?} is listed more than once")]
    DuplicateHost(String),

    /// Failed to read a test plan.
    #[error("failed to read test plan {path}: {source}")]
    PlanReadError {
        /// Path to the plan.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse a test plan.
    #[error("failed to parse test plan {path}: {source}")]
    PlanParseError {
        /// Path to the plan.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },

    /// A step targets a role that was never declared.
    #[error("{phase} step {step} targets undeclared role {role:?}")]
    UnknownRole {
        /// Phase of the offending step.
        phase: Phase,
        /// Zero-based index of the step within its phase.
        step: usize,
        /// The undeclared role.
        role: String,
    },

    /// A step targets no roles at all.
    #[error("{phase} step {step} targets no roles")]
    EmptyRoles {
        /// Phase of the offending step.
        phase: Phase,
        /// Zero-based index of the step within its phase.
        step: usize,
    },

    /// The test definition panicked while configuring.
    #[error("test definition panicked during configure: {0}")]
    ConfigurePanicked(String),
}
