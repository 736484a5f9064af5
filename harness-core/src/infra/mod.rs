//! Cluster provisioning.
//!
//! An [`InfraManager`] turns a node count into an [`Infrastructure`]: a
//! handle over exactly that many live nodes. The handle runs commands on its
//! nodes, copies output directories back, and is released with
//! [`Infrastructure::close`], which may be called any number of times.
//!
//! Two provisioners are provided:
//! - [`LocalInfraManager`] - every node is a temporary directory here
//! - [`SshInfraManager`] - every node is a pre-existing host reached over SSH

pub mod local;
pub mod ssh;

pub use local::LocalInfraManager;
pub use ssh::{SshError, SshInfraManager, SshTarget};

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors from provisioning and node operations.
#[derive(Debug, Error)]
pub enum InfraError {
    /// A cluster needs at least one node.
    #[error("node count must be at least 1, got {0}")]
    InvalidNodeCount(usize),

    /// More nodes were requested than hosts are configured.
    #[error("requested {requested} nodes but only {available} hosts are configured")]
    InsufficientHosts {
        /// Requested node count.
        requested: usize,
        /// Configured host count.
        available: usize,
    },

    /// SSH or SCP failed.
    #[error("ssh error: {0}")]
    Ssh(#[from] SshError),

    /// A command exited with a non-zero status.
    #[error("command failed on {node}: exit={exit_code}, stderr={stderr}")]
    CommandFailed {
        /// Node name.
        node: String,
        /// Exit code.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// A path to copy does not exist on the node.
    #[error("path {path} not found on {node}")]
    MissingPath {
        /// Node name.
        node: String,
        /// Path relative to the node's working directory.
        path: String,
    },

    /// The node is not part of this cluster.
    #[error("node {0} does not belong to this cluster")]
    UnknownNode(String),

    /// The cluster has already been released.
    #[error("cluster already released")]
    Released,

    /// General I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One provisioned machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    name: String,
    address: String,
    work_dir: String,
}

impl Node {
    /// Create a node description.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        work_dir: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            work_dir: work_dir.into(),
        }
    }

    /// Unique name within the cluster.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Network address (`localhost` for local nodes).
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Working directory on the node; relative paths resolve against it.
    pub fn work_dir(&self) -> &str {
        &self.work_dir
    }
}

/// Result of executing a command on a node.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code (0 = success).
    pub exit_code: i32,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Provisions clusters.
#[async_trait]
pub trait InfraManager: Send + Sync {
    /// Provision exactly `nodes` live nodes, or fail without leaving any
    /// behind.
    async fn create(&self, nodes: usize) -> Result<Arc<dyn Infrastructure>, InfraError>;
}

/// Handle over a provisioned cluster.
#[async_trait]
pub trait Infrastructure: Send + Sync {
    /// Nodes of the cluster, in a stable order.
    fn nodes(&self) -> &[Node];

    /// Execute a shell command in the node's working directory.
    ///
    /// Does NOT fail on non-zero exit; use [`Infrastructure::exec_ok`] for that.
    async fn exec(&self, node: &Node, command: &str) -> Result<ExecResult, InfraError>;

    /// Execute a command, failing on non-zero exit.
    async fn exec_ok(&self, node: &Node, command: &str) -> Result<ExecResult, InfraError> {
        let result = self.exec(node, command).await?;
        if !result.success() {
            return Err(InfraError::CommandFailed {
                node: node.name().to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr,
            });
        }
        Ok(result)
    }

    /// Copy the directory `remote` (relative to the node's working
    /// directory) to the local directory `dest`, which must not exist yet.
    async fn copy_from_node(&self, node: &Node, remote: &str, dest: &Path) -> Result<(), InfraError>;

    /// Release the cluster. Calling this again is a no-op.
    async fn close(&self) -> Result<(), InfraError>;
}

/// Quote a string for a POSIX shell.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Find the position of `node` in `nodes`.
pub(crate) fn node_index(nodes: &[Node], node: &Node) -> Result<usize, InfraError> {
    nodes
        .iter()
        .position(|n| n == node)
        .ok_or_else(|| InfraError::UnknownNode(node.name().to_string()))
}
