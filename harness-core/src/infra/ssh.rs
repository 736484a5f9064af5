//! SSH provisioner.
//!
//! Uses `tokio::process::Command` to shell out to `ssh` and `scp`. Hosts
//! must already accept key-based logins (`BatchMode=yes`, no prompts).
//!
//! Each run gets its own scratch directory `<scratch_root>/<run-id>` on
//! every host; it is the nodes' working directory and is removed on close.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use super::{node_index, shell_quote, ExecResult, InfraError, InfraManager, Infrastructure, Node};
use crate::config::{ConfigError, SshConfig};

/// Errors from SSH operations.
#[derive(Debug, Error)]
pub enum SshError {
    /// SSH command failed to execute (process spawn error).
    #[error("ssh spawn error: {0}")]
    Spawn(#[from] std::io::Error),

    /// SSH command returned non-zero exit code.
    #[error("ssh command failed on {host}: exit={exit_code}, stderr={stderr}")]
    CommandFailed {
        /// Target host.
        host: String,
        /// Exit code.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// SCP transfer failed.
    #[error("scp failed: {0}")]
    ScpFailed(String),
}

/// SSH target machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    /// Host name or IP address.
    pub host: String,
    /// SSH username (default: the local user's SSH default).
    pub user: Option<String>,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl SshTarget {
    /// Parse `host` or `user@host`.
    pub fn parse(entry: &str, connect_timeout_secs: u64) -> Result<Self, ConfigError> {
        let entry = entry.trim();
        let (user, host) = match entry.split_once('@') {
            Some((user, host)) => (Some(user), host),
            None => (None, entry),
        };
        if host.is_empty() || user.is_some_and(str::is_empty) || host.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidHost(entry.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            user: user.map(str::to_string),
            connect_timeout_secs,
        })
    }

    /// `user@host` or `host`, as passed to `ssh`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    fn common_args(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".into(),
            "BatchMode=yes".into(),
        ]
    }

    /// Execute a command on the remote machine via SSH.
    ///
    /// Returns the raw result including exit code, stdout, and stderr.
    /// Does NOT fail on non-zero exit; use `exec_ok` for that.
    pub async fn exec(&self, cmd: &str) -> Result<ExecResult, SshError> {
        let output = tokio::process::Command::new("ssh")
            .args(self.common_args())
            .arg(self.destination())
            .arg(cmd)
            .output()
            .await?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Execute a command on the remote machine, failing on non-zero exit.
    pub async fn exec_ok(&self, cmd: &str) -> Result<ExecResult, SshError> {
        let result = self.exec(cmd).await?;
        if !result.success() {
            return Err(SshError::CommandFailed {
                host: self.host.clone(),
                exit_code: result.exit_code,
                stderr: result.stderr.clone(),
            });
        }
        Ok(result)
    }

    /// Recursively copy a remote directory to a local path via SCP.
    pub async fn scp_dir_from(&self, remote: &str, local: &Path) -> Result<(), SshError> {
        let output = tokio::process::Command::new("scp")
            .arg("-r")
            .args(self.common_args())
            .arg(format!("{}:{}", self.destination(), remote))
            .arg(local)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SshError::ScpFailed(format!(
                "scp from {}:{} failed: {}",
                self.destination(),
                remote,
                stderr.trim_end()
            )));
        }

        Ok(())
    }
}

/// Provisions clusters from a fixed list of SSH hosts.
#[derive(Debug, Clone)]
pub struct SshInfraManager {
    hosts: Vec<SshTarget>,
    scratch_root: String,
}

impl SshInfraManager {
    /// Create a provisioner over `hosts`, used in order.
    pub fn new(hosts: Vec<SshTarget>, scratch_root: impl Into<String>) -> Self {
        Self {
            hosts,
            scratch_root: scratch_root.into(),
        }
    }

    /// Build a provisioner from the `[ssh]` config section.
    ///
    /// Every host may appear once: nodes on one host would share a scratch
    /// directory.
    pub fn from_config(config: &SshConfig) -> Result<Self, ConfigError> {
        let mut hosts: Vec<SshTarget> = Vec::with_capacity(config.hosts.len());
        for entry in &config.hosts {
            let target = SshTarget::parse(entry, config.connect_timeout_secs)?;
            if hosts.iter().any(|h| h.host.eq_ignore_ascii_case(&target.host)) {
                return Err(ConfigError::DuplicateHost(target.host));
            }
            hosts.push(target);
        }
        Ok(Self::new(hosts, config.scratch_root.clone()))
    }

    /// Configured hosts.
    pub fn hosts(&self) -> &[SshTarget] {
        &self.hosts
    }
}

#[async_trait]
impl InfraManager for SshInfraManager {
    async fn create(&self, nodes: usize) -> Result<Arc<dyn Infrastructure>, InfraError> {
        if nodes == 0 {
            return Err(InfraError::InvalidNodeCount(nodes));
        }
        if self.hosts.len() < nodes {
            return Err(InfraError::InsufficientHosts {
                requested: nodes,
                available: self.hosts.len(),
            });
        }

        let run_dir = format!(
            "{}/{}",
            self.scratch_root.trim_end_matches('/'),
            uuid::Uuid::new_v4().as_simple()
        );
        let targets = self.hosts[..nodes].to_vec();

        let mkdir = format!("mkdir -p {}", shell_quote(&run_dir));
        let results = join_all(targets.iter().map(|t| t.exec_ok(&mkdir))).await;

        let mut created = Vec::with_capacity(targets.len());
        let mut failure = None;
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(_) => created.push(target),
                Err(e) => {
                    tracing::error!(host = %target.host, error = %e, "Failed to prepare host");
                    failure.get_or_insert(e);
                }
            }
        }

        // All or nothing: undo the hosts that did succeed.
        if let Some(err) = failure {
            let rmdir = format!("rm -rf {}", shell_quote(&run_dir));
            let cleanups = join_all(created.iter().map(|t| t.exec(&rmdir))).await;
            for (target, cleanup) in created.iter().zip(cleanups) {
                if let Err(e) = cleanup {
                    tracing::warn!(host = %target.host, error = %e, "Failed to remove scratch dir");
                }
            }
            return Err(err.into());
        }

        let nodes: Vec<Node> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| Node::new(format!("ssh-{i}"), t.host.clone(), run_dir.clone()))
            .collect();

        tracing::info!(nodes = nodes.len(), run_dir = %run_dir, "SSH cluster ready");

        Ok(Arc::new(SshInfrastructure {
            targets,
            nodes,
            run_dir,
            released: AtomicBool::new(false),
        }))
    }
}

/// A cluster of SSH hosts sharing one scratch directory name.
#[derive(Debug)]
pub struct SshInfrastructure {
    targets: Vec<SshTarget>,
    nodes: Vec<Node>,
    run_dir: String,
    released: AtomicBool,
}

impl SshInfrastructure {
    fn target(&self, node: &Node) -> Result<&SshTarget, InfraError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(InfraError::Released);
        }
        Ok(&self.targets[node_index(&self.nodes, node)?])
    }
}

#[async_trait]
impl Infrastructure for SshInfrastructure {
    fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    async fn exec(&self, node: &Node, command: &str) -> Result<ExecResult, InfraError> {
        let target = self.target(node)?;
        let cmd = format!("cd {} && {}", shell_quote(node.work_dir()), command);
        Ok(target.exec(&cmd).await?)
    }

    async fn copy_from_node(&self, node: &Node, remote: &str, dest: &Path) -> Result<(), InfraError> {
        let target = self.target(node)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let remote_path = format!("{}/{}", node.work_dir(), remote);
        target.scp_dir_from(&remote_path, dest).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), InfraError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let rmdir = format!("rm -rf {}", shell_quote(&self.run_dir));
        let results = join_all(self.targets.iter().map(|t| t.exec_ok(&rmdir))).await;

        let mut first_error = None;
        for (target, result) in self.targets.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(host = %target.host, error = %e, "Failed to remove scratch dir");
                first_error.get_or_insert(e);
            }
        }

        tracing::debug!(nodes = self.nodes.len(), "SSH cluster released");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
