//! Local provisioner.
//!
//! Every node is a fresh temporary directory on this machine. Commands run
//! through `sh -c` inside the node directory, so a local cluster behaves
//! like a remote one with all nodes sharing one host.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use super::{node_index, ExecResult, InfraError, InfraManager, Infrastructure, Node};

/// Provisions clusters of temporary directories.
#[derive(Debug, Clone, Default)]
pub struct LocalInfraManager {
    base_dir: Option<PathBuf>,
}

impl LocalInfraManager {
    /// Create node directories under the system temp dir.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create node directories under `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn node_dir(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("perf-node-");
        match &self.base_dir {
            Some(base) => builder.tempdir_in(base),
            None => builder.tempdir(),
        }
    }
}

#[async_trait]
impl InfraManager for LocalInfraManager {
    async fn create(&self, nodes: usize) -> Result<Arc<dyn Infrastructure>, InfraError> {
        if nodes == 0 {
            return Err(InfraError::InvalidNodeCount(nodes));
        }

        // Directories created before a failure are removed when `dirs` drops.
        let mut dirs = Vec::with_capacity(nodes);
        for _ in 0..nodes {
            dirs.push(self.node_dir()?);
        }

        let nodes: Vec<Node> = dirs
            .iter()
            .enumerate()
            .map(|(i, dir)| Node::new(format!("local-{i}"), "localhost", dir.path().display().to_string()))
            .collect();

        tracing::info!(nodes = nodes.len(), "Local cluster ready");

        Ok(Arc::new(LocalInfrastructure {
            nodes,
            dirs: Mutex::new(Some(dirs)),
        }))
    }
}

/// A cluster of local directories.
#[derive(Debug)]
pub struct LocalInfrastructure {
    nodes: Vec<Node>,
    dirs: Mutex<Option<Vec<TempDir>>>,
}

impl LocalInfrastructure {
    fn ensure_live(&self) -> Result<(), InfraError> {
        let dirs = self.dirs.lock().unwrap_or_else(|e| e.into_inner());
        if dirs.is_none() {
            return Err(InfraError::Released);
        }
        Ok(())
    }
}

#[async_trait]
impl Infrastructure for LocalInfrastructure {
    fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    async fn exec(&self, node: &Node, command: &str) -> Result<ExecResult, InfraError> {
        self.ensure_live()?;
        node_index(&self.nodes, node)?;

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(node.work_dir())
            .output()
            .await?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn copy_from_node(&self, node: &Node, remote: &str, dest: &Path) -> Result<(), InfraError> {
        self.ensure_live()?;
        node_index(&self.nodes, node)?;

        let src = Path::new(node.work_dir()).join(remote);
        if !src.is_dir() {
            return Err(InfraError::MissingPath {
                node: node.name().to_string(),
                path: remote.to_string(),
            });
        }

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_dir_all(&src, &dest))
            .await
            .map_err(std::io::Error::other)??;
        Ok(())
    }

    async fn close(&self) -> Result<(), InfraError> {
        let dirs = self
            .dirs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(dirs) = dirs else {
            return Ok(());
        };

        let mut first_error = None;
        for dir in dirs {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove node directory");
                first_error.get_or_insert(e);
            }
        }

        tracing::debug!(nodes = self.nodes.len(), "Local cluster released");
        match first_error {
            Some(e) => Err(InfraError::Io(e)),
            None => Ok(()),
        }
    }
}

/// Recursively copy the directory `src` to `dest`.
fn copy_dir_all(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
