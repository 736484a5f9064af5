//! Test runner: the single entry point for executing a [`PerformanceTest`].
//!
//! One run provisions a cluster, launches workers, runs the setup, workload
//! and teardown phases in order, copies every node's output directory to
//! `<output>/node-<index>`, and releases workers and cluster, in that
//! order, on every exit path.

use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{ConfigError, HarnessConfig, InfraKind};
use crate::definition::{PerformanceTest, Phase, TestConfig, TestStep};
use crate::error::{finish, HarnessError, ReleaseError};
use crate::infra::{InfraManager, Infrastructure, LocalInfraManager, SshInfraManager};
use crate::task::panic_message;
use crate::workers::{NodeWorkerManager, WorkerManager, WorkerSet};

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Identifier of this run, as it appears in the logs.
    pub run_id: Uuid,
    /// Number of nodes provisioned.
    pub node_count: usize,
    /// Number of workers launched.
    pub worker_count: usize,
    /// One artifact directory per node, in node order.
    pub artifact_dirs: Vec<PathBuf>,
}

/// Runs performance tests on provisioned infrastructure.
pub struct TestRunner {
    infra_manager: Box<dyn InfraManager>,
    worker_manager: Box<dyn WorkerManager>,
    output_dir: PathBuf,
    remote_output_path: String,
}

impl TestRunner {
    /// Create a runner writing artifacts to `output`, copied from each
    /// node's `output` directory.
    pub fn new(
        infra_manager: impl InfraManager + 'static,
        worker_manager: impl WorkerManager + 'static,
    ) -> Self {
        Self {
            infra_manager: Box::new(infra_manager),
            worker_manager: Box::new(worker_manager),
            output_dir: PathBuf::from("output"),
            remote_output_path: "output".to_string(),
        }
    }

    /// Build a runner from harness configuration.
    ///
    /// Workers are told to write to the same remote directory the runner
    /// copies artifacts from.
    pub fn from_config(config: &HarnessConfig) -> Result<Self, ConfigError> {
        let remote = config.output.remote_path.clone();
        let workers = NodeWorkerManager::with_output_dir(remote.clone());
        let runner = match config.infra.kind {
            InfraKind::Local => {
                let infra = match &config.local.base_dir {
                    Some(base) => LocalInfraManager::with_base_dir(base),
                    None => LocalInfraManager::new(),
                };
                TestRunner::new(infra, workers)
            }
            InfraKind::Ssh => TestRunner::new(SshInfraManager::from_config(&config.ssh)?, workers),
        };
        Ok(runner
            .with_output_dir(config.output.directory.clone())
            .with_remote_output_path(remote))
    }

    /// Local directory receiving `node-<index>` artifact directories.
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Directory copied from every node, relative to its working directory.
    pub fn with_remote_output_path(mut self, path: impl Into<String>) -> Self {
        self.remote_output_path = path.into();
        self
    }

    /// Local artifact root.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Run `test` on a cluster of `nodes` nodes.
    ///
    /// # Errors
    ///
    /// Any failure aborts the rest of the run and skips artifact retrieval.
    /// Workers and cluster are released before the error is returned; if
    /// releasing fails too, those errors are attached as
    /// [`HarnessError::Cleanup`] suppressed errors.
    pub async fn run_test(&self, test: &dyn PerformanceTest, nodes: usize) -> Result<RunSummary, HarnessError> {
        let run_id = Uuid::new_v4();
        tracing::info!(%run_id, nodes, "Provisioning cluster...");

        let infra = self
            .infra_manager
            .create(nodes)
            .await
            .map_err(HarnessError::Provision)?;

        let result = self
            .run_on_cluster(run_id, test, &infra)
            .instrument(tracing::info_span!("run", %run_id))
            .await;

        tracing::info!(%run_id, "Releasing cluster...");
        let released = infra.close().await.map_err(ReleaseError::from);
        if let Err(e) = &released {
            tracing::error!(%run_id, error = %e, "Cluster release failed");
        }

        let outcome = finish(result, released);
        match &outcome {
            Ok(summary) => tracing::info!(%run_id, artifacts = summary.artifact_dirs.len(), "Run complete"),
            Err(e) => tracing::error!(%run_id, error = %e, "Run failed"),
        }
        outcome
    }

    async fn run_on_cluster(
        &self,
        run_id: Uuid,
        test: &dyn PerformanceTest,
        infra: &Arc<dyn Infrastructure>,
    ) -> Result<RunSummary, HarnessError> {
        let config = configure(test)?;
        config.validate()?;

        tracing::info!(%run_id, roles = ?config.roles(), "Launching workers...");
        let workers = self
            .worker_manager
            .launch(Arc::clone(infra), config.roles())
            .await
            .map_err(HarnessError::Launch)?;

        let result = self
            .run_phases(&config, infra.as_ref(), workers.as_ref())
            .await
            .map(|artifact_dirs| RunSummary {
                run_id,
                node_count: infra.nodes().len(),
                worker_count: workers.workers().len(),
                artifact_dirs,
            });

        tracing::info!(%run_id, "Stopping workers...");
        let released = workers.close().await.map_err(ReleaseError::from);
        if let Err(e) = &released {
            tracing::error!(%run_id, error = %e, "Worker shutdown failed");
        }

        finish(result, released)
    }

    async fn run_phases(
        &self,
        config: &TestConfig,
        infra: &dyn Infrastructure,
        workers: &dyn WorkerSet,
    ) -> Result<Vec<PathBuf>, HarnessError> {
        for phase in Phase::ALL {
            tracing::info!("Starting {} tasks...", phase);
            run_tasks(phase, config.steps(phase), workers).await?;
        }

        tracing::info!("Copying results...");
        self.copy_artifacts(infra).await
    }

    /// Copy every node's output directory to `<output>/node-<index>`.
    ///
    /// Nodes are copied into a staging directory inside the output root and
    /// only moved into place once every copy succeeded. Then every earlier
    /// `node-<index>` directory is replaced, so the root holds exactly this
    /// run's nodes. On failure the root is left as it was, and removed if
    /// this call created it.
    async fn copy_artifacts(&self, infra: &dyn Infrastructure) -> Result<Vec<PathBuf>, HarnessError> {
        let root = &self.output_dir;
        let created_root = !tokio::fs::try_exists(root).await.unwrap_or(false);
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|source| HarnessError::ArtifactDir {
                path: root.clone(),
                source,
            })?;

        let result = self.stage_and_swap(infra).await;
        if result.is_err() && created_root {
            if let Err(e) = tokio::fs::remove_dir_all(root).await {
                tracing::warn!(dir = %root.display(), error = %e, "Failed to remove output directory");
            }
        }
        result
    }

    async fn stage_and_swap(&self, infra: &dyn Infrastructure) -> Result<Vec<PathBuf>, HarnessError> {
        let root = &self.output_dir;
        // Removed on drop, whatever happens below.
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(root)
            .map_err(|source| HarnessError::ArtifactDir {
                path: root.clone(),
                source,
            })?;

        for (index, node) in infra.nodes().iter().enumerate() {
            let dest = staging.path().join(node_dir_name(index));
            infra
                .copy_from_node(node, &self.remote_output_path, &dest)
                .await
                .map_err(|source| HarnessError::Artifact { node: index, source })?;
            tracing::debug!(node = %node.name(), "Copied node output");
        }

        remove_node_dirs(root).await.map_err(|source| HarnessError::ArtifactDir {
            path: root.clone(),
            source,
        })?;

        let mut placed = Vec::with_capacity(infra.nodes().len());
        for index in 0..infra.nodes().len() {
            let name = node_dir_name(index);
            let dest = root.join(&name);
            if let Err(source) = tokio::fs::rename(staging.path().join(&name), &dest).await {
                discard(&placed).await;
                return Err(HarnessError::ArtifactDir { path: dest, source });
            }
            placed.push(dest);
        }

        Ok(placed)
    }
}

fn node_dir_name(index: usize) -> String {
    format!("node-{index}")
}

/// True for `node-<index>` entries written by an earlier run.
fn is_node_dir_name(name: &str) -> bool {
    name.strip_prefix("node-")
        .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
}

/// Remove every `node-<index>` directory in `root`. Other entries are kept.
async fn remove_node_dirs(root: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name.to_str().is_some_and(is_node_dir_name) && entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
        }
    }
    Ok(())
}

/// Execute the steps of one phase in order, each to completion.
async fn run_tasks(phase: Phase, steps: &[TestStep], workers: &dyn WorkerSet) -> Result<(), HarnessError> {
    for (index, step) in steps.iter().enumerate() {
        tracing::debug!(%phase, index, task = %step.task().name(), roles = ?step.roles(), "Running step");
        workers
            .execute(Arc::clone(step.task()), step.roles())
            .await
            .map_err(|source| HarnessError::Step { phase, index, source })?;
    }
    Ok(())
}

/// Build the test's config on a fresh instance. A panicking test
/// definition becomes an error so the caller can still release resources.
fn configure(test: &dyn PerformanceTest) -> Result<TestConfig, ConfigError> {
    let mut config = TestConfig::new();
    panic::catch_unwind(AssertUnwindSafe(|| test.configure(&mut config)))
        .map_err(|payload| ConfigError::ConfigurePanicked(panic_message(payload.as_ref())))?;
    Ok(config)
}

/// Remove a directory, ignoring one that is already gone.
async fn remove_dir_if_present(dest: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dest).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn discard(dirs: &[PathBuf]) {
    for dir in dirs {
        if let Err(e) = remove_dir_if_present(dir).await {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove partial artifacts");
        }
    }
}
