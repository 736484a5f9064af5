//! Error types for a test run.

use std::path::PathBuf;

use crate::config::ConfigError;
use crate::definition::Phase;
use crate::infra::InfraError;
use crate::workers::WorkerError;

/// Failure of a complete test run.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The cluster could not be provisioned.
    #[error("provisioning failed: {0}")]
    Provision(#[source] InfraError),

    /// The test definition produced an unusable configuration.
    #[error("invalid test configuration: {0}")]
    Config(#[from] ConfigError),

    /// Workers could not be started.
    #[error("worker launch failed: {0}")]
    Launch(#[source] WorkerError),

    /// A task step failed on at least one targeted worker.
    #[error("{phase} step {index} failed: {source}")]
    Step {
        /// Phase the step belongs to.
        phase: Phase,
        /// Zero-based position of the step within its phase.
        index: usize,
        /// Dispatch failure.
        #[source]
        source: WorkerError,
    },

    /// Copying a node's output directory failed.
    #[error("artifact retrieval from node {node} failed: {source}")]
    Artifact {
        /// Zero-based node index in cluster order.
        node: usize,
        /// Underlying copy failure.
        #[source]
        source: InfraError,
    },

    /// The local artifact directory could not be prepared.
    #[error("cannot prepare artifact directory {path}: {source}")]
    ArtifactDir {
        /// Directory that could not be created or cleared.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The run succeeded but releasing workers or nodes failed.
    #[error("release failed: {0}")]
    Release(#[source] ReleaseError),

    /// The run failed and cleanup failed as well.
    ///
    /// `source` is the original failure; release errors are kept alongside
    /// it instead of replacing it.
    #[error("{source}{}", suppressed_suffix(.suppressed))]
    Cleanup {
        /// The original failure.
        source: Box<HarnessError>,
        /// Errors raised while releasing resources afterwards.
        suppressed: Vec<ReleaseError>,
    },
}

/// Failure while releasing a run's resources.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    /// Worker shutdown failed.
    #[error("worker shutdown: {0}")]
    Workers(#[from] WorkerError),

    /// Releasing the cluster failed.
    #[error("cluster release: {0}")]
    Infra(#[from] InfraError),
}

impl HarnessError {
    /// Attach release errors to this failure.
    ///
    /// Nested cleanups are flattened so the original failure stays at the top.
    pub fn with_suppressed(self, mut errors: Vec<ReleaseError>) -> Self {
        if errors.is_empty() {
            return self;
        }
        match self {
            HarnessError::Cleanup {
                source,
                mut suppressed,
            } => {
                suppressed.append(&mut errors);
                HarnessError::Cleanup { source, suppressed }
            }
            other => HarnessError::Cleanup {
                source: Box::new(other),
                suppressed: errors,
            },
        }
    }

    /// The failure that ended the run, ignoring any cleanup errors.
    pub fn primary(&self) -> &HarnessError {
        match self {
            HarnessError::Cleanup { source, .. } => source.primary(),
            other => other,
        }
    }

    /// Release errors suppressed behind the primary failure.
    pub fn suppressed(&self) -> &[ReleaseError] {
        match self {
            HarnessError::Cleanup { suppressed, .. } => suppressed,
            _ => &[],
        }
    }
}

/// Merge a run result with the outcome of releasing its resources.
pub(crate) fn finish<T>(
    result: Result<T, HarnessError>,
    released: Result<(), ReleaseError>,
) -> Result<T, HarnessError> {
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release)) => Err(HarnessError::Release(release)),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release)) => Err(err.with_suppressed(vec![release])),
    }
}

fn suppressed_suffix(suppressed: &[ReleaseError]) -> String {
    if suppressed.is_empty() {
        return String::new();
    }
    let joined = suppressed
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    format!(" (suppressed: {joined})")
}
