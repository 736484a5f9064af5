//! Worker lifecycle and role-scoped dispatch.
//!
//! A [`WorkerManager`] starts role-tagged workers on a cluster and returns a
//! [`WorkerSet`]. [`WorkerSet::execute`] is a barrier: it runs a task on
//! every worker of the targeted roles and returns only once all of them
//! have finished.

mod node;

pub use node::NodeWorkerManager;

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::infra::{InfraError, Infrastructure};
use crate::task::{Task, TaskError};

/// Errors from launching, dispatching to, or closing workers.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Workers were requested but the cluster has no nodes.
    #[error("no nodes available to place {0} workers")]
    NoNodes(usize),

    /// A node could not be prepared for its workers.
    #[error("failed to prepare node {node}: {source}")]
    Prepare {
        /// Node name.
        node: String,
        /// Underlying failure.
        #[source]
        source: InfraError,
    },

    /// The task failed on at least one targeted worker.
    #[error("task {task:?} failed on {} of {targeted} workers: {}", .failures.len(), describe_failures(.failures))]
    TaskFailed {
        /// Task name.
        task: String,
        /// Number of workers the task was dispatched to.
        targeted: usize,
        /// One entry per failed worker, in worker order.
        failures: Vec<WorkerFailure>,
    },

    /// The worker set has been closed.
    #[error("worker set already closed")]
    Closed,

    /// A worker did not shut down cleanly.
    #[error("{worker} did not shut down cleanly: {detail}")]
    Shutdown {
        /// The worker.
        worker: WorkerId,
        /// What went wrong.
        detail: String,
    },
}

/// Stable worker identifier, unique within one worker set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(usize);

impl WorkerId {
    /// Create a worker id.
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Zero-based index of the worker in launch order.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Placement of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Worker id.
    pub id: WorkerId,
    /// Role the worker is tagged with.
    pub role: String,
    /// Name of the node the worker runs on.
    pub node: String,
}

/// Failure of a task on one worker.
#[derive(Debug)]
pub struct WorkerFailure {
    /// The worker.
    pub worker: WorkerId,
    /// Its role.
    pub role: String,
    /// What went wrong.
    pub error: TaskError,
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.worker, self.role, self.error)
    }
}

fn describe_failures(failures: &[WorkerFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Starts workers on a cluster.
#[async_trait]
pub trait WorkerManager: Send + Sync {
    /// Start `count` workers for every `(role, count)` entry across the
    /// cluster's nodes. Either every worker starts or none is left running.
    async fn launch(
        &self,
        infra: Arc<dyn Infrastructure>,
        roles: &BTreeMap<String, usize>,
    ) -> Result<Box<dyn WorkerSet>, WorkerError>;
}

/// Handle over a set of running workers.
#[async_trait]
pub trait WorkerSet: Send + Sync {
    /// Placement of every worker, in id order.
    fn workers(&self) -> Vec<WorkerInfo>;

    /// Run `task` on every worker whose role is in `roles` and wait for all
    /// of them. Fails if the task failed on any of them.
    async fn execute(&self, task: Arc<dyn Task>, roles: &BTreeSet<String>) -> Result<(), WorkerError>;

    /// Stop every worker. Calling this again is a no-op.
    async fn close(&self) -> Result<(), WorkerError>;
}
