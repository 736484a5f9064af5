//! Node-bound workers.
//!
//! Each worker is a tokio task pinned to one node and one role. It receives
//! jobs over an `mpsc` channel, runs them with a [`TaskContext`] for its
//! node, and answers over a `oneshot`. Panics inside a task are caught and
//! reported as a failure of that worker; the worker keeps serving.

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::{WorkerError, WorkerFailure, WorkerId, WorkerInfo, WorkerManager, WorkerSet};
use crate::infra::{shell_quote, Infrastructure};
use crate::task::{panic_message, Task, TaskContext, TaskError};

/// Jobs queued per worker. Dispatch waits for every reply before sending
/// the next step, so one slot is all a worker ever uses.
const JOB_QUEUE_DEPTH: usize = 1;

/// Starts workers as tokio tasks, placed round-robin over the nodes.
///
/// Roles are placed in name order; within a role, consecutive workers go to
/// consecutive nodes, continuing where the previous role stopped.
#[derive(Debug, Clone)]
pub struct NodeWorkerManager {
    output_dir: String,
}

impl Default for NodeWorkerManager {
    fn default() -> Self {
        Self {
            output_dir: "output".to_string(),
        }
    }
}

impl NodeWorkerManager {
    /// Workers write their output to `output` on their node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Workers write their output to `output_dir` (relative to the node's
    /// working directory).
    pub fn with_output_dir(output_dir: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Output directory handed to tasks.
    pub fn output_dir(&self) -> &str {
        &self.output_dir
    }
}

#[async_trait]
impl WorkerManager for NodeWorkerManager {
    async fn launch(
        &self,
        infra: Arc<dyn Infrastructure>,
        roles: &BTreeMap<String, usize>,
    ) -> Result<Box<dyn WorkerSet>, WorkerError> {
        let nodes = infra.nodes().to_vec();
        let total: usize = roles.values().sum();
        if total > 0 && nodes.is_empty() {
            return Err(WorkerError::NoNodes(total));
        }

        // Every node gets an output directory, so artifact retrieval finds
        // one even on nodes without workers. Nothing is spawned before this
        // succeeds everywhere.
        let mkdir = format!("mkdir -p {}", shell_quote(&self.output_dir));
        let prepared = join_all(nodes.iter().map(|node| infra.exec_ok(node, &mkdir))).await;
        for (node, result) in nodes.iter().zip(prepared) {
            result.map_err(|source| WorkerError::Prepare {
                node: node.name().to_string(),
                source,
            })?;
        }

        let mut workers = Vec::with_capacity(total);
        for (role, count) in roles {
            for _ in 0..*count {
                let id = WorkerId::new(workers.len());
                let node = nodes[id.index() % nodes.len()].clone();
                let ctx = TaskContext::new(id, role.clone(), node, self.output_dir.clone(), Arc::clone(&infra));
                workers.push(spawn_worker(ctx));
            }
        }

        tracing::info!(workers = workers.len(), nodes = nodes.len(), "Workers launched");
        for worker in &workers {
            tracing::debug!(worker = %worker.info.id, role = %worker.info.role, node = %worker.info.node, "Worker placed");
        }

        let infos = workers.iter().map(|w| w.info.clone()).collect();
        Ok(Box::new(NodeWorkers {
            infos,
            workers: Mutex::new(Some(workers)),
        }))
    }
}

struct Job {
    task: Arc<dyn Task>,
    reply: oneshot::Sender<Result<(), TaskError>>,
}

struct WorkerHandle {
    info: WorkerInfo,
    jobs: mpsc::Sender<Job>,
    join: JoinHandle<()>,
}

fn spawn_worker(ctx: TaskContext) -> WorkerHandle {
    let info = WorkerInfo {
        id: ctx.worker_id(),
        role: ctx.role().to_string(),
        node: ctx.node().name().to_string(),
    };
    let (jobs, mut rx) = mpsc::channel::<Job>(JOB_QUEUE_DEPTH);

    // Child of the caller's span, so worker lines carry the run id too.
    let span = tracing::info_span!("worker", id = %info.id, role = %info.role, node = %info.node);
    let worker = async move {
        while let Some(job) = rx.recv().await {
            let result = match AssertUnwindSafe(job.task.run(&ctx)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
            };
            // The dispatcher may have gone away; nobody to tell then.
            let _ = job.reply.send(result);
        }
        tracing::debug!("Worker stopped");
    };
    let join = tokio::spawn(worker.instrument(span));

    WorkerHandle { info, jobs, join }
}

/// Workers started by [`NodeWorkerManager`].
pub struct NodeWorkers {
    infos: Vec<WorkerInfo>,
    workers: Mutex<Option<Vec<WorkerHandle>>>,
}

#[async_trait]
impl WorkerSet for NodeWorkers {
    fn workers(&self) -> Vec<WorkerInfo> {
        self.infos.clone()
    }

    async fn execute(&self, task: Arc<dyn Task>, roles: &BTreeSet<String>) -> Result<(), WorkerError> {
        let targets: Vec<(WorkerInfo, mpsc::Sender<Job>)> = {
            let guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            let workers = guard.as_ref().ok_or(WorkerError::Closed)?;
            workers
                .iter()
                .filter(|w| roles.contains(&w.info.role))
                .map(|w| (w.info.clone(), w.jobs.clone()))
                .collect()
        };

        let name = task.name();
        if targets.is_empty() {
            tracing::warn!(task = %name, roles = ?roles, "No workers match step roles");
            return Ok(());
        }
        tracing::debug!(task = %name, workers = targets.len(), "Dispatching task");

        // Every targeted worker runs to completion before the step is judged.
        let replies = join_all(targets.iter().map(|(_, jobs)| {
            let task = Arc::clone(&task);
            async move {
                let (reply, rx) = oneshot::channel();
                if jobs.send(Job { task, reply }).await.is_err() {
                    return Err(TaskError::WorkerLost);
                }
                rx.await.unwrap_or(Err(TaskError::WorkerLost))
            }
        }))
        .await;

        let targeted = targets.len();
        let failures: Vec<WorkerFailure> = targets
            .into_iter()
            .zip(replies)
            .filter_map(|((info, _), reply)| {
                reply.err().map(|error| WorkerFailure {
                    worker: info.id,
                    role: info.role,
                    error,
                })
            })
            .collect();

        if failures.is_empty() {
            return Ok(());
        }
        for failure in &failures {
            tracing::error!(task = %name, worker = %failure.worker, role = %failure.role, error = %failure.error, "Task failed");
        }
        Err(WorkerError::TaskFailed {
            task: name,
            targeted,
            failures,
        })
    }

    async fn close(&self) -> Result<(), WorkerError> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(workers) = workers else {
            return Ok(());
        };

        let mut first_error = None;
        for WorkerHandle { info, jobs, join } in workers {
            // Closing the channel ends the worker loop.
            drop(jobs);
            if let Err(e) = join.await {
                tracing::warn!(worker = %info.id, error = %e, "Worker did not stop cleanly");
                first_error.get_or_insert(WorkerError::Shutdown {
                    worker: info.id,
                    detail: e.to_string(),
                });
            }
        }

        tracing::debug!(workers = self.infos.len(), "Workers stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
