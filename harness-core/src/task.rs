//! Tasks: units of work dispatched to workers.
//!
//! A [`Task`] runs once on every worker targeted by its step. It receives a
//! [`TaskContext`] describing the worker (id, role, node) and can execute
//! commands on the worker's node.

use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use crate::infra::{shell_quote, ExecResult, InfraError, Infrastructure, Node};
use crate::workers::WorkerId;

/// Errors produced by a task on one worker.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A shell command exited with a non-zero status.
    #[error("command exited with status {exit_code}: {stderr}")]
    CommandFailed {
        /// Exit code.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// The node could not be reached or the command could not be started.
    #[error("infrastructure error: {0}")]
    Infra(#[from] InfraError),

    /// The task panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The worker went away before reporting a result.
    #[error("worker exited before reporting a result")]
    WorkerLost,

    /// Any other task-specific failure.
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    /// Build a task-specific failure from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}

/// A unit of work run on every worker of the targeted roles.
#[async_trait]
pub trait Task: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> String {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full).to_string()
    }

    /// Run the task on one worker.
    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError>;
}

#[async_trait]
impl<T: Task + ?Sized> Task for Arc<T> {
    fn name(&self) -> String {
        (**self).name()
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        (**self).run(ctx).await
    }
}

/// What a task knows about the worker running it.
#[derive(Clone)]
pub struct TaskContext {
    worker_id: WorkerId,
    role: String,
    node: Node,
    output_dir: String,
    infra: Arc<dyn Infrastructure>,
}

impl TaskContext {
    /// Create a context for a worker placed on `node`.
    pub fn new(
        worker_id: WorkerId,
        role: impl Into<String>,
        node: Node,
        output_dir: impl Into<String>,
        infra: Arc<dyn Infrastructure>,
    ) -> Self {
        Self {
            worker_id,
            role: role.into(),
            node,
            output_dir: output_dir.into(),
            infra,
        }
    }

    /// Id of the worker.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Role of the worker.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Node the worker is placed on.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Output directory on the node, relative to its working directory.
    /// Everything written here is copied back after a successful run.
    pub fn output_dir(&self) -> &str {
        &self.output_dir
    }

    /// The cluster the worker runs in.
    pub fn infra(&self) -> &Arc<dyn Infrastructure> {
        &self.infra
    }

    /// Execute a shell command on the worker's node.
    ///
    /// The command runs in the node's working directory with `PERF_ROLE`,
    /// `PERF_WORKER_ID`, `PERF_NODE` and `PERF_OUTPUT_DIR` exported. The
    /// result is returned whatever the exit code.
    pub async fn exec(&self, command: &str) -> Result<ExecResult, TaskError> {
        let script = format!(
            "export PERF_ROLE={} PERF_WORKER_ID={} PERF_NODE={} PERF_OUTPUT_DIR={}; {}",
            shell_quote(&self.role),
            self.worker_id.index(),
            shell_quote(self.node.name()),
            shell_quote(&self.output_dir),
            command,
        );
        Ok(self.infra.exec(&self.node, &script).await?)
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("worker_id", &self.worker_id)
            .field("role", &self.role)
            .field("node", &self.node)
            .field("output_dir", &self.output_dir)
            .finish_non_exhaustive()
    }
}

/// Runs a shell command on the worker's node; fails on non-zero exit.
#[derive(Debug, Clone)]
pub struct CommandTask {
    name: Option<String>,
    command: String,
}

impl CommandTask {
    /// Create a task named after its command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            name: None,
            command: command.into(),
        }
    }

    /// Create a task with an explicit name.
    pub fn named(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            command: command.into(),
        }
    }

    /// The shell command.
    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl Task for CommandTask {
    fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.command.clone())
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let result = ctx.exec(&self.command).await?;
        if !result.stdout.is_empty() {
            tracing::debug!(worker = %ctx.worker_id(), "{}", result.stdout.trim_end());
        }
        if !result.success() {
            return Err(TaskError::CommandFailed {
                exit_code: result.exit_code,
                stderr: result.stderr.trim_end().to_string(),
            });
        }
        Ok(())
    }
}

/// A task backed by an async closure.
pub struct FnTask<F> {
    name: String,
    f: F,
}

/// Wrap an async closure as a [`Task`].
///
/// ```ignore
/// let task = task_fn("warmup", |ctx| async move {
///     ctx.exec("curl -s localhost:8080/warmup").await?;
///     Ok(())
/// });
/// ```
pub fn task_fn<F, Fut>(name: impl Into<String>, f: F) -> FnTask<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send,
{
    FnTask {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        (self.f)(ctx.clone()).await
    }
}

impl<F> fmt::Debug for FnTask<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask").field("name", &self.name).finish()
    }
}

/// Best-effort message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
