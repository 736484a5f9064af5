//! # perf-harness-core
//!
//! Orchestration core for distributed performance tests.
//!
//! A test author implements [`PerformanceTest`] and declares, on a
//! [`TestConfig`], how many workers of each role to start and which tasks to
//! run against which roles in three phases:
//!
//! - **setup** - prepare servers, load data
//! - **workload** - the measured part of the test
//! - **teardown** - stop services, flush results
//!
//! [`TestRunner`] does the rest:
//!
//! ```text
//! InfraManager::create(n) ──► Infrastructure (n nodes)
//!        │
//!        ▼
//! WorkerManager::launch(infra, roles) ──► WorkerSet
//!        │
//!        ▼
//! setup ──► workload ──► teardown ──► output/node-<i>
//!        │
//!        ▼
//! WorkerSet::close() ──► Infrastructure::close()
//! ```
//!
//! Workers and nodes are always released, in that order, whatever happens
//! in between.
//!
//! ## Example
//!
//! ```ignore
//! use perf_harness_core::{CommandTask, LocalInfraManager, NodeWorkerManager, TestConfig, TestRunner};
//!
//! let runner = TestRunner::new(LocalInfraManager::new(), NodeWorkerManager::new());
//! let test = |config: &mut TestConfig| {
//!     config.role("server", 1).role("client", 2);
//!     config.setup(CommandTask::new("./start-server.sh"), ["server"]);
//!     config.workload(CommandTask::new("./load.sh > $PERF_OUTPUT_DIR/load.log"), ["client"]);
//! };
//! let summary = runner.run_test(&test, 3).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod definition;
pub mod error;
pub mod infra;
pub mod plan;
pub mod runner;
pub mod task;
pub mod workers;

pub use config::{ConfigError, HarnessConfig, InfraKind};
pub use definition::{PerformanceTest, Phase, TestConfig, TestStep};
pub use error::{HarnessError, ReleaseError};
pub use infra::{ExecResult, InfraError, InfraManager, Infrastructure, LocalInfraManager, Node, SshInfraManager};
pub use plan::{PlanStep, TestPlan};
pub use runner::{RunSummary, TestRunner};
pub use task::{task_fn, CommandTask, FnTask, Task, TaskContext, TaskError};
pub use workers::{NodeWorkerManager, WorkerError, WorkerFailure, WorkerId, WorkerInfo, WorkerManager, WorkerSet};
