//! End-to-end behaviour of `TestRunner`.
//!
//! The first half drives the runner with recording collaborators to check
//! ordering and release guarantees; the second half runs real local
//! clusters.

use async_trait::async_trait;
use perf_harness_core::{
    task_fn, CommandTask, ExecResult, HarnessError, InfraError, InfraManager, Infrastructure,
    LocalInfraManager, Node, NodeWorkerManager, Phase, ReleaseError, Task, TaskContext, TaskError,
    TestConfig, TestRunner, WorkerError, WorkerFailure, WorkerId, WorkerInfo, WorkerManager,
    WorkerSet,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Recording collaborators
// ============================================================================

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == event).count()
    }

    fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

#[derive(Clone, Default)]
struct MockInfraManager {
    recorder: Recorder,
    fail_create: bool,
    fail_close: bool,
    fail_copy_at: Option<usize>,
}

#[async_trait]
impl InfraManager for MockInfraManager {
    async fn create(&self, nodes: usize) -> Result<Arc<dyn Infrastructure>, InfraError> {
        self.recorder.push(format!("infra.create:{nodes}"));
        if self.fail_create {
            return Err(InfraError::InsufficientHosts {
                requested: nodes,
                available: 0,
            });
        }
        let nodes = (0..nodes)
            .map(|i| Node::new(format!("mock-{i}"), format!("10.0.0.{i}"), "/work"))
            .collect();
        Ok(Arc::new(MockInfra {
            nodes,
            recorder: self.recorder.clone(),
            fail_close: self.fail_close,
            fail_copy_at: self.fail_copy_at,
        }))
    }
}

struct MockInfra {
    nodes: Vec<Node>,
    recorder: Recorder,
    fail_close: bool,
    fail_copy_at: Option<usize>,
}

#[async_trait]
impl Infrastructure for MockInfra {
    fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    async fn exec(&self, _node: &Node, _command: &str) -> Result<ExecResult, InfraError> {
        Ok(ExecResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn copy_from_node(&self, node: &Node, remote: &str, dest: &Path) -> Result<(), InfraError> {
        self.recorder.push(format!("copy:{}", node.name()));
        let index = self.nodes.iter().position(|n| n == node);
        if index.is_some() && index == self.fail_copy_at {
            return Err(InfraError::MissingPath {
                node: node.name().to_string(),
                path: remote.to_string(),
            });
        }
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("source.txt"), format!("{}:{}", node.name(), remote))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), InfraError> {
        self.recorder.push("infra.close");
        if self.fail_close {
            return Err(InfraError::Io(std::io::Error::other("node stuck")));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MockWorkerManager {
    recorder: Recorder,
    fail_launch: bool,
    fail_close: bool,
    failing_task: Option<String>,
}

#[async_trait]
impl WorkerManager for MockWorkerManager {
    async fn launch(
        &self,
        _infra: Arc<dyn Infrastructure>,
        roles: &BTreeMap<String, usize>,
    ) -> Result<Box<dyn WorkerSet>, WorkerError> {
        let described: Vec<String> = roles.iter().map(|(r, c)| format!("{r}={c}")).collect();
        self.recorder.push(format!("workers.launch:{}", described.join(",")));
        if self.fail_launch {
            return Err(WorkerError::NoNodes(roles.values().sum()));
        }
        Ok(Box::new(MockWorkers {
            manager: self.clone(),
        }))
    }
}

struct MockWorkers {
    manager: MockWorkerManager,
}

#[async_trait]
impl WorkerSet for MockWorkers {
    fn workers(&self) -> Vec<WorkerInfo> {
        Vec::new()
    }

    async fn execute(&self, task: Arc<dyn Task>, roles: &BTreeSet<String>) -> Result<(), WorkerError> {
        let name = task.name();
        let roles: Vec<&str> = roles.iter().map(String::as_str).collect();
        self.manager
            .recorder
            .push(format!("execute:{}:{}", name, roles.join("+")));
        if self.manager.failing_task.as_deref() == Some(name.as_str()) {
            return Err(WorkerError::TaskFailed {
                task: name,
                targeted: 1,
                failures: vec![WorkerFailure {
                    worker: WorkerId::new(0),
                    role: roles.first().map(|r| r.to_string()).unwrap_or_default(),
                    error: TaskError::msg("injected"),
                }],
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), WorkerError> {
        self.manager.recorder.push("workers.close");
        if self.manager.fail_close {
            return Err(WorkerError::Shutdown {
                worker: WorkerId::new(0),
                detail: "hung".into(),
            });
        }
        Ok(())
    }
}

/// Sorted entry names of `dir`.
fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn mock_runner(infra: MockInfraManager, workers: MockWorkerManager, output: &Path) -> TestRunner {
    TestRunner::new(infra, workers).with_output_dir(output)
}

/// Declares steps in reverse phase order on purpose.
fn server_client_test(config: &mut TestConfig) {
    config.role("server", 1).role("client", 2);
    config.teardown(CommandTask::named("stop", "true"), ["server"]);
    config.workload(CommandTask::named("load-1", "true"), ["client"]);
    config.workload(CommandTask::named("load-2", "true"), ["client", "server"]);
    config.setup(CommandTask::named("start", "true"), ["server"]);
}

// ============================================================================
// Ordering and release guarantees
// ============================================================================

#[tokio::test]
async fn successful_run_follows_lifecycle_order() {
    let out = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let runner = mock_runner(
        MockInfraManager {
            recorder: recorder.clone(),
            ..Default::default()
        },
        MockWorkerManager {
            recorder: recorder.clone(),
            ..Default::default()
        },
        out.path(),
    );

    runner.run_test(&server_client_test, 2).await.unwrap();

    assert_eq!(
        recorder.events(),
        vec![
            "infra.create:2",
            "workers.launch:client=2,server=1",
            "execute:start:server",
            "execute:load-1:client",
            "execute:load-2:client+server",
            "execute:stop:server",
            "copy:mock-0",
            "copy:mock-1",
            "workers.close",
            "infra.close",
        ]
    );
}

#[tokio::test]
async fn artifacts_are_indexed_in_node_order() {
    let out = tempfile::tempdir().unwrap();
    let runner = mock_runner(MockInfraManager::default(), MockWorkerManager::default(), out.path());

    for nodes in [1, 4] {
        let summary = runner.run_test(&server_client_test, nodes).await.unwrap();

        assert_eq!(summary.node_count, nodes);
        assert_eq!(summary.artifact_dirs.len(), nodes);
        for (i, dir) in summary.artifact_dirs.iter().enumerate() {
            assert_eq!(dir, &out.path().join(format!("node-{i}")));
            let source = std::fs::read_to_string(dir.join("source.txt")).unwrap();
            assert_eq!(source, format!("mock-{i}:output"));
        }
    }
}

#[tokio::test]
async fn step_failure_stops_run_and_skips_artifacts() {
    let out = tempfile::tempdir().unwrap();
    let output = out.path().join("output");
    let recorder = Recorder::default();
    let runner = mock_runner(
        MockInfraManager {
            recorder: recorder.clone(),
            ..Default::default()
        },
        MockWorkerManager {
            recorder: recorder.clone(),
            failing_task: Some("load-1".into()),
            ..Default::default()
        },
        &output,
    );

    let err = runner.run_test(&server_client_test, 3).await.unwrap_err();

    match err {
        HarnessError::Step { phase, index, .. } => {
            assert_eq!(phase, Phase::Workload);
            assert_eq!(index, 0);
        }
        other => panic!("expected Step error, got {other:?}"),
    }
    assert_eq!(recorder.count("execute:load-2:client+server"), 0);
    assert_eq!(recorder.count("execute:stop:server"), 0);
    assert!(recorder.events().iter().all(|e| !e.starts_with("copy:")));
    assert!(!output.exists(), "no artifact directory for a failed run");

    assert_eq!(recorder.count("workers.close"), 1);
    assert_eq!(recorder.count("infra.close"), 1);
    assert!(recorder.position("workers.close") < recorder.position("infra.close"));
}

#[tokio::test]
async fn artifact_failure_releases_and_leaves_no_output() {
    let out = tempfile::tempdir().unwrap();
    let output = out.path().join("output");
    let recorder = Recorder::default();
    let runner = mock_runner(
        MockInfraManager {
            recorder: recorder.clone(),
            fail_copy_at: Some(1),
            ..Default::default()
        },
        MockWorkerManager {
            recorder: recorder.clone(),
            ..Default::default()
        },
        &output,
    );

    let err = runner.run_test(&server_client_test, 3).await.unwrap_err();

    assert!(matches!(
        err,
        HarnessError::Artifact {
            node: 1,
            source: InfraError::MissingPath { .. }
        }
    ));
    assert_eq!(recorder.count("copy:mock-0"), 1);
    assert_eq!(recorder.count("copy:mock-2"), 0);
    assert_eq!(recorder.count("workers.close"), 1);
    assert_eq!(recorder.count("infra.close"), 1);
    assert!(recorder.position("workers.close") < recorder.position("infra.close"));
    assert!(!output.exists(), "failed retrieval must not leave an output directory");
}

#[tokio::test]
async fn artifact_failure_keeps_previous_run_intact() {
    let out = tempfile::tempdir().unwrap();
    let good = mock_runner(MockInfraManager::default(), MockWorkerManager::default(), out.path());
    good.run_test(&server_client_test, 2).await.unwrap();

    let failing = mock_runner(
        MockInfraManager {
            fail_copy_at: Some(2),
            ..Default::default()
        },
        MockWorkerManager::default(),
        out.path(),
    );
    let err = failing.run_test(&server_client_test, 3).await.unwrap_err();

    assert!(matches!(err, HarnessError::Artifact { node: 2, .. }));
    assert_eq!(listing(out.path()), vec!["node-0", "node-1"]);
    let source = std::fs::read_to_string(out.path().join("node-1/source.txt")).unwrap();
    assert_eq!(source, "mock-1:output");
}

#[tokio::test]
async fn smaller_rerun_leaves_exactly_its_own_nodes() {
    let out = tempfile::tempdir().unwrap();
    std::fs::write(out.path().join("notes.txt"), "kept").unwrap();
    let runner = mock_runner(MockInfraManager::default(), MockWorkerManager::default(), out.path());

    runner.run_test(&server_client_test, 3).await.unwrap();
    assert_eq!(listing(out.path()), vec!["node-0", "node-1", "node-2", "notes.txt"]);

    let summary = runner.run_test(&server_client_test, 1).await.unwrap();
    assert_eq!(summary.artifact_dirs, vec![out.path().join("node-0")]);
    assert_eq!(listing(out.path()), vec!["node-0", "notes.txt"]);
}

#[tokio::test]
async fn launch_failure_still_releases_cluster() {
    let out = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let runner = mock_runner(
        MockInfraManager {
            recorder: recorder.clone(),
            ..Default::default()
        },
        MockWorkerManager {
            recorder: recorder.clone(),
            fail_launch: true,
            ..Default::default()
        },
        out.path(),
    );

    let err = runner.run_test(&server_client_test, 2).await.unwrap_err();

    assert!(matches!(err, HarnessError::Launch(WorkerError::NoNodes(3))));
    assert_eq!(recorder.count("workers.close"), 0);
    assert_eq!(recorder.count("infra.close"), 1);
    assert!(recorder.events().iter().all(|e| !e.starts_with("execute:")));
}

#[tokio::test]
async fn provisioning_failure_attempts_nothing_else() {
    let out = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let runner = mock_runner(
        MockInfraManager {
            recorder: recorder.clone(),
            fail_create: true,
            ..Default::default()
        },
        MockWorkerManager {
            recorder: recorder.clone(),
            ..Default::default()
        },
        out.path(),
    );

    let err = runner.run_test(&server_client_test, 5).await.unwrap_err();

    assert!(matches!(err, HarnessError::Provision(InfraError::InsufficientHosts { .. })));
    assert_eq!(recorder.events(), vec!["infra.create:5"]);
}

#[tokio::test]
async fn unknown_role_fails_before_launch() {
    let out = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let runner = mock_runner(
        MockInfraManager {
            recorder: recorder.clone(),
            ..Default::default()
        },
        MockWorkerManager {
            recorder: recorder.clone(),
            ..Default::default()
        },
        out.path(),
    );

    let test = |config: &mut TestConfig| {
        config.role("client", 1);
        config.workload(CommandTask::new("true"), ["locator"]);
    };
    let err = runner.run_test(&test, 1).await.unwrap_err();

    assert!(matches!(err, HarnessError::Config(_)));
    assert_eq!(recorder.events(), vec!["infra.create:1", "infra.close"]);
}

#[tokio::test]
async fn panicking_definition_still_releases_cluster() {
    let out = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let runner = mock_runner(
        MockInfraManager {
            recorder: recorder.clone(),
            ..Default::default()
        },
        MockWorkerManager {
            recorder: recorder.clone(),
            ..Default::default()
        },
        out.path(),
    );

    let test = |_config: &mut TestConfig| panic!("broken definition");
    let err = runner.run_test(&test, 1).await.unwrap_err();

    assert!(matches!(err, HarnessError::Config(_)));
    assert_eq!(recorder.count("infra.close"), 1);
}

#[tokio::test]
async fn release_failures_do_not_mask_original_error() {
    let out = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let runner = mock_runner(
        MockInfraManager {
            recorder: recorder.clone(),
            fail_close: true,
            ..Default::default()
        },
        MockWorkerManager {
            recorder: recorder.clone(),
            fail_close: true,
            failing_task: Some("start".into()),
            ..Default::default()
        },
        out.path(),
    );

    let err = runner.run_test(&server_client_test, 1).await.unwrap_err();

    assert!(matches!(err.primary(), HarnessError::Step { phase: Phase::Setup, .. }));
    let suppressed = err.suppressed();
    assert_eq!(suppressed.len(), 2);
    assert!(matches!(suppressed[0], ReleaseError::Workers(_)));
    assert!(matches!(suppressed[1], ReleaseError::Infra(_)));
    assert_eq!(recorder.count("workers.close"), 1);
    assert_eq!(recorder.count("infra.close"), 1);
}

#[tokio::test]
async fn release_failure_after_success_fails_the_run() {
    let out = tempfile::tempdir().unwrap();
    let runner = mock_runner(
        MockInfraManager {
            fail_close: true,
            ..Default::default()
        },
        MockWorkerManager::default(),
        out.path(),
    );

    let err = runner.run_test(&server_client_test, 1).await.unwrap_err();
    assert!(matches!(err, HarnessError::Release(ReleaseError::Infra(_))));
}

// ============================================================================
// Local clusters
// ============================================================================

struct LocalRun {
    _base: tempfile::TempDir,
    nodes_dir: PathBuf,
    output: PathBuf,
    runner: TestRunner,
}

fn local_run() -> LocalRun {
    let base = tempfile::tempdir().unwrap();
    let nodes_dir = base.path().join("nodes");
    std::fs::create_dir_all(&nodes_dir).unwrap();
    let output = base.path().join("output");
    let runner = TestRunner::new(LocalInfraManager::with_base_dir(&nodes_dir), NodeWorkerManager::new())
        .with_output_dir(&output);
    LocalRun {
        _base: base,
        nodes_dir,
        output,
        runner,
    }
}

fn dir_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

/// 3 nodes, one server and two clients, a workload on the clients only.
#[tokio::test]
async fn scenario_a_clients_run_workload_and_artifacts_are_collected() {
    let run = local_run();

    let test = |config: &mut TestConfig| {
        config.role("server", 1).role("client", 2);
        config.workload(
            CommandTask::named(
                "t1",
                "echo \"$PERF_ROLE\" > \"$PERF_OUTPUT_DIR/worker-$PERF_WORKER_ID.txt\"",
            ),
            ["client"],
        );
    };

    let summary = run.runner.run_test(&test, 3).await.unwrap();

    assert_eq!(summary.node_count, 3);
    assert_eq!(summary.worker_count, 3);
    assert_eq!(summary.artifact_dirs.len(), 3);
    for i in 0..3 {
        assert!(run.output.join(format!("node-{i}")).is_dir());
    }
    // Clients are workers 0 and 1 on nodes 0 and 1; the server sits on node 2.
    let client0 = std::fs::read_to_string(run.output.join("node-0/worker-0.txt")).unwrap();
    let client1 = std::fs::read_to_string(run.output.join("node-1/worker-1.txt")).unwrap();
    assert_eq!(client0.trim(), "client");
    assert_eq!(client1.trim(), "client");
    assert!(dir_is_empty(&run.output.join("node-2")));

    assert!(dir_is_empty(&run.nodes_dir), "node directories must be released");

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["node_count"], 3);
    assert_eq!(json["artifact_dirs"].as_array().unwrap().len(), 3);
}

/// Same cluster, but the workload fails on one client.
#[tokio::test]
async fn scenario_b_failed_workload_skips_teardown_and_artifacts() {
    let run = local_run();
    let marker_dir = tempfile::tempdir().unwrap();
    let teardown_marker = marker_dir.path().join("teardown-ran");

    let teardown_cmd = format!("touch '{}'", teardown_marker.display());
    let test = move |config: &mut TestConfig| {
        config.role("server", 1).role("client", 2);
        config.workload(
            CommandTask::named("t1", "test \"$PERF_WORKER_ID\" != 1"),
            ["client"],
        );
        config.teardown(CommandTask::named("stop", teardown_cmd.clone()), ["server"]);
    };

    let err = run.runner.run_test(&test, 3).await.unwrap_err();

    match err {
        HarnessError::Step {
            phase: Phase::Workload,
            index: 0,
            source: WorkerError::TaskFailed { targeted, failures, .. },
        } => {
            assert_eq!(targeted, 2);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].worker, WorkerId::new(1));
        }
        other => panic!("expected workload step failure, got {other:?}"),
    }
    assert!(!teardown_marker.exists(), "teardown must not run");
    assert!(!run.output.exists(), "no output directory for a failed run");
    assert!(dir_is_empty(&run.nodes_dir), "node directories must be released");
}

/// Two workload steps on the same role never overlap.
#[tokio::test]
async fn scenario_c_sequential_steps_do_not_overlap() {
    let run = local_run();
    let log: Arc<Mutex<Vec<String>>> = Arc::default();

    let step = |label: &'static str, pause_ms: u64, log: Arc<Mutex<Vec<String>>>| {
        task_fn(label, move |ctx: TaskContext| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("start:{label}:{}", ctx.worker_id()));
                tokio::time::sleep(Duration::from_millis(pause_ms)).await;
                log.lock().unwrap().push(format!("end:{label}:{}", ctx.worker_id()));
                Ok::<(), TaskError>(())
            }
        })
    };
    let first = Arc::new(step("first", 100, Arc::clone(&log)));
    let second = Arc::new(step("second", 0, Arc::clone(&log)));

    let test = move |config: &mut TestConfig| {
        config.role("client", 2);
        config.workload(Arc::clone(&first), ["client"]);
        config.workload(Arc::clone(&second), ["client"]);
    };

    run.runner.run_test(&test, 2).await.unwrap();

    let log = log.lock().unwrap().clone();
    assert_eq!(log.len(), 8);
    let last_first_end = log.iter().rposition(|e| e.starts_with("end:first")).unwrap();
    let first_second_start = log.iter().position(|e| e.starts_with("start:second")).unwrap();
    assert!(
        last_first_end < first_second_start,
        "second step started before first finished: {log:?}"
    );
}

#[tokio::test]
async fn rerun_replaces_stale_artifacts() {
    let run = local_run();
    let stale = run.output.join("node-0/stale.txt");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, "old").unwrap();

    let test = |config: &mut TestConfig| {
        config.role("client", 1);
        config.workload(CommandTask::new("echo fresh > \"$PERF_OUTPUT_DIR/fresh.txt\""), ["client"]);
    };
    run.runner.run_test(&test, 1).await.unwrap();

    assert!(!stale.exists());
    assert!(run.output.join("node-0/fresh.txt").exists());
}

#[tokio::test]
async fn local_rerun_with_fewer_nodes_drops_old_node_dirs() {
    let run = local_run();
    let test = |config: &mut TestConfig| {
        config.role("client", 1);
        config.workload(CommandTask::new("echo hi > \"$PERF_OUTPUT_DIR/hi.txt\""), ["client"]);
    };

    run.runner.run_test(&test, 3).await.unwrap();
    assert_eq!(listing(&run.output), vec!["node-0", "node-1", "node-2"]);

    run.runner.run_test(&test, 1).await.unwrap();
    assert_eq!(listing(&run.output), vec!["node-0"]);
    assert!(run.output.join("node-0/hi.txt").exists());
}

#[tokio::test]
async fn local_missing_node_output_fails_without_artifacts() {
    let run = local_run();
    let test = |config: &mut TestConfig| {
        config.role("client", 2);
        config.workload(CommandTask::new("rm -rf \"$PERF_OUTPUT_DIR\""), ["client"]);
    };

    let err = run.runner.run_test(&test, 2).await.unwrap_err();

    assert!(matches!(err, HarnessError::Artifact { node: 0, .. }));
    assert!(!run.output.exists());
    assert!(dir_is_empty(&run.nodes_dir), "node directories must be released");
}

#[tokio::test]
async fn zero_nodes_is_a_provisioning_error() {
    let run = local_run();
    let test = |config: &mut TestConfig| {
        config.role("client", 1);
    };
    let err = run.runner.run_test(&test, 0).await.unwrap_err();
    assert!(matches!(err, HarnessError::Provision(InfraError::InvalidNodeCount(0))));
}
