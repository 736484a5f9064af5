//! Declarative test definitions.
//!
//! A [`PerformanceTest`] fills in a [`TestConfig`]: how many workers of each
//! role to start, and which tasks to run against which roles during the
//! setup, workload and teardown phases.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::config::ConfigError;
use crate::task::Task;

/// A performance test, described declaratively.
pub trait PerformanceTest {
    /// Declare roles and phase steps on an empty config.
    fn configure(&self, config: &mut TestConfig);
}

impl<F> PerformanceTest for F
where
    F: Fn(&mut TestConfig),
{
    fn configure(&self, config: &mut TestConfig) {
        self(config)
    }
}

/// Stage of a test run. Phases always run in declaration order of this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Runs before the workload.
    Setup,
    /// The measured workload.
    Workload,
    /// Runs after the workload.
    Teardown,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 3] = [Phase::Setup, Phase::Workload, Phase::Teardown];

    /// Lowercase phase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Workload => "workload",
            Phase::Teardown => "teardown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task paired with the roles it runs on.
#[derive(Clone)]
pub struct TestStep {
    task: Arc<dyn Task>,
    roles: BTreeSet<String>,
}

impl TestStep {
    /// Create a step running `task` on every worker of the given roles.
    pub fn new<T, I, S>(task: T, roles: I) -> Self
    where
        T: Task + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            task: Arc::new(task),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    /// The task to run.
    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    /// Roles whose workers run the task.
    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }
}

impl fmt::Debug for TestStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestStep")
            .field("task", &self.task.name())
            .field("roles", &self.roles)
            .finish()
    }
}

/// Roles and phase steps of a test.
#[derive(Debug, Clone, Default)]
pub struct TestConfig {
    roles: BTreeMap<String, usize>,
    setup: Vec<TestStep>,
    workload: Vec<TestStep>,
    teardown: Vec<TestStep>,
}

impl TestConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a role with the number of workers to start for it.
    ///
    /// Declaring the same role again replaces its count.
    pub fn role(&mut self, name: impl Into<String>, count: usize) -> &mut Self {
        self.roles.insert(name.into(), count);
        self
    }

    /// Append a setup step.
    pub fn setup<T, I, S>(&mut self, task: T, roles: I) -> &mut Self
    where
        T: Task + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.step(Phase::Setup, TestStep::new(task, roles))
    }

    /// Append a workload step.
    pub fn workload<T, I, S>(&mut self, task: T, roles: I) -> &mut Self
    where
        T: Task + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.step(Phase::Workload, TestStep::new(task, roles))
    }

    /// Append a teardown step.
    pub fn teardown<T, I, S>(&mut self, task: T, roles: I) -> &mut Self
    where
        T: Task + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.step(Phase::Teardown, TestStep::new(task, roles))
    }

    /// Append a step to the given phase.
    pub fn step(&mut self, phase: Phase, step: TestStep) -> &mut Self {
        self.steps_mut(phase).push(step);
        self
    }

    /// Role name to worker count.
    pub fn roles(&self) -> &BTreeMap<String, usize> {
        &self.roles
    }

    /// Steps of a phase, in declaration order.
    pub fn steps(&self, phase: Phase) -> &[TestStep] {
        match phase {
            Phase::Setup => &self.setup,
            Phase::Workload => &self.workload,
            Phase::Teardown => &self.teardown,
        }
    }

    /// Total number of workers across all roles.
    pub fn worker_count(&self) -> usize {
        self.roles.values().sum()
    }

    /// Check that every step targets at least one role and that every
    /// targeted role is declared.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for phase in Phase::ALL {
            for (step, test_step) in self.steps(phase).iter().enumerate() {
                if test_step.roles.is_empty() {
                    return Err(ConfigError::EmptyRoles { phase, step });
                }
                if let Some(role) = test_step
                    .roles
                    .iter()
                    .find(|role| !self.roles.contains_key(*role))
                {
                    return Err(ConfigError::UnknownRole {
                        phase,
                        step,
                        role: role.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn steps_mut(&mut self, phase: Phase) -> &mut Vec<TestStep> {
        match phase {
            Phase::Setup => &mut self.setup,
            Phase::Workload => &mut self.workload,
            Phase::Teardown => &mut self.teardown,
        }
    }
}
