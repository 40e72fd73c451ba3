//! Simulation orchestrator
//!
//! Runs up to `num_concurrent` run simulators in parallel against one
//! global scheduler and one shared state tree. The main loop hands out
//! "start next run" tokens until the run budget is spent, the scheduler is
//! exhausted, or a run error aborts the simulation.

mod config;
mod executor;
mod failure;
mod rng;

pub use config::{ConfigError, SchedulerKind, SimulationConfig};
pub use executor::{
    NodeFactory, Request, RunError, RunOptions, RunReport, RunSimulator, RunStatus,
};
pub use failure::{CrashCallback, FailureError, FailureManager, FailureSpec};
pub use rng::DeterministicRng;

use crate::checker::{CheckError, CheckerResponse, PredicateChecker};
use crate::node::{Node, NodeId, Params};
use crate::params::SimulationParameters;
use crate::scheduler::{GlobalScheduler, PrefixScheduler};
use crate::state::{StateEq, StateManager, TreeStats};
use crossbeam::channel::unbounded;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Outcome of one `simulate` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationReport {
    /// Runs that completed and were merged into the tree
    pub runs: u64,
    pub failed_runs: u64,
    /// Runs cut short by the depth budget
    pub depth_limited: u64,
    /// The scheduler ran out of work before the run budget
    pub exhausted: bool,
    pub tree: TreeStats,
}

#[derive(Debug)]
pub enum SimulationError {
    /// First run error, aborting the simulation
    Run(RunError),
    /// Every run error collected with `ignore_errors`
    Aggregate {
        errors: Vec<RunError>,
        report: SimulationReport,
    },
    /// `simulate` called while another call is in progress
    AlreadyRunning,
    Config(ConfigError),
    Spawn(String),
}

impl fmt::Display for SimulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationError::Run(e) => write!(f, "simulation aborted: {}", e),
            SimulationError::Aggregate { errors, report } => {
                write!(
                    f,
                    "{} of {} runs failed",
                    errors.len(),
                    report.runs + report.failed_runs
                )?;
                for e in errors {
                    write!(f, "\n  - {}", e)?;
                }
                Ok(())
            }
            SimulationError::AlreadyRunning => write!(f, "a simulation is already running on this engine"),
            SimulationError::Config(e) => write!(f, "{}", e),
            SimulationError::Spawn(e) => write!(f, "cannot spawn run worker: {}", e),
        }
    }
}

impl std::error::Error for SimulationError {}

impl From<RunError> for SimulationError {
    fn from(e: RunError) -> Self {
        SimulationError::Run(e)
    }
}

impl From<ConfigError> for SimulationError {
    fn from(e: ConfigError) -> Self {
        SimulationError::Config(e)
    }
}

/// Clears the running flag when a simulation returns or unwinds.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

type WorkerResult = Result<Result<RunStatus, RunError>, Box<dyn Any + Send>>;

/// Model-checking engine for one algorithm
pub struct Simulator<N: Node> {
    config: SimulationConfig,
    scheduler: Arc<dyn GlobalScheduler>,
    states: Arc<StateManager<N::State>>,
    factory: NodeFactory<N>,
    requests: Vec<Request>,
    running: AtomicBool,
}

impl<N: Node> Simulator<N> {
    /// Exhaustive exploration with the default configuration.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&SimulationParameters) -> Vec<Arc<N>> + Send + Sync + 'static,
    {
        Simulator {
            config: SimulationConfig::default(),
            scheduler: Arc::new(PrefixScheduler::new()),
            states: Arc::new(StateManager::new()),
            factory: Arc::new(factory),
            requests: Vec::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Engine whose scheduler is built from `config.scheduler`.
    pub fn from_config<F>(config: SimulationConfig, factory: F) -> Result<Self, ConfigError>
    where
        F: Fn(&SimulationParameters) -> Vec<Arc<N>> + Send + Sync + 'static,
    {
        config.validate()?;
        let scheduler = config.build_scheduler()?;
        Ok(Simulator {
            config,
            scheduler,
            ..Self::new(factory)
        })
    }

    /// Replace budgets and error policy. The scheduler is kept.
    ///
    /// A non-empty `config.failures` replaces the crash set; otherwise crashes
    /// added earlier with [`Simulator::with_crash`] are kept.
    pub fn with_config(mut self, config: SimulationConfig) -> Self {
        let crashes = std::mem::take(&mut self.config.failures);
        self.config = config;
        if self.config.failures.crash.is_empty() {
            self.config.failures = crashes;
        }
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn GlobalScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Compare local states with `eq` instead of `PartialEq` when merging.
    pub fn with_equality(mut self, eq: StateEq<N::State>) -> Self {
        self.states = Arc::new(StateManager::with_equality(eq));
        self
    }

    pub fn with_request(mut self, target: usize, method: &str, params: Params) -> Self {
        self.requests.push(Request::new(target, method, params));
        self
    }

    /// Crash `node` at some point of every run.
    pub fn with_crash(mut self, node: usize) -> Self {
        self.config.failures.crash.push(NodeId(node));
        self
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<dyn GlobalScheduler> {
        &self.scheduler
    }

    /// State tree of the latest simulation
    pub fn states(&self) -> &Arc<StateManager<N::State>> {
        &self.states
    }

    /// Explore runs until the budget is spent or the scheduler is exhausted.
    ///
    /// Scheduler and state tree are reset first, so repeated calls start
    /// clean. A panic in node code is propagated when `ignore_panics` is
    /// set.
    pub fn simulate(&self) -> Result<SimulationReport, SimulationError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SimulationError::AlreadyRunning);
        }
        let _running = Running(&self.running);
        self.config.validate()?;

        self.scheduler.reset();
        self.states.reset();

        let runner = RunSimulator::new(
            self.factory.clone(),
            self.requests.clone(),
            self.states.clone(),
            self.config.failures.clone(),
            RunOptions::from_config(&self.config),
        );
        info!(
            scheduler = self.scheduler.name(),
            max_runs = ?self.config.max_runs,
            max_depth = self.config.max_depth,
            workers = self.config.num_concurrent,
            "simulation started"
        );

        let mut report = SimulationReport {
            runs: 0,
            failed_runs: 0,
            depth_limited: 0,
            exhausted: false,
            tree: TreeStats::default(),
        };
        let mut errors = Vec::new();
        let mut abort: Option<RunError> = None;
        let mut propagated: Option<Box<dyn Any + Send>> = None;

        let spawned = thread::scope(|scope| -> Result<(), SimulationError> {
            let (token_tx, token_rx) = unbounded::<u64>();
            let (result_tx, result_rx) = unbounded::<(u64, WorkerResult)>();

            for worker in 0..self.config.num_concurrent {
                let token_rx = token_rx.clone();
                let result_tx = result_tx.clone();
                let runner = &runner;
                let scheduler = &self.scheduler;
                thread::Builder::new()
                    .name(format!("simcheck-worker-{}", worker))
                    .spawn_scoped(scope, move || {
                        for ordinal in token_rx.iter() {
                            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                                runner.run(scheduler.run_scheduler())
                            }));
                            if result_tx.send((ordinal, outcome)).is_err() {
                                break;
                            }
                        }
                    })
                    .map_err(|e| SimulationError::Spawn(e.to_string()))?;
            }
            drop(result_tx);

            let budget = self.config.max_runs.unwrap_or(u64::MAX);
            let mut issued = 0u64;
            let mut outstanding = 0usize;
            while issued < budget && outstanding < self.config.num_concurrent {
                if token_tx.send(issued).is_err() {
                    break;
                }
                issued += 1;
                outstanding += 1;
            }

            while outstanding > 0 {
                let Ok((ordinal, outcome)) = result_rx.recv() else {
                    break;
                };
                outstanding -= 1;

                match outcome {
                    Ok(Ok(RunStatus::Completed(run))) => {
                        report.runs += 1;
                        if run.depth_limited {
                            report.depth_limited += 1;
                        }
                        debug!(ordinal, steps = run.steps, new_states = run.new_states, "run merged");
                    }
                    Ok(Ok(RunStatus::Exhausted)) => report.exhausted = true,
                    Ok(Err(e)) => {
                        report.failed_runs += 1;
                        warn!(ordinal, error = %e, "run failed");
                        if self.config.ignore_errors {
                            errors.push(e);
                        } else if abort.is_none() {
                            abort = Some(e);
                        }
                    }
                    Err(payload) => {
                        if propagated.is_none() {
                            propagated = Some(payload);
                        }
                    }
                }

                let stopping = abort.is_some() || propagated.is_some() || report.exhausted;
                if !stopping && issued < budget && token_tx.send(issued).is_ok() {
                    issued += 1;
                    outstanding += 1;
                }
            }
            // Closing the token channel stops the workers.
            drop(token_tx);
            Ok(())
        });

        if let Some(payload) = propagated {
            panic::resume_unwind(payload);
        }
        spawned?;

        report.tree = self.states.stats();
        info!(
            runs = report.runs,
            failed = report.failed_runs,
            exhausted = report.exhausted,
            states = report.tree.nodes,
            "simulation finished"
        );

        if let Some(e) = abort {
            return Err(SimulationError::Run(e));
        }
        if !errors.is_empty() {
            return Err(SimulationError::Aggregate { errors, report });
        }
        Ok(report)
    }

    /// Check `checker` against the tree of the latest simulation.
    pub fn check(&self, checker: &PredicateChecker<N::State>) -> Result<CheckerResponse<N::State>, CheckError> {
        checker.check(&self.states.read())
    }

    /// Parenthesized rendering of the latest state tree
    pub fn export_tree(&self) -> String {
        self.states.export()
    }
}

impl<N: Node> fmt::Debug for Simulator<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulator")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler.name())
            .field("requests", &self.requests)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}
