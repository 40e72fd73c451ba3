//! Run Simulator
//!
//! Drives one run from node construction to teardown:
//! - Builds the nodes with run-scoped [`SimulationParameters`]
//! - Schedules one event per request, then the configured crashes
//! - Executes one event at a time, each on its own thread, blocking until
//!   the step's completion signal arrives
//! - Records a global state after every step and merges the trace into
//!   the shared state tree, including the prefix executed by a failed run
//! - Reports panics raised by step threads after their step completed

use super::config::SimulationConfig;
use super::failure::{FailureError, FailureManager, FailureSpec};
use crate::event::step::{self, StepFailure, StepOutcome};
use crate::event::{CompletionSignal, Event, EventId, EventRecord, HandlerEvent, SendTracker};
use crate::node::{Node, NodeError, NodeHandle, NodeId, Params};
use crate::params::SimulationParameters;
use crate::scheduler::{RunScheduler, SchedulerError};
use crate::state::{GlobalState, Run, RunTrace, StateError, StateManager};
use crossbeam::channel::{unbounded, Receiver};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Builds the nodes of one run; node `i` gets id `NodeId(i)`.
pub type NodeFactory<N> = Arc<dyn Fn(&SimulationParameters) -> Vec<Arc<N>> + Send + Sync>;

/// External stimulus scheduled at the start of every run
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub target: NodeId,
    pub method: String,
    pub params: Params,
}

impl Request {
    pub fn new(target: usize, method: &str, params: Params) -> Self {
        Request {
            target: NodeId(target),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub max_depth: usize,
    pub ignore_panics: bool,
    pub event_timeout: Option<Duration>,
}

impl RunOptions {
    pub fn from_config(config: &SimulationConfig) -> Self {
        RunOptions {
            max_depth: config.max_depth,
            ignore_panics: config.ignore_panics,
            event_timeout: config.event_timeout(),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&SimulationConfig::default())
    }
}

/// Error that aborts one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    /// No request targets a node of the run
    NoValidRequests,
    /// Event addressed to a node absent from the run
    UnknownTarget { event: EventId, target: NodeId },
    Scheduler(SchedulerError),
    Node { event: EventId, error: NodeError },
    Failure(FailureError),
    /// Node code panicked while executing `event`
    Panic {
        event: EventId,
        message: String,
        backtrace: String,
    },
    /// The step never signalled completion
    Stalled {
        event: EventId,
        waited: Option<Duration>,
    },
    State(StateError),
    Spawn(String),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::NoValidRequests => write!(f, "no request targets an existing node"),
            RunError::UnknownTarget { event, target } => {
                write!(f, "event {} targets unknown node {}", event, target)
            }
            RunError::Scheduler(e) => write!(f, "scheduler error: {}", e),
            RunError::Node { event, error } => write!(f, "event {} failed: {}", event, error),
            RunError::Failure(e) => write!(f, "failure manager error: {}", e),
            RunError::Panic { event, message, .. } => {
                write!(f, "event {} panicked: {}", event, message)
            }
            RunError::Stalled {
                event,
                waited: Some(waited),
            } => write!(f, "event {} did not complete within {:?}", event, waited),
            RunError::Stalled { event, waited: None } => {
                write!(f, "event {} can no longer complete", event)
            }
            RunError::State(e) => write!(f, "state tree error: {}", e),
            RunError::Spawn(e) => write!(f, "cannot spawn execution thread: {}", e),
        }
    }
}

impl std::error::Error for RunError {}

impl From<SchedulerError> for RunError {
    fn from(e: SchedulerError) -> Self {
        RunError::Scheduler(e)
    }
}

impl From<FailureError> for RunError {
    fn from(e: FailureError) -> Self {
        RunError::Failure(e)
    }
}

impl From<StateError> for RunError {
    fn from(e: StateError) -> Self {
        RunError::State(e)
    }
}

/// Summary of a completed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run: Run,
    pub steps: usize,
    /// Events were still pending when the depth budget ran out
    pub depth_limited: bool,
    /// Global states this run added to the tree
    pub new_states: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed(RunReport),
    /// The scheduler has no runs left to hand out
    Exhausted,
}

enum Abort {
    Error(RunError),
    /// Node panic to resume on the driving thread
    Panic(Box<dyn Any + Send>),
}

impl From<RunError> for Abort {
    fn from(e: RunError) -> Self {
        Abort::Error(e)
    }
}

impl From<SchedulerError> for Abort {
    fn from(e: SchedulerError) -> Self {
        Abort::Error(e.into())
    }
}

impl From<FailureError> for Abort {
    fn from(e: FailureError) -> Self {
        Abort::Error(e.into())
    }
}

impl From<StateError> for Abort {
    fn from(e: StateError) -> Self {
        Abort::Error(e.into())
    }
}

/// Step threads of one run.
///
/// Tracks how many are still alive, and keeps the first panic raised by a
/// thread whose step had already completed.
#[derive(Default)]
struct StepThreads {
    live: Mutex<usize>,
    idle: Condvar,
    late: Mutex<Option<(EventId, StepFailure)>>,
}

impl StepThreads {
    fn started(&self) {
        *self.live.lock() += 1;
    }

    fn finished(&self) {
        let mut live = self.live.lock();
        *live = live.saturating_sub(1);
        if *live == 0 {
            self.idle.notify_all();
        }
    }

    fn record_late(&self, event: EventId, failure: StepFailure) {
        let mut late = self.late.lock();
        if late.is_none() {
            *late = Some((event, failure));
        } else {
            debug!(event = %event, ?failure, "further late failure dropped");
        }
    }

    fn take_late(&self) -> Option<(EventId, StepFailure)> {
        self.late.lock().take()
    }

    /// Wait for every step thread to exit; `false` if `timeout` ran out first.
    fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut live = self.live.lock();
        while *live > 0 {
            match deadline {
                Some(deadline) => {
                    if self.idle.wait_until(&mut live, deadline).timed_out() {
                        return *live == 0;
                    }
                }
                None => self.idle.wait(&mut live),
            }
        }
        true
    }
}

/// Decrements the live count when a step thread exits.
struct StepExit(Arc<StepThreads>);

impl Drop for StepExit {
    fn drop(&mut self) {
        self.0.finished();
    }
}

/// Calls `end_run` on every exit path, unwinding included.
struct EndRun(Arc<dyn RunScheduler>);

impl Drop for EndRun {
    fn drop(&mut self) {
        self.0.end_run();
    }
}

/// Drives single runs of `N` against the shared state tree
pub struct RunSimulator<N: Node> {
    factory: NodeFactory<N>,
    requests: Arc<Vec<Request>>,
    states: Arc<StateManager<N::State>>,
    failures: FailureSpec,
    options: RunOptions,
}

impl<N: Node> RunSimulator<N> {
    pub fn new(
        factory: NodeFactory<N>,
        requests: Vec<Request>,
        states: Arc<StateManager<N::State>>,
        failures: FailureSpec,
        options: RunOptions,
    ) -> Self {
        RunSimulator {
            factory,
            requests: Arc::new(requests),
            states,
            failures,
            options,
        }
    }

    pub fn options(&self) -> RunOptions {
        self.options
    }

    /// Execute one run against `scheduler`.
    ///
    /// With `ignore_panics` set, a panic in node code is resumed here after
    /// teardown instead of being returned as [`RunError::Panic`].
    pub fn run(&self, scheduler: Arc<dyn RunScheduler>) -> Result<RunStatus, RunError> {
        match scheduler.start_run() {
            Ok(()) => {}
            Err(SchedulerError::NoRunsRemaining) => return Ok(RunStatus::Exhausted),
            Err(e) => return Err(e.into()),
        }
        let end_run = EndRun(scheduler.clone());

        let sends = Arc::new(SendTracker::new());
        let failures = Arc::new(FailureManager::new(self.failures.clone(), scheduler.clone()));
        let params = SimulationParameters::new(scheduler.clone(), failures.clone(), sends.clone());
        let nodes = (self.factory)(&params);
        let threads = Arc::new(StepThreads::default());

        let mut trace = None;
        let driven = self.drive(&scheduler, &failures, &sends, &threads, &nodes, &mut trace);

        stop_correct_nodes(&nodes, &failures);
        drop(end_run);
        failures.end_run();

        // Parked sleepers were released by `end_run`.
        if !threads.wait_idle(self.options.event_timeout) {
            warn!("step threads still running at the end of the run");
        }
        let driven = match (driven, threads.take_late()) {
            (Ok(_), Some((event, failure))) => Err(self.step_failure(event, failure)),
            (driven, Some((event, failure))) => {
                debug!(event = %event, ?failure, "late failure after run abort");
                driven
            }
            (driven, None) => driven,
        };

        // Whatever the run executed is explored state, failed or not.
        let merged = match trace.as_ref().map(|trace| self.states.end_run(trace)) {
            Some(Ok(merged)) => Some(merged),
            Some(Err(e)) if driven.is_ok() => return Err(e.into()),
            Some(Err(e)) => {
                warn!(error = %e, "partial run not merged");
                None
            }
            None => None,
        };

        let depth_limited = match driven {
            Ok(depth_limited) => depth_limited,
            Err(Abort::Error(e)) => {
                debug!(error = %e, "run aborted");
                return Err(e);
            }
            Err(Abort::Panic(payload)) => panic::resume_unwind(payload),
        };
        let (Some(run_trace), Some(merged)) = (trace, merged) else {
            return Err(StateError::NotSeeded.into());
        };
        debug!(
            steps = run_trace.steps(),
            depth_limited,
            new_states = merged.new_nodes,
            "run completed"
        );
        Ok(RunStatus::Completed(RunReport {
            run: run_trace.run(),
            steps: run_trace.steps(),
            depth_limited,
            new_states: merged.new_nodes,
        }))
    }

    /// Execute the steps of one run, recording into `trace` as it goes so
    /// the caller still holds the executed prefix when a step fails.
    /// Returns whether the depth budget cut the run short.
    fn drive(
        &self,
        scheduler: &Arc<dyn RunScheduler>,
        failures: &Arc<FailureManager>,
        sends: &Arc<SendTracker>,
        threads: &Arc<StepThreads>,
        nodes: &[Arc<N>],
        trace: &mut Option<RunTrace<N::State>>,
    ) -> Result<bool, Abort> {
        let node_ids: Vec<NodeId> = (0..nodes.len()).map(NodeId).collect();
        let all_correct: BTreeMap<NodeId, bool> = node_ids.iter().map(|&id| (id, true)).collect();
        let initial = snapshot(nodes, &all_correct, None);
        self.states.start_run(&initial)?;
        let run_trace = trace.insert(RunTrace::new(initial));

        let mut scheduled = 0;
        for (seq, request) in self.requests.iter().enumerate() {
            if request.target.0 >= nodes.len() {
                debug!(target_node = %request.target, method = %request.method, "request to unknown node dropped");
                continue;
            }
            scheduler.add_event(Box::new(HandlerEvent::request(
                seq,
                request.target,
                &request.method,
                request.params.clone(),
            )));
            scheduled += 1;
        }
        if scheduled == 0 {
            return Err(RunError::NoValidRequests.into());
        }
        failures.init(node_ids)?;

        let (tx, rx) = unbounded();
        for step_no in 1..=self.options.max_depth as u64 {
            let event = match scheduler.get_event() {
                Ok(event) => event,
                Err(SchedulerError::RunEnded) => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            let record = event.record();
            let node: Arc<dyn NodeHandle> = match nodes.get(record.target.0) {
                Some(node) => node.clone(),
                None => {
                    return Err(RunError::UnknownTarget {
                        event: record.id,
                        target: record.target,
                    }
                    .into())
                }
            };

            let signal = CompletionSignal::new(step_no, tx.clone(), sends.clone());
            spawn_step(step_no, event, record.id.clone(), node, signal, threads.clone())?;

            if let Err(failure) = self.await_step(step_no, &record, &rx)? {
                return Err(self.step_failure(record.id, failure));
            }
            if let Some((event, failure)) = threads.take_late() {
                return Err(self.step_failure(event, failure));
            }

            trace!(step = step_no, event = %record.id, "step completed");
            run_trace.record(snapshot(nodes, &failures.correct_nodes(), Some(record)));
        }

        let depth_limited = scheduler.pending() > 0;
        if depth_limited {
            debug!(max_depth = self.options.max_depth, pending = scheduler.pending(), "depth budget spent");
        }
        Ok(depth_limited)
    }

    fn step_failure(&self, event: EventId, failure: StepFailure) -> Abort {
        match failure {
            StepFailure::Node(error) => RunError::Node { event, error }.into(),
            StepFailure::Crash(e) => e.into(),
            StepFailure::Panic { payload, .. } if self.options.ignore_panics => Abort::Panic(payload),
            StepFailure::Panic {
                message, backtrace, ..
            } => RunError::Panic {
                event,
                message,
                backtrace,
            }
            .into(),
        }
    }

    /// Block until step `step_no` completes. Completions tagged with an
    /// earlier step are discarded.
    fn await_step(
        &self,
        step_no: u64,
        record: &EventRecord,
        rx: &Receiver<(u64, StepOutcome)>,
    ) -> Result<StepOutcome, RunError> {
        let deadline = self.options.event_timeout.map(|t| Instant::now() + t);
        loop {
            let received = match deadline {
                Some(deadline) => rx.recv_deadline(deadline).ok(),
                None => rx.recv().ok(),
            };
            let Some((tag, outcome)) = received else {
                return Err(RunError::Stalled {
                    event: record.id.clone(),
                    waited: self.options.event_timeout,
                });
            };
            if tag == step_no {
                return Ok(outcome);
            }
            debug!(stale = tag, step = step_no, "discarding stale completion");
        }
    }
}

impl<N: Node> fmt::Debug for RunSimulator<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunSimulator")
            .field("requests", &self.requests)
            .field("failures", &self.failures)
            .field("options", &self.options)
            .finish()
    }
}

fn snapshot<N: Node>(
    nodes: &[Arc<N>],
    correct: &BTreeMap<NodeId, bool>,
    causing_event: Option<EventRecord>,
) -> GlobalState<N::State> {
    let local_states = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (NodeId(i), node))
        .filter(|(id, _)| correct.get(id).copied().unwrap_or(false))
        .map(|(id, node)| (id, node.state()))
        .collect();
    GlobalState {
        local_states,
        correct: correct.clone(),
        causing_event,
    }
}

fn stop_correct_nodes<N: Node>(nodes: &[Arc<N>], failures: &FailureManager) {
    let correct = failures.correct_nodes();
    for (i, node) in nodes.iter().enumerate() {
        // Crashed nodes were stopped by their crash event.
        if !correct.get(&NodeId(i)).copied().unwrap_or(true) {
            continue;
        }
        if panic::catch_unwind(AssertUnwindSafe(|| Node::stop(node.as_ref()))).is_err() {
            warn!(node = i, "stop callback panicked");
        }
    }
}

fn spawn_step(
    step_no: u64,
    event: Box<dyn Event>,
    event_id: EventId,
    node: Arc<dyn NodeHandle>,
    signal: CompletionSignal,
    threads: Arc<StepThreads>,
) -> Result<(), RunError> {
    install_panic_hook();
    let fallback = signal.clone();
    threads.started();
    let exit = StepExit(threads.clone());
    thread::Builder::new()
        .name(format!("simcheck-step-{}", step_no))
        .spawn(move || {
            let _exit = exit;
            let executed = panic::catch_unwind(AssertUnwindSafe(|| event.execute(node.as_ref(), signal)));
            if let Err(payload) = executed {
                let failure = StepFailure::Panic {
                    message: panic_message(payload.as_ref()),
                    backtrace: take_backtrace(),
                    payload,
                };
                // A resumed sleeper owes the signal of the step that woke it.
                let owed = step::take().unwrap_or(fallback);
                if let Err(Err(failure)) = owed.try_deliver(Err(failure)) {
                    threads.record_late(event_id, failure);
                }
            }
        })
        .map(|_| ())
        .map_err(|e| RunError::Spawn(e.to_string()))
}

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook that keeps the backtrace of the latest panic per thread.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            let _ = LAST_BACKTRACE.try_with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

fn take_backtrace() -> String {
    LAST_BACKTRACE
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten()
        .unwrap_or_default()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
