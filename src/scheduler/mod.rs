//! Scheduling strategies
//!
//! A [`GlobalScheduler`] is shared by every concurrent run of a simulation
//! and hands each run its own [`RunScheduler`]. The run scheduler owns the
//! pending events of that run and decides which one fires next.
//!
//! - `PrefixScheduler`: systematic depth-first exploration of every
//!   interleaving through a shared stack of unexplored prefixes
//! - `RandomScheduler`: uniform random walk, bounded by the run budget
//! - `ReplayScheduler`: reproduces one recorded run exactly

mod pending;
mod prefix;
mod random;
mod replay;

pub use pending::PendingEvents;
pub use prefix::{PrefixRunScheduler, PrefixScheduler};
pub use random::{RandomRunScheduler, RandomScheduler};
pub use replay::{ReplayRunScheduler, ReplayScheduler};

use crate::event::{Event, EventId};
use crate::node::NodeId;
use std::fmt;
use std::sync::Arc;

/// Scheduler outcome other than an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// No events are pending for this run
    RunEnded,
    /// The whole exploration is exhausted
    NoRunsRemaining,
    /// A prefix could not be replayed: the algorithm under test is not
    /// deterministic
    NonDeterministic {
        position: usize,
        expected: EventId,
        available: Vec<EventId>,
    },
    /// The recorded next event of a replay is not pending
    ReplayDiverged {
        position: usize,
        expected: EventId,
        available: Vec<EventId>,
    },
    /// `get_event` called outside of a started run
    NotStarted,
}

impl SchedulerError {
    /// Run-ending or exploration-ending signals, as opposed to failures
    pub fn is_terminal_signal(&self) -> bool {
        matches!(self, SchedulerError::RunEnded | SchedulerError::NoRunsRemaining)
    }
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::RunEnded => write!(f, "run ended: no pending events"),
            SchedulerError::NoRunsRemaining => write!(f, "no runs remaining"),
            SchedulerError::NonDeterministic {
                position,
                expected,
                available,
            } => write!(
                f,
                "non-deterministic algorithm: prefix event {} at step {} not among pending {:?}",
                expected, position, available
            ),
            SchedulerError::ReplayDiverged {
                position,
                expected,
                available,
            } => write!(
                f,
                "replay diverged: recorded event {} at step {} not among pending {:?}",
                expected, position, available
            ),
            SchedulerError::NotStarted => write!(f, "scheduler used outside of a run"),
        }
    }
}

impl std::error::Error for SchedulerError {}

/// Per-run scheduler. Shared between the driving loop and the execution
/// unit of the current step, hence `&self` everywhere.
pub trait RunScheduler: Send + Sync {
    /// Register a newly produced event. Dropped if its target has crashed
    /// or the run is not active.
    fn add_event(&self, event: Box<dyn Event>);

    /// Next event to execute, [`SchedulerError::RunEnded`] when nothing is
    /// pending.
    fn get_event(&self) -> Result<Box<dyn Event>, SchedulerError>;

    /// Begin a run; [`SchedulerError::NoRunsRemaining`] once the
    /// exploration is exhausted.
    fn start_run(&self) -> Result<(), SchedulerError>;

    fn end_run(&self);

    /// Discard pending events targeting `node` and every later one.
    fn node_crashed(&self, node: NodeId);

    fn pending(&self) -> usize;
}

/// Scheduler shared by all runs of a simulation
pub trait GlobalScheduler: Send + Sync {
    fn run_scheduler(&self) -> Arc<dyn RunScheduler>;

    /// Return to the initial state so a new simulation starts clean.
    fn reset(&self);

    fn name(&self) -> &'static str;
}
