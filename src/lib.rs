//! Model checking for message-passing distributed algorithms.
//!
//! A [`Simulator`] drives user [`Node`]s one event at a time, explores the
//! interleavings of their messages, timers and crashes, merges the global
//! states it reaches into a shared tree, and lets a [`PredicateChecker`]
//! walk that tree for a counterexample that replays with a
//! [`ReplayScheduler`].

pub mod checker;
pub mod event;
pub mod node;
pub mod observability;
pub mod params;
pub mod scheduler;
pub mod simulator;
pub mod state;

pub use checker::{always, eventually, CheckError, CheckerResponse, PredicateChecker};
pub use event::{Event, EventId, EventKind, EventRecord};
pub use node::{param, HandlerTable, Node, NodeError, NodeId, Params};
pub use params::{SendTicket, SimulationParameters};
pub use scheduler::{
    GlobalScheduler, PrefixScheduler, RandomScheduler, ReplayScheduler, RunScheduler, SchedulerError,
};
pub use simulator::{
    FailureSpec, Request, RunError, SchedulerKind, SimulationConfig, SimulationError, SimulationReport,
    Simulator,
};
pub use state::{GlobalState, Run, StateManager};
