//! Global states, runs and the shared state-space tree.

mod manager;
mod tree;

pub use manager::StateManager;
pub use tree::{MergeOutcome, StateEq, StateError, StateTree, TreeIndex, TreeStats};

use crate::event::{EventId, EventRecord};
use crate::node::{LocalState, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Snapshot of every live node taken after one event
#[derive(Debug, Clone, Serialize)]
pub struct GlobalState<S> {
    /// Local state of every node that was correct at this instant
    pub local_states: BTreeMap<NodeId, S>,
    pub correct: BTreeMap<NodeId, bool>,
    /// `None` only for the initial state
    pub causing_event: Option<EventRecord>,
}

impl<S: LocalState> GlobalState<S> {
    /// Structural equality under `eq`, ignoring the causing event.
    pub fn equivalent(&self, other: &GlobalState<S>, eq: &dyn Fn(&S, &S) -> bool) -> bool {
        self.correct == other.correct
            && self.local_states.len() == other.local_states.len()
            && self
                .local_states
                .iter()
                .zip(other.local_states.iter())
                .all(|((a_id, a), (b_id, b))| a_id == b_id && eq(a, b))
    }

    pub fn is_correct(&self, node: NodeId) -> bool {
        self.correct.get(&node).copied().unwrap_or(false)
    }
}

impl<S: fmt::Debug> fmt::Display for GlobalState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (id, state)) in self.local_states.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{:?}", id, state)?;
        }
        write!(f, "}}")?;
        let crashed: Vec<_> = self
            .correct
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(id, _)| id.0)
            .collect();
        if !crashed.is_empty() {
            write!(f, " crashed={:?}", crashed)?;
        }
        if let Some(event) = &self.causing_event {
            write!(f, " <- {}", event)?;
        }
        Ok(())
    }
}

/// Ordered global states produced by one run
#[derive(Debug, Clone)]
pub struct RunTrace<S> {
    states: Vec<GlobalState<S>>,
}

impl<S: LocalState> RunTrace<S> {
    pub fn new(initial: GlobalState<S>) -> Self {
        RunTrace {
            states: vec![initial],
        }
    }

    pub fn record(&mut self, state: GlobalState<S>) {
        self.states.push(state);
    }

    pub fn states(&self) -> &[GlobalState<S>] {
        &self.states
    }

    pub fn initial(&self) -> &GlobalState<S> {
        &self.states[0]
    }

    pub fn last(&self) -> &GlobalState<S> {
        &self.states[self.states.len() - 1]
    }

    /// Executed steps, not counting the initial state
    pub fn steps(&self) -> usize {
        self.states.len() - 1
    }

    /// Event ids that produced this trace
    pub fn run(&self) -> Run {
        Run::from_states(&self.states)
    }
}

/// Error reading or writing a persisted run
#[derive(Debug)]
pub enum RunFileError {
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for RunFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunFileError::Io(e) => write!(f, "run file I/O error: {}", e),
            RunFileError::Json(e) => write!(f, "run file is not a JSON list of event ids: {}", e),
        }
    }
}

impl std::error::Error for RunFileError {}

impl From<io::Error> for RunFileError {
    fn from(e: io::Error) -> Self {
        RunFileError::Io(e)
    }
}

impl From<serde_json::Error> for RunFileError {
    fn from(e: serde_json::Error) -> Self {
        RunFileError::Json(e)
    }
}

/// One explored execution path as an ordered list of event ids.
/// Persisted as a JSON array of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Run(Vec<EventId>);

impl Run {
    pub fn new(events: Vec<EventId>) -> Self {
        Run(events)
    }

    /// Causing events of `states`, skipping the initial state.
    pub fn from_states<S>(states: &[GlobalState<S>]) -> Self {
        Run(states
            .iter()
            .filter_map(|s| s.causing_event.as_ref().map(|e| e.id.clone()))
            .collect())
    }

    pub fn events(&self) -> &[EventId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> String {
        // A list of strings always serializes.
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn from_json(json: &str) -> Result<Self, RunFileError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), RunFileError> {
        fs::write(path, self.to_json())?;
        Ok(())
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, RunFileError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

impl From<Vec<EventId>> for Run {
    fn from(events: Vec<EventId>) -> Self {
        Run(events)
    }
}
