//! Predicate Checker
//!
//! Walks the finished state tree depth-first in pre-order and evaluates the
//! predicates in order at every global state. The first predicate to
//! return false stops the walk; the path from the root to the violating
//! state is the counterexample. The exported [`Run`] is the tree's witness
//! for that state, an executed event sequence whose states match the trail.

use crate::node::LocalState;
use crate::state::{GlobalState, Run, RunFileError, StateTree, TreeIndex};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// `(state, is_terminal, path_from_root_inclusive) -> holds`
pub type Predicate<S> =
    Arc<dyn Fn(&GlobalState<S>, bool, &[&GlobalState<S>]) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    /// Nothing was explored
    EmptyTree,
    PredicatePanicked { test: usize, name: String, message: String },
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckError::EmptyTree => write!(f, "state tree is empty; run a simulation first"),
            CheckError::PredicatePanicked { test, name, message } => {
                write!(f, "predicate #{} ({}) panicked: {}", test, name, message)
            }
        }
    }
}

impl std::error::Error for CheckError {}

/// Verdict of a check
#[derive(Debug, Clone)]
pub struct CheckerResponse<S> {
    /// True when every predicate held everywhere
    pub result: bool,
    /// Index of the violated predicate
    pub test: Option<usize>,
    pub name: Option<String>,
    /// Root to violating state, inclusive; empty on success
    pub trail: Vec<GlobalState<S>>,
    /// Replayable run reaching the violating state; empty on success
    pub run: Run,
    /// Global states evaluated
    pub visited: usize,
}

impl<S: LocalState> CheckerResponse<S> {
    pub fn export(&self) -> Run {
        self.run.clone()
    }

    pub fn write_replay(&self, path: impl AsRef<Path>) -> Result<(), RunFileError> {
        self.export().write_to(path)
    }

    pub fn description(&self) -> String {
        if self.result {
            return format!("all predicates hold ({} states checked)", self.visited);
        }
        let mut out = format!(
            "predicate #{} ({}) violated after {} step(s):",
            self.test.unwrap_or_default(),
            self.name.as_deref().unwrap_or("unnamed"),
            self.trail.len().saturating_sub(1)
        );
        for (depth, state) in self.trail.iter().enumerate() {
            out.push_str(&format!("\n  {:>3}: {}", depth, state));
        }
        out.push_str("\n  replay:");
        for id in self.run.events() {
            out.push_str(&format!("\n    {}", id));
        }
        out
    }
}

/// Ordered list of named predicates
pub struct PredicateChecker<S> {
    predicates: Vec<(String, Predicate<S>)>,
}

impl<S: LocalState> PredicateChecker<S> {
    pub fn new() -> Self {
        PredicateChecker {
            predicates: Vec::new(),
        }
    }

    pub fn with<F>(mut self, name: &str, predicate: F) -> Self
    where
        F: Fn(&GlobalState<S>, bool, &[&GlobalState<S>]) -> bool + Send + Sync + 'static,
    {
        self.predicates.push((name.to_string(), Arc::new(predicate)));
        self
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn check(&self, tree: &StateTree<S>) -> Result<CheckerResponse<S>, CheckError> {
        let root = tree.root().ok_or(CheckError::EmptyTree)?;
        let mut stack: Vec<TreeIndex> = vec![root];
        let mut path: Vec<TreeIndex> = Vec::new();
        let mut visited = 0;

        while let Some(index) = stack.pop() {
            path.truncate(tree.depth(index));
            path.push(index);
            visited += 1;

            let state = tree.state(index);
            let terminal = tree.is_leaf(index);
            let states: Vec<&GlobalState<S>> = path.iter().map(|&i| tree.state(i)).collect();

            for (test, (name, predicate)) in self.predicates.iter().enumerate() {
                let holds = panic::catch_unwind(AssertUnwindSafe(|| predicate(state, terminal, &states)))
                    .map_err(|payload| CheckError::PredicatePanicked {
                        test,
                        name: name.clone(),
                        message: panic_message(payload.as_ref()),
                    })?;
                if !holds {
                    info!(test, name = %name, depth = path.len() - 1, visited, "predicate violated");
                    return Ok(CheckerResponse {
                        result: false,
                        test: Some(test),
                        name: Some(name.clone()),
                        trail: states.into_iter().cloned().collect(),
                        run: tree.witness(index),
                        visited,
                    });
                }
            }

            // Reversed so children are visited in insertion order.
            stack.extend(tree.children(index).iter().rev().copied());
        }

        debug!(visited, predicates = self.predicates.len(), "all predicates hold");
        Ok(CheckerResponse {
            result: true,
            test: None,
            name: None,
            trail: Vec::new(),
            run: Run::default(),
            visited,
        })
    }
}

impl<S: LocalState> Default for PredicateChecker<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for PredicateChecker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.predicates.iter().map(|(name, _)| name).collect();
        f.debug_struct("PredicateChecker").field("predicates", &names).finish()
    }
}

/// Safety property: `holds` must be true in every state.
pub fn always<S, F>(holds: F) -> impl Fn(&GlobalState<S>, bool, &[&GlobalState<S>]) -> bool + Send + Sync
where
    F: Fn(&GlobalState<S>) -> bool + Send + Sync,
{
    move |state, _, _| holds(state)
}

/// Liveness property: `holds` must be true in every terminal state.
/// Only sound on runs that ran to completion within the depth budget.
pub fn eventually<S, F>(holds: F) -> impl Fn(&GlobalState<S>, bool, &[&GlobalState<S>]) -> bool + Send + Sync
where
    F: Fn(&GlobalState<S>) -> bool + Send + Sync,
{
    move |state, terminal, _| !terminal || holds(state)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
