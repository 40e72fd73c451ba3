use super::tree::{MergeOutcome, StateEq, StateError, StateTree, TreeStats};
use super::{GlobalState, RunTrace};
use crate::node::LocalState;
use parking_lot::{RwLock, RwLockReadGuard};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Shared state-space tree of one simulation.
///
/// Run completions take the write lock to merge their trace; inspection
/// and checking take the read lock.
pub struct StateManager<S> {
    tree: RwLock<StateTree<S>>,
    eq: StateEq<S>,
}

impl<S: LocalState> StateManager<S> {
    /// Local states compare with `PartialEq`.
    pub fn new() -> Self {
        Self::with_equality(Arc::new(|a: &S, b: &S| a == b))
    }

    pub fn with_equality(eq: StateEq<S>) -> Self {
        StateManager {
            tree: RwLock::new(StateTree::new()),
            eq,
        }
    }

    pub fn reset(&self) {
        self.tree.write().clear();
    }

    /// Seed the root with a run's initial state.
    pub fn start_run(&self, initial: &GlobalState<S>) -> Result<(), StateError> {
        self.tree.write().seed(initial, self.eq.as_ref())?;
        Ok(())
    }

    /// Merge a finished run into the tree.
    pub fn end_run(&self, trace: &RunTrace<S>) -> Result<MergeOutcome, StateError> {
        let outcome = self.tree.write().merge(trace.states(), self.eq.as_ref())?;
        debug!(
            steps = trace.steps(),
            new_nodes = outcome.new_nodes,
            "run merged into state tree"
        );
        Ok(outcome)
    }

    pub fn equivalent(&self, a: &GlobalState<S>, b: &GlobalState<S>) -> bool {
        a.equivalent(b, self.eq.as_ref())
    }

    pub fn read(&self) -> RwLockReadGuard<'_, StateTree<S>> {
        self.tree.read()
    }

    pub fn stats(&self) -> TreeStats {
        self.tree.read().stats()
    }

    pub fn export(&self) -> String {
        self.tree.read().export()
    }

    pub fn export_to(&self, path: impl AsRef<Path>) -> io::Result<()> {
        fs::write(path, self.export())
    }
}

impl<S: LocalState> Default for StateManager<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: LocalState> std::fmt::Debug for StateManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("stats", &self.stats())
            .finish()
    }
}
