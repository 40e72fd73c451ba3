//! Arena-backed state-space tree.
//!
//! Nodes live in a `Vec` and refer to each other by index. The root is the
//! initial global state. Siblings are never equivalent: a run whose next
//! state matches an existing child follows that child instead of adding a
//! new one, so converging interleavings collapse onto one path.
//!
//! Because merging ignores causing events, the events along a tree path may
//! come from different runs. Every node therefore keeps a witness: the run
//! that first reached it, which replays to states equivalent to the path.

use super::{GlobalState, Run};
use crate::node::LocalState;
use serde::Serialize;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

pub type TreeIndex = usize;

/// Caller-supplied local state equality
pub type StateEq<S> = Arc<dyn Fn(&S, &S) -> bool + Send + Sync>;

/// Error merging into the state tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The run started from a different initial state than the root
    InitialStateMismatch { expected: String, actual: String },
    /// Merge called before the tree was seeded
    NotSeeded,
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::InitialStateMismatch { expected, actual } => write!(
                f,
                "initial state {} differs from tree root {}: node factory is not deterministic",
                actual, expected
            ),
            StateError::NotSeeded => write!(f, "state tree has no root"),
        }
    }
}

impl std::error::Error for StateError {}

#[derive(Debug)]
struct TreeNode<S> {
    state: GlobalState<S>,
    parent: Option<TreeIndex>,
    children: Vec<TreeIndex>,
    depth: usize,
    /// Run that created this node; its first `depth` events reach it
    witness: Arc<Run>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    pub nodes: usize,
    pub leaves: usize,
    pub max_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub new_nodes: usize,
    pub leaf: TreeIndex,
}

#[derive(Debug)]
pub struct StateTree<S> {
    nodes: Vec<TreeNode<S>>,
}

impl<S: LocalState> StateTree<S> {
    pub fn new() -> Self {
        StateTree { nodes: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> Option<TreeIndex> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(0)
        }
    }

    pub fn state(&self, index: TreeIndex) -> &GlobalState<S> {
        &self.nodes[index].state
    }

    pub fn children(&self, index: TreeIndex) -> &[TreeIndex] {
        &self.nodes[index].children
    }

    pub fn parent(&self, index: TreeIndex) -> Option<TreeIndex> {
        self.nodes[index].parent
    }

    pub fn depth(&self, index: TreeIndex) -> usize {
        self.nodes[index].depth
    }

    pub fn is_leaf(&self, index: TreeIndex) -> bool {
        self.nodes[index].children.is_empty()
    }

    /// Indices from the root to `index`, inclusive.
    pub fn path_to(&self, index: TreeIndex) -> Vec<TreeIndex> {
        let mut path = vec![index];
        let mut current = index;
        while let Some(parent) = self.nodes[current].parent {
            path.push(parent);
            current = parent;
        }
        path.reverse();
        path
    }

    /// Install the root, or check that `initial` matches it.
    pub fn seed(
        &mut self,
        initial: &GlobalState<S>,
        eq: &dyn Fn(&S, &S) -> bool,
    ) -> Result<TreeIndex, StateError> {
        match self.nodes.first() {
            None => {
                self.nodes.push(TreeNode {
                    state: initial.clone(),
                    parent: None,
                    children: Vec::new(),
                    depth: 0,
                    witness: Arc::new(Run::default()),
                });
                Ok(0)
            }
            Some(root) if root.state.equivalent(initial, eq) => Ok(0),
            Some(root) => Err(StateError::InitialStateMismatch {
                expected: root.state.to_string(),
                actual: initial.to_string(),
            }),
        }
    }

    /// Merge the states of one run below the root.
    pub fn merge(
        &mut self,
        states: &[GlobalState<S>],
        eq: &dyn Fn(&S, &S) -> bool,
    ) -> Result<MergeOutcome, StateError> {
        let Some((initial, rest)) = states.split_first() else {
            return self.root().map(|leaf| MergeOutcome { new_nodes: 0, leaf }).ok_or(StateError::NotSeeded);
        };
        let mut current = self.seed(initial, eq)?;
        let mut new_nodes = 0;
        let mut witness: Option<Arc<Run>> = None;

        for state in rest {
            let existing = self.nodes[current]
                .children
                .iter()
                .copied()
                .find(|&child| self.nodes[child].state.equivalent(state, eq));

            current = match existing {
                Some(child) => child,
                None => {
                    let index = self.nodes.len();
                    let depth = self.nodes[current].depth + 1;
                    let witness = witness
                        .get_or_insert_with(|| Arc::new(Run::from_states(states)))
                        .clone();
                    self.nodes.push(TreeNode {
                        state: state.clone(),
                        parent: Some(current),
                        children: Vec::new(),
                        depth,
                        witness,
                    });
                    self.nodes[current].children.push(index);
                    new_nodes += 1;
                    index
                }
            };
        }

        Ok(MergeOutcome {
            new_nodes,
            leaf: current,
        })
    }

    /// Executed event ids that reach `index` from the root.
    pub fn witness(&self, index: TreeIndex) -> Run {
        let node = &self.nodes[index];
        let events = node.witness.events();
        Run::new(events[..node.depth.min(events.len())].to_vec())
    }

    pub fn leaves(&self) -> Vec<TreeIndex> {
        (0..self.nodes.len()).filter(|&i| self.is_leaf(i)).collect()
    }

    pub fn stats(&self) -> TreeStats {
        TreeStats {
            nodes: self.nodes.len(),
            leaves: self.nodes.iter().filter(|n| n.children.is_empty()).count(),
            max_depth: self.nodes.iter().map(|n| n.depth).max().unwrap_or(0),
        }
    }

    /// Parenthesized labeled-tree rendering, one label per global state:
    /// `("root" ("child" ("grandchild")) ("child"))`
    pub fn export(&self) -> String {
        let mut out = String::new();
        if let Some(root) = self.root() {
            self.export_node(root, &mut out);
        }
        out
    }

    fn export_node(&self, index: TreeIndex, out: &mut String) {
        let label = self.nodes[index].state.to_string();
        let quoted = serde_json::to_string(&label).unwrap_or(label);
        let _ = write!(out, "({}", quoted);
        for &child in &self.nodes[index].children {
            out.push(' ');
            self.export_node(child, out);
        }
        out.push(')');
    }
}

impl<S: LocalState> Default for StateTree<S> {
    fn default() -> Self {
        Self::new()
    }
}
