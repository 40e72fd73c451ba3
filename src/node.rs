//! Node Contract
//!
//! A node is an addressable unit of local state driven by the simulator.
//! Handlers are registered by name in a [`HandlerTable`] when the node is
//! built, so any event can target any named handler without reflection.
//!
//! Nodes are shared between the driving loop and the execution unit of the
//! current step, so local state lives behind interior mutability. A handler
//! must release its locks before calling `sleep`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Node address within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Arguments carried by requests, messages and timers
pub type Params = Vec<Value>;

/// Decode the argument at `index`.
pub fn param<T: DeserializeOwned>(params: &[Value], index: usize) -> Result<T, NodeError> {
    let value = params.get(index).ok_or_else(|| NodeError::BadParams {
        index,
        reason: format!("expected at least {} argument(s), got {}", index + 1, params.len()),
    })?;
    serde_json::from_value(value.clone()).map_err(|e| NodeError::BadParams {
        index,
        reason: e.to_string(),
    })
}

/// Error raised by node code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// No handler registered under this name
    UnknownMethod(String),
    /// Argument missing or of the wrong shape
    BadParams { index: usize, reason: String },
    /// A parked sleep was abandoned (its wake-up was discarded)
    Interrupted,
    /// Sleep called outside of a handler's execution unit
    NotInHandler,
    /// Application-defined failure
    Failed(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::UnknownMethod(name) => write!(f, "no handler named {}", name),
            NodeError::BadParams { index, reason } => {
                write!(f, "bad argument {}: {}", index, reason)
            }
            NodeError::Interrupted => write!(f, "sleep interrupted before wake-up"),
            NodeError::NotInHandler => write!(f, "sleep called outside of an event handler"),
            NodeError::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for NodeError {}

/// Local state snapshot recorded in every global state
pub trait LocalState: Clone + Debug + PartialEq + Serialize + Send + Sync + 'static {}

impl<T> LocalState for T where T: Clone + Debug + PartialEq + Serialize + Send + Sync + 'static {}

pub type Handler<N> = Arc<dyn Fn(&N, &[Value]) -> Result<(), NodeError> + Send + Sync>;

/// Name -> handler capability table
pub struct HandlerTable<N> {
    handlers: HashMap<String, Handler<N>>,
}

impl<N> HandlerTable<N> {
    pub fn new() -> Self {
        HandlerTable {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` under `name`, replacing any previous entry.
    pub fn on<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&N, &[Value]) -> Result<(), NodeError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Handler<N>> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<N> Default for HandlerTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> Debug for HandlerTable<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerTable").field("handlers", &names).finish()
    }
}

/// User algorithm node
pub trait Node: Send + Sync + Sized + 'static {
    type State: LocalState;

    /// Handlers reachable by requests, messages and timers
    fn handlers(&self) -> &HandlerTable<Self>;

    /// Snapshot of the local state
    fn state(&self) -> Self::State;

    /// Crash/stop callback. Called at most once per run.
    fn stop(&self) {}
}

/// Object-safe view of a node used by events
pub trait NodeHandle: Send + Sync {
    fn invoke(&self, method: &str, params: &[Value]) -> Result<(), NodeError>;
    fn stop(&self);
}

impl<N: Node> NodeHandle for N {
    fn invoke(&self, method: &str, params: &[Value]) -> Result<(), NodeError> {
        let handler = self
            .handlers()
            .get(method)
            .ok_or_else(|| NodeError::UnknownMethod(method.to_string()))?
            .clone();
        handler(self, params)
    }

    fn stop(&self) {
        Node::stop(self)
    }
}
