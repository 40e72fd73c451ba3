//! Crash Injection for Model Checking
//!
//! Per-run failure manager:
//! - Tracks which nodes are still correct
//! - Schedules a crash event for every configured node, so the scheduler
//!   explores the crash at every point of the run
//! - Notifies subscribers synchronously when a crash executes (a perfect
//!   failure detector)
//! - Stops the scheduler from delivering anything more to a crashed node

use crate::event::CrashEvent;
use crate::node::NodeId;
use crate::scheduler::RunScheduler;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Crash-notification callback, called with the crashed node id
pub type CrashCallback = Arc<dyn Fn(NodeId) + Send + Sync>;

/// Nodes to crash in every run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSpec {
    pub crash: Vec<NodeId>,
}

impl FailureSpec {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn crash(nodes: impl IntoIterator<Item = usize>) -> Self {
        FailureSpec {
            crash: nodes.into_iter().map(NodeId).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.crash.is_empty()
    }
}

/// Crash configuration or bookkeeping error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureError {
    /// Node not part of the run
    UnknownNode(NodeId),
    /// Node crashed twice
    AlreadyCrashed(NodeId),
    /// Node listed twice in the crash set
    DuplicateCrash(NodeId),
}

impl fmt::Display for FailureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureError::UnknownNode(id) => write!(f, "cannot crash unknown node {}", id),
            FailureError::AlreadyCrashed(id) => write!(f, "node {} already crashed", id),
            FailureError::DuplicateCrash(id) => {
                write!(f, "node {} registered for crashing more than once", id)
            }
        }
    }
}

impl std::error::Error for FailureError {}

#[derive(Default)]
struct FailureState {
    correct: BTreeMap<NodeId, bool>,
    subscribers: Vec<(NodeId, CrashCallback)>,
}

/// Failure manager of one run
pub struct FailureManager {
    spec: FailureSpec,
    scheduler: Arc<dyn RunScheduler>,
    state: Mutex<FailureState>,
}

impl FailureManager {
    pub fn new(spec: FailureSpec, scheduler: Arc<dyn RunScheduler>) -> Self {
        FailureManager {
            spec,
            scheduler,
            state: Mutex::new(FailureState::default()),
        }
    }

    /// Mark every node correct and schedule the configured crashes.
    pub fn init(self: &Arc<Self>, nodes: impl IntoIterator<Item = NodeId>) -> Result<(), FailureError> {
        let nodes: BTreeSet<NodeId> = nodes.into_iter().collect();

        let mut seen = BTreeSet::new();
        for &node in &self.spec.crash {
            if !nodes.contains(&node) {
                return Err(FailureError::UnknownNode(node));
            }
            if !seen.insert(node) {
                return Err(FailureError::DuplicateCrash(node));
            }
        }

        self.state.lock().correct = nodes.iter().map(|&id| (id, true)).collect();

        for &node in &self.spec.crash {
            self.scheduler
                .add_event(Box::new(CrashEvent::new(node, self.clone())));
        }
        Ok(())
    }

    pub fn correct_nodes(&self) -> BTreeMap<NodeId, bool> {
        self.state.lock().correct.clone()
    }

    pub fn is_correct(&self, node: NodeId) -> bool {
        self.state.lock().correct.get(&node).copied().unwrap_or(false)
    }

    /// True only for nodes that were part of the run and have crashed.
    pub fn is_crashed(&self, node: NodeId) -> bool {
        matches!(self.state.lock().correct.get(&node), Some(false))
    }

    pub fn crashed_nodes(&self) -> Vec<NodeId> {
        self.state
            .lock()
            .correct
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Register `callback` to run when any node crashes while `node` is
    /// still correct.
    ///
    /// Subscribers that have crashed are skipped, including the crashing
    /// node itself, so not every registered callback fires.
    pub fn subscribe(&self, node: NodeId, callback: CrashCallback) {
        self.state.lock().subscribers.push((node, callback));
    }

    pub fn node_crash(&self, node: NodeId) -> Result<(), FailureError> {
        let callbacks: Vec<CrashCallback> = {
            let mut state = self.state.lock();
            match state.correct.get_mut(&node) {
                None => return Err(FailureError::UnknownNode(node)),
                Some(false) => return Err(FailureError::AlreadyCrashed(node)),
                Some(correct) => *correct = false,
            }
            let correct = &state.correct;
            state
                .subscribers
                .iter()
                .filter(|(subscriber, _)| correct.get(subscriber).copied().unwrap_or(false))
                .map(|(_, cb)| cb.clone())
                .collect()
        };

        self.scheduler.node_crashed(node);
        info!(%node, notified = callbacks.len(), "node crashed");

        // Callbacks may send or read correctness, so the lock is released.
        for callback in callbacks {
            callback(node);
        }
        Ok(())
    }

    /// Drop subscriptions; they usually capture nodes of this run.
    pub fn end_run(&self) {
        self.state.lock().subscribers.clear();
    }
}

impl fmt::Debug for FailureManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FailureManager")
            .field("spec", &self.spec)
            .field("correct", &state.correct)
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{GlobalScheduler, PrefixScheduler};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(spec: FailureSpec) -> (Arc<FailureManager>, Arc<dyn RunScheduler>) {
        let scheduler = PrefixScheduler::new().run_scheduler();
        scheduler.start_run().unwrap();
        (Arc::new(FailureManager::new(spec, scheduler.clone())), scheduler)
    }

    fn nodes(n: usize) -> Vec<NodeId> {
        (0..n).map(NodeId).collect()
    }

    #[test]
    fn test_init_marks_all_correct_and_schedules_crashes() {
        let (fm, scheduler) = manager(FailureSpec::crash([1, 2]));
        fm.init(nodes(3)).unwrap();

        assert!(fm.correct_nodes().values().all(|ok| *ok));
        assert_eq!(scheduler.pending(), 2);
        assert_eq!(scheduler.get_event().unwrap().id().as_str(), "Crash(1)");
    }

    #[test]
    fn test_invalid_specs_rejected() {
        let (fm, _) = manager(FailureSpec::crash([1, 1]));
        assert_eq!(fm.init(nodes(3)), Err(FailureError::DuplicateCrash(NodeId(1))));

        let (fm, _) = manager(FailureSpec::crash([5]));
        assert_eq!(fm.init(nodes(3)), Err(FailureError::UnknownNode(NodeId(5))));
    }

    #[test]
    fn test_crash_is_not_idempotent() {
        let (fm, _) = manager(FailureSpec::none());
        fm.init(nodes(2)).unwrap();

        fm.node_crash(NodeId(1)).unwrap();
        assert!(!fm.is_correct(NodeId(1)));
        assert!(fm.is_crashed(NodeId(1)));
        assert!(!fm.is_crashed(NodeId(0)));
        assert_eq!(fm.crashed_nodes(), vec![NodeId(1)]);
        assert_eq!(fm.node_crash(NodeId(1)), Err(FailureError::AlreadyCrashed(NodeId(1))));
        assert_eq!(fm.node_crash(NodeId(9)), Err(FailureError::UnknownNode(NodeId(9))));
    }

    #[test]
    fn test_correct_subscribers_notified() {
        let (fm, _) = manager(FailureSpec::none());
        fm.init(nodes(3)).unwrap();

        let notified = Arc::new(AtomicUsize::new(0));
        for id in 0..3 {
            let notified = notified.clone();
            fm.subscribe(
                NodeId(id),
                Arc::new(move |crashed| {
                    assert_eq!(crashed, NodeId(2));
                    notified.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        fm.node_crash(NodeId(2)).unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_crash_suppresses_events_for_target() {
        use crate::event::HandlerEvent;

        let (fm, scheduler) = manager(FailureSpec::none());
        fm.init(nodes(2)).unwrap();
        scheduler.add_event(Box::new(HandlerEvent::message(NodeId(0), NodeId(1), "Ping", vec![])));

        fm.node_crash(NodeId(1)).unwrap();
        assert_eq!(scheduler.pending(), 0);
        scheduler.add_event(Box::new(HandlerEvent::message(NodeId(0), NodeId(1), "Ping", vec![])));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_callbacks_may_reenter() {
        let (fm, _) = manager(FailureSpec::none());
        fm.init(nodes(2)).unwrap();

        let seen = Arc::new(Mutex::new(None));
        {
            let fm_ref = Arc::downgrade(&fm);
            let seen = seen.clone();
            fm.subscribe(
                NodeId(0),
                Arc::new(move |_| {
                    if let Some(fm) = fm_ref.upgrade() {
                        *seen.lock() = Some(fm.correct_nodes());
                    }
                }),
            );
        }

        fm.node_crash(NodeId(1)).unwrap();
        let snapshot = seen.lock().clone().unwrap();
        assert_eq!(snapshot.get(&NodeId(1)), Some(&false));
    }
}
