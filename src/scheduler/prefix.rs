//! Systematic depth-first exploration.
//!
//! Every run starts from an unexplored prefix popped off a stack shared by
//! all concurrent runs. The run replays its prefix, then at every choice
//! point takes the first pending event and pushes each untried sibling back
//! onto the stack as a new prefix. A run waiting for work blocks while any
//! other run is still ongoing, since that run may push more prefixes; once
//! the stack is empty and nothing is ongoing, every waiter is released with
//! [`SchedulerError::NoRunsRemaining`].

use super::{GlobalScheduler, PendingEvents, RunScheduler, SchedulerError};
use crate::event::{Event, EventId};
use crate::node::NodeId;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug)]
struct PrefixStack {
    prefixes: Vec<Vec<EventId>>,
    /// Runs that may still push prefixes
    ongoing: usize,
}

impl PrefixStack {
    fn initial() -> Self {
        PrefixStack {
            prefixes: vec![Vec::new()],
            ongoing: 0,
        }
    }
}

#[derive(Debug)]
struct SharedPrefixes {
    stack: Mutex<PrefixStack>,
    changed: Condvar,
}

impl SharedPrefixes {
    fn next_prefix(&self) -> Result<Vec<EventId>, SchedulerError> {
        let mut stack = self.stack.lock();
        loop {
            if let Some(prefix) = stack.prefixes.pop() {
                stack.ongoing += 1;
                return Ok(prefix);
            }
            if stack.ongoing == 0 {
                self.changed.notify_all();
                return Err(SchedulerError::NoRunsRemaining);
            }
            self.changed.wait(&mut stack);
        }
    }

    fn push(&self, prefixes: Vec<Vec<EventId>>) {
        let mut stack = self.stack.lock();
        stack.prefixes.extend(prefixes);
        self.changed.notify_all();
    }

    fn finish_run(&self) {
        let mut stack = self.stack.lock();
        stack.ongoing = stack.ongoing.saturating_sub(1);
        self.changed.notify_all();
    }
}

/// Shared DFS work queue
#[derive(Debug)]
pub struct PrefixScheduler {
    shared: Arc<SharedPrefixes>,
}

impl PrefixScheduler {
    pub fn new() -> Self {
        PrefixScheduler {
            shared: Arc::new(SharedPrefixes {
                stack: Mutex::new(PrefixStack::initial()),
                changed: Condvar::new(),
            }),
        }
    }

    /// Unexplored prefixes currently queued
    pub fn queued(&self) -> usize {
        self.shared.stack.lock().prefixes.len()
    }

    /// Runs currently holding a prefix
    pub fn ongoing(&self) -> usize {
        self.shared.stack.lock().ongoing
    }
}

impl Default for PrefixScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalScheduler for PrefixScheduler {
    fn run_scheduler(&self) -> Arc<dyn RunScheduler> {
        Arc::new(PrefixRunScheduler {
            shared: self.shared.clone(),
            run: Mutex::new(PrefixRun::default()),
        })
    }

    fn reset(&self) {
        *self.shared.stack.lock() = PrefixStack::initial();
        self.shared.changed.notify_all();
    }

    fn name(&self) -> &'static str {
        "prefix"
    }
}

#[derive(Debug, Default)]
struct PrefixRun {
    prefix: Vec<EventId>,
    /// Events chosen so far in this run
    path: Vec<EventId>,
    pending: PendingEvents,
    started: bool,
}

/// One run of a depth-first exploration
#[derive(Debug)]
pub struct PrefixRunScheduler {
    shared: Arc<SharedPrefixes>,
    run: Mutex<PrefixRun>,
}

impl RunScheduler for PrefixRunScheduler {
    fn add_event(&self, event: Box<dyn Event>) {
        let mut run = self.run.lock();
        let id = event.id();
        if !run.pending.push(event) {
            trace!(event = %id, "event discarded");
        }
    }

    fn get_event(&self) -> Result<Box<dyn Event>, SchedulerError> {
        let mut run = self.run.lock();
        if !run.started {
            return Err(SchedulerError::NotStarted);
        }
        let position = run.path.len();

        if position < run.prefix.len() {
            let expected = run.prefix[position].clone();
            return match run.pending.take(&expected) {
                Some(event) => {
                    run.path.push(expected);
                    Ok(event)
                }
                None => Err(SchedulerError::NonDeterministic {
                    position,
                    expected,
                    available: run.pending.distinct_ids(),
                }),
            };
        }

        let ids = run.pending.distinct_ids();
        let Some(chosen) = ids.first().cloned() else {
            return Err(SchedulerError::RunEnded);
        };

        if ids.len() > 1 {
            // Reversed so the next sibling in arrival order is popped first.
            let branches: Vec<Vec<EventId>> = ids[1..]
                .iter()
                .rev()
                .map(|sibling| {
                    let mut prefix = run.path.clone();
                    prefix.push(sibling.clone());
                    prefix
                })
                .collect();
            debug!(depth = position, branches = branches.len(), "pushing unexplored prefixes");
            self.shared.push(branches);
        }

        let event = run
            .pending
            .take(&chosen)
            .ok_or(SchedulerError::RunEnded)?;
        run.path.push(chosen);
        Ok(event)
    }

    fn start_run(&self) -> Result<(), SchedulerError> {
        let prefix = self.shared.next_prefix()?;
        let mut run = self.run.lock();
        run.prefix = prefix;
        run.path.clear();
        run.pending.open();
        run.started = true;
        Ok(())
    }

    fn end_run(&self) {
        let mut run = self.run.lock();
        if !run.started {
            return;
        }
        run.started = false;
        run.pending.close();
        drop(run);
        self.shared.finish_run();
    }

    fn node_crashed(&self, node: NodeId) {
        let dropped = self.run.lock().pending.mark_crashed(node);
        trace!(%node, dropped, "crashed node events discarded");
    }

    fn pending(&self) -> usize {
        self.run.lock().pending.len()
    }
}
