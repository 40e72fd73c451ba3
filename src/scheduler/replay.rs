//! Deterministic replay of one recorded run.

use super::{GlobalScheduler, PendingEvents, RunScheduler, SchedulerError};
use crate::event::Event;
use crate::node::NodeId;
use crate::state::{Run, RunFileError};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Replays a [`Run`] once; further runs see `NoRunsRemaining`.
#[derive(Debug)]
pub struct ReplayScheduler {
    run: Arc<Run>,
    consumed: Arc<AtomicBool>,
}

impl ReplayScheduler {
    pub fn new(run: Run) -> Self {
        ReplayScheduler {
            run: Arc::new(run),
            consumed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, RunFileError> {
        Ok(Self::new(Run::from_json(json)?))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RunFileError> {
        Ok(Self::new(Run::read_from(path)?))
    }

    pub fn run(&self) -> &Run {
        &self.run
    }
}

impl GlobalScheduler for ReplayScheduler {
    fn run_scheduler(&self) -> Arc<dyn RunScheduler> {
        Arc::new(ReplayRunScheduler {
            run: self.run.clone(),
            consumed: self.consumed.clone(),
            state: Mutex::new(ReplayState::default()),
        })
    }

    fn reset(&self) {
        self.consumed.store(false, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "replay"
    }
}

#[derive(Debug, Default)]
struct ReplayState {
    position: usize,
    pending: PendingEvents,
}

#[derive(Debug)]
pub struct ReplayRunScheduler {
    run: Arc<Run>,
    consumed: Arc<AtomicBool>,
    state: Mutex<ReplayState>,
}

impl RunScheduler for ReplayRunScheduler {
    fn add_event(&self, event: Box<dyn Event>) {
        self.state.lock().pending.push(event);
    }

    fn get_event(&self) -> Result<Box<dyn Event>, SchedulerError> {
        let mut state = self.state.lock();
        if !state.pending.is_active() {
            return Err(SchedulerError::NotStarted);
        }
        let position = state.position;
        let Some(expected) = self.run.events().get(position) else {
            debug!(position, left_pending = state.pending.len(), "replay finished");
            return Err(SchedulerError::RunEnded);
        };

        match state.pending.take(expected) {
            Some(event) => {
                state.position += 1;
                Ok(event)
            }
            None => Err(SchedulerError::ReplayDiverged {
                position,
                expected: expected.clone(),
                available: state.pending.distinct_ids(),
            }),
        }
    }

    fn start_run(&self) -> Result<(), SchedulerError> {
        if self.consumed.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::NoRunsRemaining);
        }
        let mut state = self.state.lock();
        state.position = 0;
        state.pending.open();
        Ok(())
    }

    fn end_run(&self) {
        self.state.lock().pending.close();
    }

    fn node_crashed(&self, node: NodeId) {
        self.state.lock().pending.mark_crashed(node);
    }

    fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}
