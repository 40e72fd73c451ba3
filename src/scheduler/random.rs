//! Random-walk exploration.
//!
//! Each run samples the next event uniformly from its pending set. There is
//! no coverage guarantee and no notion of exhaustion: the simulation ends
//! when its run budget is spent.

use super::{GlobalScheduler, PendingEvents, RunScheduler, SchedulerError};
use crate::event::Event;
use crate::node::NodeId;
use crate::simulator::DeterministicRng;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug)]
pub struct RandomScheduler {
    seed: u64,
    next_run: Arc<AtomicU64>,
}

impl RandomScheduler {
    pub fn new(seed: u64) -> Self {
        RandomScheduler {
            seed,
            next_run: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl GlobalScheduler for RandomScheduler {
    fn run_scheduler(&self) -> Arc<dyn RunScheduler> {
        Arc::new(RandomRunScheduler {
            seed: self.seed,
            next_run: self.next_run.clone(),
            run: Mutex::new(RandomRun {
                rng: DeterministicRng::new(self.seed),
                pending: PendingEvents::new(),
            }),
        })
    }

    fn reset(&self) {
        self.next_run.store(0, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

#[derive(Debug)]
struct RandomRun {
    rng: DeterministicRng,
    pending: PendingEvents,
}

#[derive(Debug)]
pub struct RandomRunScheduler {
    seed: u64,
    next_run: Arc<AtomicU64>,
    run: Mutex<RandomRun>,
}

impl RunScheduler for RandomRunScheduler {
    fn add_event(&self, event: Box<dyn Event>) {
        self.run.lock().pending.push(event);
    }

    fn get_event(&self) -> Result<Box<dyn Event>, SchedulerError> {
        let mut run = self.run.lock();
        if !run.pending.is_active() {
            return Err(SchedulerError::NotStarted);
        }
        let len = run.pending.len() as u64;
        if len == 0 {
            return Err(SchedulerError::RunEnded);
        }
        let index = run.rng.gen_range(0, len) as usize;
        run.pending.take_index(index).ok_or(SchedulerError::RunEnded)
    }

    fn start_run(&self) -> Result<(), SchedulerError> {
        let ordinal = self.next_run.fetch_add(1, Ordering::SeqCst);
        let mut run = self.run.lock();
        run.rng = DeterministicRng::for_run(self.seed, ordinal);
        run.pending.open();
        trace!(ordinal, "random run started");
        Ok(())
    }

    fn end_run(&self) {
        self.run.lock().pending.close();
    }

    fn node_crashed(&self, node: NodeId) {
        self.run.lock().pending.mark_crashed(node);
    }

    fn pending(&self) -> usize {
        self.run.lock().pending.len()
    }
}
