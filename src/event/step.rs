//! Step completion and continuations
//!
//! Exactly one event executes at a time within a run. The driving loop
//! hands each step a [`CompletionSignal`] and blocks until it fires.
//!
//! A signal is tagged with its step number; the driving loop discards any
//! signal whose tag does not match the step it is waiting on.
//!
//! The execution unit of a step installs its signal in a thread-local slot.
//! Handler code that parks (`sleep`) takes the signal out of the slot,
//! completes the step and later receives the signal of the step that wakes
//! it up. Whoever holds the slot at the end of the handler owes the
//! completion.

use crate::node::NodeError;
use crate::simulator::FailureError;
use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Why a step failed
pub(crate) enum StepFailure {
    Node(NodeError),
    Crash(FailureError),
    Panic {
        message: String,
        backtrace: String,
        /// Original payload, kept when panics propagate to the caller
        payload: Box<dyn Any + Send>,
    },
}

impl fmt::Debug for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepFailure::Node(e) => f.debug_tuple("Node").field(e).finish(),
            StepFailure::Crash(e) => f.debug_tuple("Crash").field(e).finish(),
            StepFailure::Panic { message, .. } => {
                f.debug_struct("Panic").field("message", message).finish()
            }
        }
    }
}

pub(crate) type StepOutcome = Result<(), StepFailure>;

/// Counts sends reserved through the async send handshake
#[derive(Debug, Default)]
pub struct SendTracker {
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl SendTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&self, n: usize) {
        *self.outstanding.lock() += n;
    }

    pub fn release(&self, n: usize) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(n);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.outstanding.lock()
    }

    /// Block until every reserved send has been registered or released.
    pub fn wait_idle(&self) {
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            self.idle.wait(&mut outstanding);
        }
    }
}

/// Completion handle for one step of a run.
///
/// Clones share one delivery: only the first outcome sent through any of
/// them reaches the driving loop.
#[derive(Clone)]
pub struct CompletionSignal {
    step: u64,
    tx: Sender<(u64, StepOutcome)>,
    sends: Arc<SendTracker>,
    delivered: Arc<AtomicBool>,
}

impl CompletionSignal {
    pub(crate) fn new(step: u64, tx: Sender<(u64, StepOutcome)>, sends: Arc<SendTracker>) -> Self {
        CompletionSignal {
            step,
            tx,
            sends,
            delivered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    /// Signal that the step has yielded control back to the simulator.
    pub fn complete(self, result: Result<(), NodeError>) {
        self.deliver(result.map_err(StepFailure::Node));
    }

    pub(crate) fn deliver(self, outcome: StepOutcome) {
        let step = self.step;
        if let Err(outcome) = self.try_deliver(outcome) {
            debug!(step, ?outcome, "step already completed");
        }
    }

    /// Deliver `outcome` unless the step was already completed, in which
    /// case it is handed back.
    pub(crate) fn try_deliver(self, outcome: StepOutcome) -> Result<(), StepOutcome> {
        if self.delivered.swap(true, Ordering::SeqCst) {
            return Err(outcome);
        }
        self.sends.wait_idle();
        // The receiver is gone once the run has ended.
        let _ = self.tx.send((self.step, outcome));
        Ok(())
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("step", &self.step)
            .finish()
    }
}

thread_local! {
    static CONTINUATION: RefCell<Option<CompletionSignal>> = RefCell::new(None);
}

/// Make `signal` the completion owed by the current thread.
pub(crate) fn install(signal: CompletionSignal) {
    CONTINUATION.with(|slot| *slot.borrow_mut() = Some(signal));
}

/// Take the completion owed by the current thread, if any.
pub(crate) fn take() -> Option<CompletionSignal> {
    CONTINUATION.with(|slot| slot.borrow_mut().take())
}
