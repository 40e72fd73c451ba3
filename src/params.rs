//! Run-scoped services handed to the node factory.
//!
//! Every outgoing message, timer and sleep of the algorithm under test goes
//! through [`SimulationParameters`], which turns it into an event of the
//! current run.

use crate::event::{step, CompletionSignal, HandlerEvent, SendTracker, WakeEvent};
use crate::node::{NodeError, NodeId, Params};
use crate::scheduler::RunScheduler;
use crate::simulator::FailureManager;
use crossbeam::channel::bounded;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

struct RunServices {
    scheduler: Arc<dyn RunScheduler>,
    failures: Arc<FailureManager>,
    sends: Arc<SendTracker>,
    timers: Mutex<BTreeMap<NodeId, u64>>,
    wakes: Mutex<BTreeMap<NodeId, u64>>,
}

impl RunServices {
    fn next_seq(counters: &Mutex<BTreeMap<NodeId, u64>>, node: NodeId) -> u64 {
        let mut counters = counters.lock();
        let seq = counters.entry(node).or_insert(0);
        let current = *seq;
        *seq += 1;
        current
    }
}

/// Event sink, crash hook and completion hook of one run. Cheap to clone.
#[derive(Clone)]
pub struct SimulationParameters {
    services: Arc<RunServices>,
}

impl SimulationParameters {
    pub(crate) fn new(
        scheduler: Arc<dyn RunScheduler>,
        failures: Arc<FailureManager>,
        sends: Arc<SendTracker>,
    ) -> Self {
        SimulationParameters {
            services: Arc::new(RunServices {
                scheduler,
                failures,
                sends,
                timers: Mutex::new(BTreeMap::new()),
                wakes: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Send `method(params)` from `from` to `to`. Messages from a crashed
    /// node are dropped.
    pub fn send(&self, from: NodeId, to: NodeId, method: &str, params: Params) {
        if self.services.failures.is_crashed(from) {
            trace!(%from, %to, method, "send from crashed node dropped");
            return;
        }
        self.services
            .scheduler
            .add_event(Box::new(HandlerEvent::message(from, to, method, params)));
    }

    /// Send to every node in `to`, in order.
    pub fn broadcast(&self, from: NodeId, to: impl IntoIterator<Item = NodeId>, method: &str, params: Params) {
        for target in to {
            self.send(from, target, method, params.clone());
        }
    }

    /// Schedule `method(params)` on `node` at some later, scheduler-chosen
    /// point of the run.
    pub fn set_timer(&self, node: NodeId, method: &str, params: Params) {
        let seq = RunServices::next_seq(&self.services.timers, node);
        self.services
            .scheduler
            .add_event(Box::new(HandlerEvent::timer(node, seq, method, params)));
    }

    /// Park the calling handler until its wake-up event executes.
    ///
    /// The current step completes as soon as the handler parks. The handler
    /// resumes as part of the step that executes the wake-up and owes that
    /// step's completion. Returns [`NodeError::Interrupted`] when the
    /// wake-up is discarded, because `node` crashed or the run ended.
    ///
    /// Locks on local state must not be held across this call.
    pub fn sleep(&self, node: NodeId) -> Result<(), NodeError> {
        let signal = step::take().ok_or(NodeError::NotInHandler)?;
        let seq = RunServices::next_seq(&self.services.wakes, node);
        let (waker, wake) = bounded::<CompletionSignal>(1);

        self.services
            .scheduler
            .add_event(Box::new(WakeEvent::new(node, seq, waker)));
        signal.complete(Ok(()));

        match wake.recv() {
            Ok(next) => {
                step::install(next);
                Ok(())
            }
            Err(_) => {
                trace!(%node, seq, "sleep interrupted");
                Err(NodeError::Interrupted)
            }
        }
    }

    /// Reserve `n` sends performed from another thread. The current step
    /// does not complete until the ticket has sent `n` events or is
    /// dropped.
    pub fn reserve_sends(&self, n: usize) -> SendTicket {
        self.services.sends.reserve(n);
        SendTicket {
            params: self.clone(),
            remaining: n,
        }
    }

    /// Call `callback` with the crashed id whenever a node crashes while
    /// `node` is still correct.
    ///
    /// Nothing fires for a subscriber that has already crashed, nor for the
    /// crashing node's own subscription.
    pub fn subscribe_crash<F>(&self, node: NodeId, callback: F)
    where
        F: Fn(NodeId) + Send + Sync + 'static,
    {
        self.services.failures.subscribe(node, Arc::new(callback));
    }

    pub fn correct_nodes(&self) -> BTreeMap<NodeId, bool> {
        self.services.failures.correct_nodes()
    }

    pub fn is_correct(&self, node: NodeId) -> bool {
        self.services.failures.is_correct(node)
    }

    /// Signal that the current handler has yielded control. Code running
    /// after this call is no longer part of the step.
    pub fn next_event(&self, result: Result<(), NodeError>) -> Result<(), NodeError> {
        let signal = step::take().ok_or(NodeError::NotInHandler)?;
        signal.complete(result);
        Ok(())
    }
}

impl fmt::Debug for SimulationParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationParameters")
            .field("pending", &self.services.scheduler.pending())
            .field("reserved_sends", &self.services.sends.outstanding())
            .finish()
    }
}

/// Handle for sends reserved with [`SimulationParameters::reserve_sends`]
pub struct SendTicket {
    params: SimulationParameters,
    remaining: usize,
}

impl SendTicket {
    /// Send one reserved message. Past the reservation this is a plain send.
    pub fn send(&mut self, from: NodeId, to: NodeId, method: &str, params: Params) {
        self.params.send(from, to, method, params);
        if self.remaining > 0 {
            self.remaining -= 1;
            self.params.services.sends.release(1);
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Drop for SendTicket {
    fn drop(&mut self) {
        if self.remaining > 0 {
            self.params.services.sends.release(self.remaining);
        }
    }
}

impl fmt::Debug for SendTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendTicket")
            .field("remaining", &self.remaining)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{GlobalScheduler, PrefixScheduler};
    use crate::simulator::FailureSpec;
    use crossbeam::channel::unbounded;
    use serde_json::json;
    use std::thread;

    fn setup() -> (SimulationParameters, Arc<dyn RunScheduler>, Arc<FailureManager>) {
        let scheduler = PrefixScheduler::new().run_scheduler();
        scheduler.start_run().unwrap();
        let failures = Arc::new(FailureManager::new(FailureSpec::none(), scheduler.clone()));
        failures.init((0..3).map(NodeId)).unwrap();
        let params = SimulationParameters::new(scheduler.clone(), failures.clone(), Arc::new(SendTracker::new()));
        (params, scheduler, failures)
    }

    #[test]
    fn test_send_and_timer_become_events() {
        let (params, scheduler, _) = setup();
        params.send(NodeId(0), NodeId(1), "Deliver", vec![json!("m")]);
        params.set_timer(NodeId(2), "Tick", vec![]);
        params.set_timer(NodeId(2), "Tick", vec![]);

        let ids: Vec<String> = (0..3)
            .map(|_| scheduler.get_event().unwrap().id().0)
            .collect();
        assert_eq!(ids[0], r#"Message(0->1,Deliver,["m"])"#);
        assert_eq!(ids[1], "Timer(2,0,Tick,[])");
        assert_eq!(ids[2], "Timer(2,1,Tick,[])");
    }

    #[test]
    fn test_send_from_crashed_node_dropped() {
        let (params, scheduler, failures) = setup();
        failures.node_crash(NodeId(0)).unwrap();
        params.send(NodeId(0), NodeId(1), "Deliver", vec![]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_sleep_outside_handler() {
        let (params, _, _) = setup();
        assert_eq!(params.sleep(NodeId(0)), Err(NodeError::NotInHandler));
        assert_eq!(params.next_event(Ok(())), Err(NodeError::NotInHandler));
    }

    #[test]
    fn test_ticket_drop_releases_reservation() {
        let (params, scheduler, _) = setup();
        let tracker = params.services.sends.clone();

        let mut ticket = params.reserve_sends(3);
        assert_eq!(tracker.outstanding(), 3);
        ticket.send(NodeId(0), NodeId(1), "Deliver", vec![]);
        assert_eq!(ticket.remaining(), 2);
        drop(ticket);

        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn test_sleep_completes_step_and_resumes_on_wake() {
        let (params, scheduler, _) = setup();
        let tracker = params.services.sends.clone();
        let (tx, rx) = unbounded();

        let sleeper = {
            let params = params.clone();
            let signal = CompletionSignal::new(1, tx.clone(), tracker.clone());
            thread::spawn(move || {
                step::install(signal);
                let slept = params.sleep(NodeId(0));
                // Resumed as part of step 2.
                let owed = step::take().map(|s| s.step());
                (slept, owed)
            })
        };

        let (first, outcome) = rx.recv().unwrap();
        assert_eq!(first, 1);
        assert!(outcome.is_ok());

        let wake = scheduler.get_event().unwrap();
        assert_eq!(wake.id().as_str(), "Wake(0,0)");
        struct Nothing;
        impl crate::node::NodeHandle for Nothing {
            fn invoke(&self, _: &str, _: &[serde_json::Value]) -> Result<(), NodeError> {
                Ok(())
            }
            fn stop(&self) {}
        }
        wake.execute(&Nothing, CompletionSignal::new(2, tx, tracker));

        assert_eq!(sleeper.join().unwrap(), (Ok(()), Some(2)));
    }

    #[test]
    fn test_sleep_interrupted_when_run_ends() {
        let (params, scheduler, _) = setup();
        let (tx, rx) = unbounded();
        let signal = CompletionSignal::new(1, tx, Arc::new(SendTracker::new()));

        let sleeper = {
            let params = params.clone();
            thread::spawn(move || {
                step::install(signal);
                params.sleep(NodeId(0))
            })
        };

        rx.recv().unwrap();
        scheduler.end_run();
        assert_eq!(sleeper.join().unwrap(), Err(NodeError::Interrupted));
    }
}
