//! Handlers that yield: sleep, timers and sends from helper threads

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use simcheck::{
    HandlerTable, Node, NodeError, NodeId, SimulationConfig, SimulationParameters, Simulator,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
struct WorkerState {
    phase: u32,
    fired: u32,
    received: u32,
}

struct Worker {
    id: NodeId,
    params: SimulationParameters,
    state: Mutex<WorkerState>,
    interrupted: Arc<Mutex<u32>>,
    handlers: HandlerTable<Worker>,
}

impl Worker {
    fn new(id: usize, params: &SimulationParameters, interrupted: Arc<Mutex<u32>>) -> Self {
        Worker {
            id: NodeId(id),
            params: params.clone(),
            state: Mutex::new(WorkerState::default()),
            interrupted,
            handlers: HandlerTable::new()
                .on("Work", |node: &Worker, _| {
                    node.state.lock().phase = 1;
                    if let Err(e) = node.params.sleep(node.id) {
                        if e == NodeError::Interrupted {
                            *node.interrupted.lock() += 1;
                        }
                        return Err(e);
                    }
                    node.state.lock().phase = 2;
                    Ok(())
                })
                .on("Arm", |node: &Worker, _| {
                    node.params.set_timer(node.id, "Fire", vec![]);
                    node.params.set_timer(node.id, "Fire", vec![]);
                    Ok(())
                })
                .on("Fire", |node: &Worker, _| {
                    node.state.lock().fired += 1;
                    Ok(())
                })
                .on("Fetch", |node: &Worker, args| {
                    let sent: usize = simcheck::param(args, 0)?;
                    let mut ticket = node.params.reserve_sends(2);
                    let from = node.id;
                    thread::spawn(move || {
                        thread::sleep(Duration::from_millis(20));
                        for _ in 0..sent {
                            ticket.send(from, NodeId(1), "Data", vec![]);
                        }
                    });
                    Ok(())
                })
                .on("Data", |node: &Worker, _| {
                    node.state.lock().received += 1;
                    Ok(())
                })
                .on("Nap", |node: &Worker, _| node.params.sleep(node.id)),
        }
    }
}

impl Node for Worker {
    type State = WorkerState;

    fn handlers(&self) -> &HandlerTable<Self> {
        &self.handlers
    }

    fn state(&self) -> WorkerState {
        self.state.lock().clone()
    }
}

fn workers(interrupted: Arc<Mutex<u32>>) -> Simulator<Worker> {
    Simulator::new(move |params: &SimulationParameters| {
        (0..2)
            .map(|i| Arc::new(Worker::new(i, params, interrupted.clone())))
            .collect()
    })
    .with_config(SimulationConfig::test())
}

/// Interrupted sleepers unblock on their own thread, shortly after the
/// wake-up is discarded.
fn wait_for_interrupts(interrupted: &Mutex<u32>, expected: u32) {
    for _ in 0..100 {
        if *interrupted.lock() == expected {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("expected {} interrupted sleeper(s), saw {}", expected, *interrupted.lock());
}

fn leaf_states(sim: &Simulator<Worker>) -> Vec<simcheck::GlobalState<WorkerState>> {
    let tree = sim.states().read();
    tree.leaves().into_iter().map(|i| tree.state(i).clone()).collect()
}

#[test]
fn test_sleep_splits_handler_into_two_steps() {
    let sim = workers(Arc::new(Mutex::new(0))).with_request(0, "Work", vec![]);
    let report = sim.simulate().unwrap();
    assert_eq!(report.runs, 1);
    assert_eq!(report.tree.max_depth, 2);

    let tree = sim.states().read();
    let leaf = tree.leaves()[0];
    let phases: Vec<u32> = tree
        .path_to(leaf)
        .into_iter()
        .map(|i| tree.state(i).local_states[&NodeId(0)].phase)
        .collect();
    assert_eq!(phases, vec![0, 1, 2]);
    assert_eq!(tree.witness(leaf).events()[1].as_str(), "Wake(0,0)");
}

#[test]
fn test_other_events_interleave_with_a_sleeper() {
    let sim = workers(Arc::new(Mutex::new(0)))
        .with_request(0, "Work", vec![])
        .with_request(1, "Arm", vec![]);
    sim.simulate().unwrap();

    // Some explored state has node 0 parked while node 1 has already fired.
    let tree = sim.states().read();
    let parked_while_firing = (0..tree.len()).any(|i| {
        let s = tree.state(i);
        s.local_states[&NodeId(0)].phase == 1 && s.local_states[&NodeId(1)].fired > 0
    });
    assert!(parked_while_firing);
    drop(tree);

    for leaf in leaf_states(&sim) {
        assert_eq!(leaf.local_states[&NodeId(0)].phase, 2);
        assert_eq!(leaf.local_states[&NodeId(1)].fired, 2);
    }
}

#[test]
fn test_crash_during_sleep_interrupts_the_handler() {
    let interrupted = Arc::new(Mutex::new(0));
    let sim = workers(interrupted.clone())
        .with_request(0, "Work", vec![])
        .with_crash(0);
    let report = sim.simulate().unwrap();

    // Crash before the request, while asleep, or after waking.
    assert_eq!(report.runs, 3);
    assert_eq!(report.failed_runs, 0);
    wait_for_interrupts(&interrupted, 1);
    for leaf in leaf_states(&sim) {
        assert!(!leaf.is_correct(NodeId(0)));
        assert!(!leaf.local_states.contains_key(&NodeId(0)));
    }
}

#[test]
fn test_run_end_releases_a_sleeper() {
    // The wake-up is never executed because the depth budget runs out.
    let interrupted = Arc::new(Mutex::new(0));
    let config = SimulationConfig {
        max_depth: 1,
        ..SimulationConfig::test()
    };
    let sim = workers(interrupted.clone())
        .with_config(config)
        .with_request(0, "Work", vec![]);
    let report = sim.simulate().unwrap();
    assert_eq!(report.runs, 1);
    assert_eq!(report.depth_limited, 1);
    wait_for_interrupts(&interrupted, 1);
}

#[test]
fn test_handler_returning_sleep_result() {
    let sim = workers(Arc::new(Mutex::new(0))).with_request(1, "Nap", vec![]);
    let report = sim.simulate().unwrap();
    assert_eq!(report.runs, 1);
    assert_eq!(report.tree.max_depth, 2);
}

#[test]
fn test_timers_are_scheduled_events() {
    let sim = workers(Arc::new(Mutex::new(0))).with_request(1, "Arm", vec![]);
    let report = sim.simulate().unwrap();
    // Both timer orders are explored; they reach the same states.
    assert_eq!(report.runs, 2);
    assert_eq!(report.tree.nodes, 4);

    let tree = sim.states().read();
    let fired: BTreeSet<String> = tree
        .leaves()
        .into_iter()
        .flat_map(|leaf| tree.witness(leaf).events().to_vec())
        .map(|id| id.to_string())
        .filter(|id| id.starts_with("Timer"))
        .collect();
    assert_eq!(
        fired,
        BTreeSet::from(["Timer(1,0,Fire,[])".to_string(), "Timer(1,1,Fire,[])".to_string()])
    );
}

#[test]
fn test_reserved_sends_hold_the_step() {
    let sim = workers(Arc::new(Mutex::new(0))).with_request(0, "Fetch", vec![json!(2)]);
    let report = sim.simulate().unwrap();
    assert_eq!(report.failed_runs, 0);

    let leaves = leaf_states(&sim);
    assert!(!leaves.is_empty());
    for leaf in leaves {
        assert_eq!(leaf.local_states[&NodeId(1)].received, 2);
    }
}

#[test]
fn test_dropped_ticket_releases_the_rest() {
    let sim = workers(Arc::new(Mutex::new(0))).with_request(0, "Fetch", vec![json!(1)]);
    let report = sim.simulate().unwrap();
    assert_eq!(report.runs, 1);

    for leaf in leaf_states(&sim) {
        assert_eq!(leaf.local_states[&NodeId(1)].received, 1);
    }
}
