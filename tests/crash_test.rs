//! Crash injection tests
//!
//! Node 0 pings nodes 1 and 2, which answer with a pong. Node 2 is
//! configured to crash at some point of every run, and node 0 subscribes to
//! crash notifications.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use simcheck::simulator::FailureError;
use simcheck::{
    always, eventually, FailureSpec, GlobalState, HandlerTable, Node, NodeId, PredicateChecker, ReplayScheduler,
    RunError, SimulationConfig, SimulationError, SimulationParameters, Simulator,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
struct PeerState {
    pongs: BTreeSet<usize>,
    suspected: BTreeSet<usize>,
}

struct Peer {
    id: NodeId,
    params: SimulationParameters,
    pongs: Mutex<BTreeSet<usize>>,
    suspected: Arc<Mutex<BTreeSet<usize>>>,
    stops: Arc<AtomicUsize>,
    handlers: HandlerTable<Peer>,
}

impl Peer {
    fn new(id: usize, params: &SimulationParameters, stops: Arc<AtomicUsize>) -> Self {
        let suspected = Arc::new(Mutex::new(BTreeSet::new()));
        let notified = suspected.clone();
        params.subscribe_crash(NodeId(id), move |crashed| {
            notified.lock().insert(crashed.0);
        });

        Peer {
            id: NodeId(id),
            params: params.clone(),
            pongs: Mutex::new(BTreeSet::new()),
            suspected,
            stops,
            handlers: HandlerTable::new()
                .on("Start", |node: &Peer, _| {
                    node.params
                        .broadcast(node.id, [NodeId(1), NodeId(2)], "Ping", vec![json!(node.id.0)]);
                    Ok(())
                })
                .on("Ping", |node: &Peer, _| {
                    node.params.send(node.id, NodeId(0), "Pong", vec![json!(node.id.0)]);
                    Ok(())
                })
                .on("Pong", |node: &Peer, args| {
                    let from: usize = simcheck::param(args, 0)?;
                    node.pongs.lock().insert(from);
                    Ok(())
                }),
        }
    }
}

impl Node for Peer {
    type State = PeerState;

    fn handlers(&self) -> &HandlerTable<Self> {
        &self.handlers
    }

    fn state(&self) -> PeerState {
        PeerState {
            pongs: self.pongs.lock().clone(),
            suspected: self.suspected.lock().clone(),
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn ping_pong(stops: Arc<AtomicUsize>) -> Simulator<Peer> {
    Simulator::new(move |params: &SimulationParameters| {
        (0..3).map(|i| Arc::new(Peer::new(i, params, stops.clone()))).collect()
    })
    .with_config(SimulationConfig::test())
    .with_request(0, "Start", vec![])
}

fn crashed(state: &GlobalState<PeerState>) -> BTreeSet<usize> {
    state.correct.iter().filter(|(_, ok)| !**ok).map(|(id, _)| id.0).collect()
}

fn node_zero(state: &GlobalState<PeerState>) -> &PeerState {
    &state.local_states[&NodeId(0)]
}

fn crash_invariants() -> PredicateChecker<PeerState> {
    PredicateChecker::new()
        .with("crashed nodes stay silent", |_: &GlobalState<PeerState>, _, path: &[&GlobalState<PeerState>]| {
            let Some(first) = path.iter().position(|s| !s.is_correct(NodeId(2))) else {
                return true;
            };
            path[first + 1..].iter().all(|s| {
                !s.is_correct(NodeId(2))
                    && !s.local_states.contains_key(&NodeId(2))
                    && s.causing_event.as_ref().map(|e| e.target) != Some(NodeId(2))
            })
        })
        .with(
            "suspicions match crashes",
            always(|s: &GlobalState<PeerState>| node_zero(s).suspected == crashed(s)),
        )
        .with(
            "correct peers answer",
            eventually(|s: &GlobalState<PeerState>| node_zero(s).pongs.contains(&1)),
        )
}

#[test]
fn test_crash_is_isolated_and_notified() {
    let sim = ping_pong(Arc::new(AtomicUsize::new(0))).with_crash(2);
    let report = sim.simulate().unwrap();
    println!("=== Ping-pong with crash ===\n{:?}", report);
    assert!(report.exhausted);
    assert_eq!(report.failed_runs, 0);

    let response = sim.check(&crash_invariants()).unwrap();
    println!("{}", response.description());
    assert!(response.result);

    let tree = sim.states().read();
    for leaf in tree.leaves() {
        assert_eq!(crashed(tree.state(leaf)), BTreeSet::from([2]), "every run crashes node 2");
    }
}

#[test]
fn test_crash_can_happen_first() {
    let sim = ping_pong(Arc::new(AtomicUsize::new(0))).with_crash(2);
    sim.simulate().unwrap();

    let tree = sim.states().read();
    let root = tree.root().unwrap();
    let first_events: BTreeSet<String> = tree
        .children(root)
        .iter()
        .filter_map(|&c| tree.state(c).causing_event.as_ref().map(|e| e.id.to_string()))
        .collect();
    assert_eq!(
        first_events,
        BTreeSet::from(["Crash(2)".to_string(), "Request(0,0,Start,[])".to_string()])
    );
}

#[test]
fn test_lost_answer_counterexample_replays() {
    let sim = ping_pong(Arc::new(AtomicUsize::new(0))).with_crash(2);
    sim.simulate().unwrap();

    let checker = PredicateChecker::new().with(
        "node 2 answers",
        eventually(|s: &GlobalState<PeerState>| node_zero(s).pongs.contains(&2)),
    );
    let response = sim.check(&checker).unwrap();
    println!("=== Lost answer ===\n{}", response.description());
    assert!(!response.result);

    let run = response.export();
    assert!(run.events().iter().any(|id| id.as_str() == "Crash(2)"));

    let replay = ping_pong(Arc::new(AtomicUsize::new(0)))
        .with_crash(2)
        .with_scheduler(Arc::new(ReplayScheduler::new(run)));
    assert_eq!(replay.simulate().unwrap().runs, 1);

    let tree = replay.states().read();
    let leaves = tree.leaves();
    assert_eq!(leaves.len(), 1);
    let leaf = tree.state(leaves[0]);
    let expected = response.trail.last().unwrap();
    assert_eq!(leaf.local_states, expected.local_states);
    assert_eq!(leaf.correct, expected.correct);
    assert!(!node_zero(leaf).pongs.contains(&2));
}

#[test]
fn test_without_crashes_everyone_answers() {
    let sim = ping_pong(Arc::new(AtomicUsize::new(0)));
    sim.simulate().unwrap();

    let checker = crash_invariants().with(
        "node 2 answers",
        eventually(|s: &GlobalState<PeerState>| node_zero(s).pongs.contains(&2)),
    );
    assert!(sim.check(&checker).unwrap().result);
}

#[test]
fn test_every_node_is_stopped_once_per_run() {
    let stops = Arc::new(AtomicUsize::new(0));
    let sim = ping_pong(stops.clone()).with_crash(2);
    let report = sim.simulate().unwrap();
    assert!(report.runs > 1);
    assert_eq!(stops.load(Ordering::SeqCst) as u64, 3 * report.runs);
}

#[test]
fn test_crashing_unknown_node_fails_the_run() {
    let config = SimulationConfig {
        failures: FailureSpec::crash([7]),
        ..SimulationConfig::test()
    };
    let sim = ping_pong(Arc::new(AtomicUsize::new(0))).with_config(config);
    match sim.simulate() {
        Err(SimulationError::Run(RunError::Failure(FailureError::UnknownNode(node)))) => {
            assert_eq!(node, NodeId(7));
        }
        other => panic!("expected an unknown crash target, got {:?}", other),
    }
}
