//! Events
//!
//! An event is the atomic unit of simulated execution: a request, a message
//! delivery, a timer, the wake-up of a parked handler, or a crash. Two
//! events with the same [`EventId`] produce the same global state from the
//! same input state, which is what makes replay possible.

pub mod step;

pub use step::{CompletionSignal, SendTracker};

use crate::node::{NodeHandle, NodeId, Params};
use crate::simulator::FailureManager;
use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use step::StepFailure;
use tracing::debug;

/// Deterministic event identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        EventId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        EventId(s.to_string())
    }
}

/// What kind of event caused a global state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Request,
    Message { from: NodeId },
    Timer,
    Wake,
    Crash,
}

/// Serializable description of an executed event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub target: NodeId,
    pub kind: EventKind,
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

pub trait Event: fmt::Debug + Send + Sync {
    fn id(&self) -> EventId;

    /// Node whose local state this event mutates
    fn target(&self) -> NodeId;

    fn kind(&self) -> EventKind;

    /// Run the event against `node`. Must eventually complete `done`, or
    /// hand it to a parked handler that will.
    fn execute(&self, node: &dyn NodeHandle, done: CompletionSignal);

    fn record(&self) -> EventRecord {
        EventRecord {
            id: self.id(),
            target: self.target(),
            kind: self.kind(),
        }
    }
}

fn render_params(params: &Params) -> String {
    Value::Array(params.clone()).to_string()
}

/// How a handler event entered the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerKind {
    /// External request; `seq` is its position in the request list
    Request { seq: usize },
    Message { from: NodeId },
    /// Timer set by the target itself
    Timer { seq: u64 },
}

/// Invokes a named handler on the target node
#[derive(Debug, Clone)]
pub struct HandlerEvent {
    pub kind: HandlerKind,
    pub target: NodeId,
    pub method: String,
    pub params: Params,
}

impl HandlerEvent {
    pub fn request(seq: usize, target: NodeId, method: &str, params: Params) -> Self {
        HandlerEvent {
            kind: HandlerKind::Request { seq },
            target,
            method: method.to_string(),
            params,
        }
    }

    pub fn message(from: NodeId, to: NodeId, method: &str, params: Params) -> Self {
        HandlerEvent {
            kind: HandlerKind::Message { from },
            target: to,
            method: method.to_string(),
            params,
        }
    }

    pub fn timer(node: NodeId, seq: u64, method: &str, params: Params) -> Self {
        HandlerEvent {
            kind: HandlerKind::Timer { seq },
            target: node,
            method: method.to_string(),
            params,
        }
    }
}

impl Event for HandlerEvent {
    fn id(&self) -> EventId {
        let params = render_params(&self.params);
        match &self.kind {
            HandlerKind::Request { seq } => EventId(format!(
                "Request({},{},{},{})",
                seq, self.target, self.method, params
            )),
            HandlerKind::Message { from } => EventId(format!(
                "Message({}->{},{},{})",
                from, self.target, self.method, params
            )),
            HandlerKind::Timer { seq } => EventId(format!(
                "Timer({},{},{},{})",
                self.target, seq, self.method, params
            )),
        }
    }

    fn target(&self) -> NodeId {
        self.target
    }

    fn kind(&self) -> EventKind {
        match &self.kind {
            HandlerKind::Request { .. } => EventKind::Request,
            HandlerKind::Message { from } => EventKind::Message { from: *from },
            HandlerKind::Timer { .. } => EventKind::Timer,
        }
    }

    fn execute(&self, node: &dyn NodeHandle, done: CompletionSignal) {
        step::install(done);
        let result = node.invoke(&self.method, &self.params);
        match step::take() {
            Some(signal) => signal.complete(result),
            None => {
                // The step was handed off by a sleep that never resumed.
                debug!(target_node = %self.target, method = %self.method, ?result, "handler finished after hand-off");
            }
        }
    }
}

/// Resumes a handler parked in `sleep`
pub struct WakeEvent {
    pub node: NodeId,
    pub seq: u64,
    waker: Sender<CompletionSignal>,
}

impl WakeEvent {
    pub fn new(node: NodeId, seq: u64, waker: Sender<CompletionSignal>) -> Self {
        WakeEvent { node, seq, waker }
    }
}

impl fmt::Debug for WakeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeEvent")
            .field("node", &self.node)
            .field("seq", &self.seq)
            .finish()
    }
}

impl Event for WakeEvent {
    fn id(&self) -> EventId {
        EventId(format!("Wake({},{})", self.node, self.seq))
    }

    fn target(&self) -> NodeId {
        self.node
    }

    fn kind(&self) -> EventKind {
        EventKind::Wake
    }

    fn execute(&self, _node: &dyn NodeHandle, done: CompletionSignal) {
        // The resumed handler now owes the completion.
        if let Err(returned) = self.waker.send(done) {
            returned.into_inner().complete(Ok(()));
        }
    }
}

/// Crashes the target node
pub struct CrashEvent {
    pub node: NodeId,
    failures: Arc<FailureManager>,
}

impl CrashEvent {
    pub fn new(node: NodeId, failures: Arc<FailureManager>) -> Self {
        CrashEvent { node, failures }
    }
}

impl fmt::Debug for CrashEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrashEvent").field("node", &self.node).finish()
    }
}

impl Event for CrashEvent {
    fn id(&self) -> EventId {
        EventId(format!("Crash({})", self.node))
    }

    fn target(&self) -> NodeId {
        self.node
    }

    fn kind(&self) -> EventKind {
        EventKind::Crash
    }

    fn execute(&self, node: &dyn NodeHandle, done: CompletionSignal) {
        node.stop();
        let outcome = self.failures.node_crash(self.node).map_err(StepFailure::Crash);
        done.deliver(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_deterministic() {
        let a = HandlerEvent::message(NodeId(0), NodeId(1), "Deliver", vec![json!("m")]);
        let b = HandlerEvent::message(NodeId(0), NodeId(1), "Deliver", vec![json!("m")]);
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().as_str(), r#"Message(0->1,Deliver,["m"])"#);
    }

    #[test]
    fn test_ids_distinguish_participants_and_payload() {
        let base = HandlerEvent::message(NodeId(0), NodeId(1), "Deliver", vec![json!(1)]);
        let other_sender = HandlerEvent::message(NodeId(2), NodeId(1), "Deliver", vec![json!(1)]);
        let other_payload = HandlerEvent::message(NodeId(0), NodeId(1), "Deliver", vec![json!(2)]);
        let request = HandlerEvent::request(0, NodeId(1), "Deliver", vec![json!(1)]);

        assert_ne!(base.id(), other_sender.id());
        assert_ne!(base.id(), other_payload.id());
        assert_ne!(base.id(), request.id());
    }

    #[test]
    fn test_record_carries_kind_and_target() {
        let event = HandlerEvent::message(NodeId(3), NodeId(4), "Ack", vec![]);
        let record = event.record();
        assert_eq!(record.target, NodeId(4));
        assert_eq!(record.kind, EventKind::Message { from: NodeId(3) });
        assert_eq!(record.id, event.id());
    }

    #[test]
    fn test_event_id_serializes_as_string() {
        let id = EventId::from("Crash(1)");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""Crash(1)""#);
    }
}
