use crate::event::{Event, EventId};
use crate::node::NodeId;
use std::collections::BTreeSet;

/// Pending events of one run, in arrival order
#[derive(Debug, Default)]
pub struct PendingEvents {
    events: Vec<Box<dyn Event>>,
    crashed: BTreeSet<NodeId>,
    active: bool,
}

impl PendingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting events for a fresh run.
    pub fn open(&mut self) {
        self.events.clear();
        self.crashed.clear();
        self.active = true;
    }

    /// Stop accepting events. Dropping pending wake-ups releases any
    /// handler still parked on them.
    pub fn close(&mut self) {
        self.active = false;
        self.events.clear();
        self.crashed.clear();
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Returns false if the event was discarded.
    pub fn push(&mut self, event: Box<dyn Event>) -> bool {
        if !self.active || self.crashed.contains(&event.target()) {
            return false;
        }
        self.events.push(event);
        true
    }

    /// Returns how many pending events were discarded.
    pub fn mark_crashed(&mut self, node: NodeId) -> usize {
        self.crashed.insert(node);
        let before = self.events.len();
        self.events.retain(|e| e.target() != node);
        before - self.events.len()
    }

    pub fn is_crashed(&self, node: NodeId) -> bool {
        self.crashed.contains(&node)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Distinct ids in arrival order
    pub fn distinct_ids(&self) -> Vec<EventId> {
        let mut seen = BTreeSet::new();
        self.events
            .iter()
            .map(|e| e.id())
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }

    /// Remove the first event with `id`.
    pub fn take(&mut self, id: &EventId) -> Option<Box<dyn Event>> {
        let index = self.events.iter().position(|e| &e.id() == id)?;
        Some(self.events.remove(index))
    }

    pub fn take_index(&mut self, index: usize) -> Option<Box<dyn Event>> {
        if index < self.events.len() {
            Some(self.events.remove(index))
        } else {
            None
        }
    }
}
