//! Event types for run execution.
//!
//! Events are emitted by the run coordinators to notify subscribers about
//! node run transitions and run completion. The engine monitor persists every
//! event so a run's history stays queryable.

mod node;
mod run;

pub use node::*;
pub use run::*;

use serde::Serialize;

use crate::{runtime::RunId, workflow::node::NodeId};

/// Generic event wrapper.
#[derive(Debug, Clone)]
pub struct Event<T> {
    inner: T,
}

/// Top-level event type for workflow graph events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "scope", content = "event", rename_all = "snake_case")]
pub enum GraphEvent {
    /// Run-level events (started, succeeded, failed, cancelled).
    Run(RunEvent),
    /// Node run transitions.
    Node(NodeEvent),
}

/// Event message containing run and node context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    /// Run that generated this event.
    pub run_id: RunId,
    /// Node that generated this event (empty for run events).
    pub node_id: NodeId,
    /// Loop iteration of the node run, 0 outside loop bodies.
    pub generation: u32,
    /// The actual event data.
    pub event: GraphEvent,
    /// Timestamp in milliseconds.
    pub timestamp: i64,
}

impl<T> std::ops::Deref for Event<T>
where
    T: std::fmt::Debug + Clone,
{
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T> Event<T>
where
    T: std::fmt::Debug + Clone,
{
    pub fn new(inner: &T) -> Self {
        Self {
            inner: inner.clone(),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl GraphEvent {
    /// Whether the run finished, regardless of outcome.
    pub fn is_complete(&self) -> bool {
        matches!(self, GraphEvent::Run(RunEvent::Succeeded | RunEvent::Failed { .. } | RunEvent::Cancelled))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, GraphEvent::Run(RunEvent::Failed { .. }) | GraphEvent::Node(NodeEvent::Failed { .. } | NodeEvent::TimedOut))
    }

    pub fn name(&self) -> &str {
        match self {
            GraphEvent::Run(e) => e.as_ref(),
            GraphEvent::Node(e) => e.as_ref(),
        }
    }
}

impl Message {
    pub fn run(
        run_id: &str,
        event: RunEvent,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            node_id: String::new(),
            generation: 0,
            event: GraphEvent::Run(event),
            timestamp: crate::utils::time::time_millis(),
        }
    }

    pub fn node(
        run_id: &str,
        node_id: &str,
        generation: u32,
        event: NodeEvent,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            generation,
            event: GraphEvent::Node(event),
            timestamp: crate::utils::time::time_millis(),
        }
    }
}
