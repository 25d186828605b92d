//! Transport-agnostic event delivery. The orchestrator pushes
//! [`TurnEvent`]s through this seam; the CLI prints them, tests collect
//! them, an embedding server would forward them over its own wire.

use std::sync::Arc;
use std::sync::Mutex;

use relay_protocol::TurnEvent;

pub trait EventSink: Send + Sync {
    fn deliver(&self, event: TurnEvent);
}

/// Accumulates every delivered event; used by tests and by callers that
/// want the whole turn after the fact.
#[derive(Default)]
pub struct CollectorSink {
    events: Mutex<Vec<TurnEvent>>,
}

impl CollectorSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Vec<TurnEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventSink for CollectorSink {
    fn deliver(&self, event: TurnEvent) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
