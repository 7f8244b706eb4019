//! Per-call event queues for instrumented functions.
//!
//! An instrumented function receives an [`Events`] handle and may record
//! `(type, data)` pairs while it runs. The queue is shipped, in emission
//! order, with the invocation's telemetry report.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// One recorded event, serialized as a `[type, data]` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent(pub String, pub serde_json::Value);

impl AgentEvent {
    /// The event type.
    pub fn kind(&self) -> &str {
        &self.0
    }

    /// The event payload.
    pub fn data(&self) -> &serde_json::Value {
        &self.1
    }
}

/// A per-call event queue.
///
/// Cloneable so async functions can move it into spawned work; clones share
/// one queue.
///
/// # Example
///
/// ```rust
/// use kernel_pipeline::agent::Events;
///
/// let events = Events::new();
/// events.emit("cache", serde_json::json!({"hit": true}));
/// assert_eq!(events.snapshot()[0].kind(), "cache");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Events {
    queue: Arc<Mutex<Vec<AgentEvent>>>,
}

impl Events {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn emit(&self, kind: impl Into<String>, data: serde_json::Value) {
        self.lock().push(AgentEvent(kind.into(), data));
    }

    /// Append an event whose payload is any serializable value.
    pub fn emit_serialized<T: Serialize>(&self, kind: impl Into<String>, data: &T) {
        let data = serde_json::to_value(data)
            .unwrap_or_else(|_| serde_json::json!("<serialization_error>"));
        self.emit(kind, data);
    }

    /// Copy of the events recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AgentEvent> {
        self.lock().clone()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AgentEvent>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
