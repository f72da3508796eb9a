//! Execution events and the listeners that receive them

use crate::core::errors::NodeFailure;
use crate::tree::{NodeEntry, NodeType, UniqueId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Final status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed,
    Aborted,
    Skipped,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Identity of the node an event is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub unique_id: UniqueId,
    pub display_name: String,
    pub node_type: NodeType,
}

impl NodeDescriptor {
    pub fn of(entry: &NodeEntry) -> Self {
        Self {
            unique_id: entry.unique_id().clone(),
            display_name: entry.display_name().to_string(),
            node_type: entry.node_type(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// A child was added while its parent executed
    DynamicRegistered { node: NodeDescriptor, parent: UniqueId },
    Started { node: NodeDescriptor },
    /// Emitted instead of `Started` and `Finished`
    Skipped { node: NodeDescriptor, reason: String },
    Finished {
        node: NodeDescriptor,
        status: NodeStatus,
        failure: Option<Arc<NodeFailure>>,
    },
}

impl ExecutionEvent {
    pub fn node(&self) -> &NodeDescriptor {
        match self {
            Self::DynamicRegistered { node, .. }
            | Self::Started { node }
            | Self::Skipped { node, .. }
            | Self::Finished { node, .. } => node,
        }
    }

    pub fn unique_id(&self) -> &UniqueId {
        &self.node().unique_id
    }

    /// One-line rendering, stable enough to compare in tests
    pub fn describe(&self) -> String {
        match self {
            Self::DynamicRegistered { node, .. } => format!("registered {}", node.unique_id),
            Self::Started { node } => format!("started {}", node.unique_id),
            Self::Skipped { node, reason } => format!("skipped {} ({})", node.unique_id, reason),
            Self::Finished { node, status, .. } => format!("finished {} {}", node.unique_id, status),
        }
    }
}

/// Event with run metadata
#[derive(Debug, Clone)]
pub struct ExecutionEventEnvelope {
    pub sequence: u64,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: ExecutionEvent,
}

/// Receives every event of a run, in emission order
pub trait ExecutionListener: Send + Sync {
    fn on_event(&self, envelope: &ExecutionEventEnvelope);
}

/// Writes events to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl ExecutionListener for LoggingListener {
    fn on_event(&self, envelope: &ExecutionEventEnvelope) {
        match &envelope.event {
            ExecutionEvent::Finished {
                node,
                status: NodeStatus::Failed,
                failure,
            } => {
                let message = failure.as_ref().map(|f| f.to_string()).unwrap_or_default();
                tracing::warn!(run_id = %envelope.run_id, "{} failed: {}", node.display_name, message);
            }
            ExecutionEvent::Finished { node, status, .. } => {
                tracing::info!(run_id = %envelope.run_id, "{} {}", node.display_name, status);
            }
            ExecutionEvent::Skipped { node, reason } => {
                tracing::info!(run_id = %envelope.run_id, "{} skipped: {}", node.display_name, reason);
            }
            other => tracing::debug!(run_id = %envelope.run_id, "Event #{}: {}", envelope.sequence, other.describe()),
        }
    }
}

/// Collects events in memory
#[derive(Debug, Default, Clone)]
pub struct RecordingListener {
    events: Arc<RwLock<Vec<ExecutionEventEnvelope>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<ExecutionEventEnvelope> {
        self.events.read().clone()
    }

    /// `describe()` of every event so far
    pub fn descriptions(&self) -> Vec<String> {
        self.events.read().iter().map(|e| e.event.describe()).collect()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl ExecutionListener for RecordingListener {
    fn on_event(&self, envelope: &ExecutionEventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}

/// Fans events out to several listeners in registration order
#[derive(Default, Clone)]
pub struct CompositeListener {
    listeners: Vec<Arc<dyn ExecutionListener>>,
}

impl CompositeListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn ExecutionListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl ExecutionListener for CompositeListener {
    fn on_event(&self, envelope: &ExecutionEventEnvelope) {
        for listener in &self.listeners {
            listener.on_event(envelope);
        }
    }
}

/// Stamps events of one run and delivers them.
///
/// Delivery is serialized so sequence numbers match delivery order.
pub(crate) struct EventEmitter {
    run_id: String,
    sequence: AtomicU64,
    delivery: Mutex<()>,
    listener: CompositeListener,
}

impl EventEmitter {
    pub(crate) fn new(run_id: String, listener: CompositeListener) -> Self {
        Self {
            run_id,
            sequence: AtomicU64::new(0),
            delivery: Mutex::new(()),
            listener,
        }
    }

    pub(crate) fn emit(&self, event: ExecutionEvent) {
        let _delivery = self.delivery.lock();
        let envelope = ExecutionEventEnvelope {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            run_id: self.run_id.clone(),
            timestamp: Utc::now(),
            event,
        };
        self.listener.on_event(&envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> NodeDescriptor {
        NodeDescriptor {
            unique_id: UniqueId::for_engine("arbor").append("test", id),
            display_name: id.to_string(),
            node_type: NodeType::Test,
        }
    }

    #[test]
    fn test_emitter_numbers_events_in_delivery_order() {
        let recorder = Arc::new(RecordingListener::new());
        let mut composite = CompositeListener::new();
        composite.add(recorder.clone());
        composite.add(Arc::new(LoggingListener));
        let emitter = EventEmitter::new("run-1".into(), composite);

        emitter.emit(ExecutionEvent::Started { node: descriptor("a") });
        emitter.emit(ExecutionEvent::Finished {
            node: descriptor("a"),
            status: NodeStatus::Succeeded,
            failure: None,
        });

        let events = recorder.get_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 0);
        assert_eq!(events[1].sequence, 1);
        assert!(events.iter().all(|e| e.run_id == "run-1"));
        assert_eq!(
            recorder.descriptions(),
            vec!["started [engine:arbor]/[test:a]", "finished [engine:arbor]/[test:a] succeeded"]
        );
    }

    #[test]
    fn test_recording_listener_clear() {
        let recorder = RecordingListener::new();
        recorder.on_event(&ExecutionEventEnvelope {
            sequence: 0,
            run_id: "r".into(),
            timestamp: Utc::now(),
            event: ExecutionEvent::Skipped {
                node: descriptor("b"),
                reason: "disabled".into(),
            },
        });
        assert_eq!(recorder.descriptions(), vec!["skipped [engine:arbor]/[test:b] (disabled)"]);
        recorder.clear();
        assert!(recorder.get_events().is_empty());
    }
}
