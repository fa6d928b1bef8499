//! Runtime events emitted while a graph runs

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::result::GraphStatus;
use crate::core::errors::ReasonCode;
use crate::core::time::now_ms;
use crate::exec::{NodeStatus, SkipReason};
use crate::graph::OperationKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuntimeEvent {
    RunStarted {
        graph_id: String,
        layers: usize,
        nodes: usize,
    },
    LayerDispatched {
        layer: usize,
        nodes: Vec<String>,
    },
    NodeStarted {
        node_id: String,
        kind: OperationKind,
    },
    NodeCompleted {
        node_id: String,
        status: NodeStatus,
        attempts: u32,
        code: Option<ReasonCode>,
    },
    NodeSkipped {
        node_id: String,
        reason: SkipReason,
    },
    RunAborted {
        reason: ReasonCode,
        detail: String,
    },
    RunFinished {
        status: GraphStatus,
        elapsed_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEventEnvelope {
    pub sequence: u64,
    pub run_id: String,
    pub timestamp: u64,
    pub event: RuntimeEvent,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &RuntimeEventEnvelope);
}

pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, envelope: &RuntimeEventEnvelope) {
        tracing::debug!(run_id = %envelope.run_id, seq = envelope.sequence, "Event: {:?}", envelope.event);
    }
}

/// Collects events in memory
#[derive(Default)]
pub struct BufferingEventSink {
    events: RwLock<Vec<RuntimeEventEnvelope>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<RuntimeEventEnvelope> {
        self.events.read().clone()
    }

    pub fn events_for(&self, run_id: &str) -> Vec<RuntimeEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.run_id == run_id)
            .map(|e| e.event.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &RuntimeEventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}

/// Fans events out to several sinks
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, envelope: &RuntimeEventEnvelope) {
        for sink in &self.sinks {
            sink.emit(envelope);
        }
    }
}

static EVENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub fn next_sequence() -> u64 {
    EVENT_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// Run-scoped handle for emitting events; cheap to clone into workers
#[derive(Clone)]
pub(crate) struct Emitter {
    run_id: Arc<str>,
    sink: Option<Arc<dyn EventSink>>,
}

impl Emitter {
    pub fn new(run_id: &str, sink: Option<Arc<dyn EventSink>>) -> Self {
        Self {
            run_id: Arc::from(run_id),
            sink,
        }
    }

    pub fn emit(&self, event: RuntimeEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(&RuntimeEventEnvelope {
                sequence: next_sequence(),
                run_id: self.run_id.to_string(),
                timestamp: now_ms(),
                event,
            });
        }
    }
}
