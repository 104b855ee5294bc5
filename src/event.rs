//! Cycle event publishing.
//!
//! Components publish [`CycleEvent`]s so observers (loggers, UIs,
//! telemetry) can watch every step without coupling to the pipeline.
//! Delivery is synchronous and in registration order: `publish` blocks
//! the publishing task until every matching listener's `handle`
//! returns, so a slow listener throttles the whole pipeline.

use std::sync::{Arc, LazyLock, Mutex};

use serde::{Deserialize, Serialize};

use crate::cycle::SubtaskId;

/// Discriminant used by listener filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SubtaskStart,
    SubtaskFinish,
    Chunk,
}

/// Identity of one proposed action, carried on start/finish events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionHeader {
    pub tag: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Incremental fragment notification emitted by the delta aggregator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkPayload {
    Text {
        text: String,
    },
    ActionCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial_input: Option<String>,
    },
}

/// Everything observable about the execution core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CycleEvent {
    SubtaskStart {
        subtask: SubtaskId,
        parent: Option<SubtaskId>,
        thought: Option<String>,
        actions: Vec<ActionHeader>,
    },
    SubtaskFinish {
        subtask: SubtaskId,
        parent: Option<SubtaskId>,
        thought: Option<String>,
        actions: Vec<ActionHeader>,
        is_error: bool,
    },
    Chunk {
        index: u32,
        payload: ChunkPayload,
    },
}

impl CycleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CycleEvent::SubtaskStart { .. } => EventKind::SubtaskStart,
            CycleEvent::SubtaskFinish { .. } => EventKind::SubtaskFinish,
            CycleEvent::Chunk { .. } => EventKind::Chunk,
        }
    }
}

/// An event sink. `kinds` returning `None` subscribes to everything.
pub trait EventListener: Send + Sync {
    fn kinds(&self) -> Option<&[EventKind]> {
        None
    }

    fn handle(&self, event: &CycleEvent);
}

static GLOBAL: LazyLock<Arc<EventBus>> = LazyLock::new(|| Arc::new(EventBus::new()));

/// Listener registry.
///
/// Mutation is mutex-guarded; `publish` iterates a snapshot taken
/// under the lock, so a listener removed while a publish is in flight
/// may still observe that event. Listener panics are not caught and
/// propagate to the publisher.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<Arc<dyn EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default bus. Components accept an explicit bus
    /// for isolation; this singleton is the ergonomic fallback.
    pub fn global() -> Arc<EventBus> {
        GLOBAL.clone()
    }

    /// Registers a listener. Adding the same instance twice is a no-op.
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        let mut listeners = self.listeners.lock().expect("listener lock poisoned");
        if !listeners.iter().any(|known| Arc::ptr_eq(known, &listener)) {
            listeners.push(listener);
        }
    }

    /// Removes a listener by identity. Removing a non-member is a no-op.
    pub fn remove_listener(&self, listener: &Arc<dyn EventListener>) {
        let mut listeners = self.listeners.lock().expect("listener lock poisoned");
        listeners.retain(|known| !Arc::ptr_eq(known, listener));
    }

    /// Drops all listeners. Intended for test isolation on the global
    /// bus.
    pub fn clear(&self) {
        self.listeners.lock().expect("listener lock poisoned").clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().expect("listener lock poisoned").len()
    }

    /// Delivers synchronously, in registration order, to every listener
    /// whose filter is `None` or contains the event's kind.
    pub fn publish(&self, event: &CycleEvent) {
        let snapshot = self
            .listeners
            .lock()
            .expect("listener lock poisoned")
            .clone();
        let kind = event.kind();
        for listener in snapshot {
            let matches = listener
                .kinds()
                .map(|kinds| kinds.contains(&kind))
                .unwrap_or(true);
            if matches {
                listener.handle(event);
            }
        }
    }
}
