// events.rs — Goal event model and notification dispatch.
//
// The engine reports what happened during a pass as GoalEvents: node state
// changes, tracked-candidate switches, wait timers, predicate failures and
// load repairs. Notification sinks (a JSONL log, an in-memory buffer for
// tests, whatever the host wires in) receive every event.
//
// Dispatch is synchronous and happens after the pass has finished, so a
// sink is free to fire world events or queue tree mutations; both are
// picked up by the next pass.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use mc_events::{EntityId, SimTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GoalError;
use crate::state::{NodeId, NodeState};

/// Events emitted by a goal engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum GoalEvent {
    /// A node's state changed.
    StateChanged {
        tree_id: Uuid,
        node: NodeId,
        label: String,
        from: NodeState,
        to: NodeState,
        timestamp: DateTime<Utc>,
    },

    /// A tracking group switched subject.
    CandidateTracked {
        tree_id: Uuid,
        group: NodeId,
        previous: Option<EntityId>,
        candidate: Option<EntityId>,
        timestamp: DateTime<Utc>,
    },

    /// A satisfied tracking group started its wait.
    WaitStarted {
        tree_id: Uuid,
        group: NodeId,
        candidate: Option<EntityId>,
        deadline: SimTime,
        timestamp: DateTime<Utc>,
    },

    /// A running wait was interrupted.
    WaitCancelled {
        tree_id: Uuid,
        group: NodeId,
        candidate: Option<EntityId>,
        timestamp: DateTime<Utc>,
    },

    /// A wait ran to its deadline and the group completed.
    WaitElapsed {
        tree_id: Uuid,
        group: NodeId,
        candidate: Option<EntityId>,
        timestamp: DateTime<Utc>,
    },

    /// A predicate could not produce a verdict this pass.
    PredicateFailed {
        tree_id: Uuid,
        node: NodeId,
        predicate: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// A saved tree needed repairs to load.
    LoadRepaired {
        tree_id: Uuid,
        repairs: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

impl GoalEvent {
    /// Get the event type name as a string.
    pub fn event_type(&self) -> &str {
        match self {
            GoalEvent::StateChanged { .. } => "state_changed",
            GoalEvent::CandidateTracked { .. } => "candidate_tracked",
            GoalEvent::WaitStarted { .. } => "wait_started",
            GoalEvent::WaitCancelled { .. } => "wait_cancelled",
            GoalEvent::WaitElapsed { .. } => "wait_elapsed",
            GoalEvent::PredicateFailed { .. } => "predicate_failed",
            GoalEvent::LoadRepaired { .. } => "load_repaired",
        }
    }

    pub fn tree_id(&self) -> Uuid {
        match self {
            GoalEvent::StateChanged { tree_id, .. }
            | GoalEvent::CandidateTracked { tree_id, .. }
            | GoalEvent::WaitStarted { tree_id, .. }
            | GoalEvent::WaitCancelled { tree_id, .. }
            | GoalEvent::WaitElapsed { tree_id, .. }
            | GoalEvent::PredicateFailed { tree_id, .. }
            | GoalEvent::LoadRepaired { tree_id, .. } => *tree_id,
        }
    }

    /// Helper to create a StateChanged event.
    pub fn state_changed(tree_id: Uuid, node: NodeId, label: &str, from: NodeState, to: NodeState) -> Self {
        GoalEvent::StateChanged {
            tree_id,
            node,
            label: label.to_string(),
            from,
            to,
            timestamp: Utc::now(),
        }
    }

    /// Helper to create a LoadRepaired event.
    pub fn load_repaired(tree_id: Uuid, repairs: Vec<String>) -> Self {
        GoalEvent::LoadRepaired {
            tree_id,
            repairs,
            timestamp: Utc::now(),
        }
    }
}

/// Trait for receiving goal events.
///
/// Implementations decide what to do with each event: append it to a log,
/// keep it in memory, forward it to the host's UI.
pub trait NotificationSink: Send {
    /// Handle an event. Errors are logged but don't stop the engine.
    fn send(&self, event: &GoalEvent) -> Result<(), GoalError>;
}

/// Logs events as JSONL to a file.
pub struct LogSink {
    path: PathBuf,
}

impl LogSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl NotificationSink for LogSink {
    fn send(&self, event: &GoalEvent) -> Result<(), GoalError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| GoalError::IoError {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| GoalError::IoError {
                path: self.path.display().to_string(),
                source,
            })?;

        let json = serde_json::to_string(event)?;
        writeln!(file, "{}", json).map_err(|source| GoalError::IoError {
            path: self.path.display().to_string(),
            source,
        })?;

        Ok(())
    }
}

/// Keeps every event in a shared buffer. Clones share the buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<GoalEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far.
    pub fn events(&self) -> Vec<GoalEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Take everything received so far.
    pub fn take(&self) -> Vec<GoalEvent> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }
}

impl NotificationSink for MemorySink {
    fn send(&self, event: &GoalEvent) -> Result<(), GoalError> {
        self.events
            .lock()
            .map_err(|e| GoalError::NotificationError(e.to_string()))?
            .push(event.clone());
        Ok(())
    }
}

/// Dispatches events to multiple sinks.
///
/// Errors from individual sinks are logged (via tracing) but don't
/// prevent other sinks from receiving the event.
pub struct EventDispatcher {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl EventDispatcher {
    /// Create a new dispatcher with no sinks.
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Add a notification sink.
    pub fn add_sink(&mut self, sink: Box<dyn NotificationSink>) {
        self.sinks.push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Dispatch an event to all sinks.
    pub fn dispatch(&self, event: &GoalEvent) {
        for sink in &self.sinks {
            if let Err(e) = sink.send(event) {
                tracing::warn!("notification sink error: {}", e);
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
