// error.rs — Error types for the goal engine.

use thiserror::Error;
use uuid::Uuid;

use crate::state::NodeId;

/// Errors that can occur while building, mutating or persisting goal trees.
#[derive(Debug, Error)]
pub enum GoalError {
    /// A file I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: String,
        source: std::io::Error,
    },

    /// Failed to serialize/deserialize goal data.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The requested saved tree was not found.
    #[error("saved tree not found: {0}")]
    NotFound(Uuid),

    /// A node id does not exist in the tree.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// A definition names a predicate that is not registered.
    #[error("unknown {kind} predicate '{key}'")]
    UnknownPredicate { kind: &'static str, key: String },

    /// A definition violates a structural rule.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// A config file could not be parsed.
    #[error("config error in {path}: {reason}")]
    ConfigError { path: String, reason: String },

    /// Event routing failed.
    #[error("event error: {0}")]
    Event(#[from] mc_events::EventError),

    /// A notification dispatch failed (non-fatal).
    #[error("notification error: {0}")]
    NotificationError(String),
}

/// A predicate could not produce a verdict.
///
/// The engine treats this as "unknown this pass": the node goes Incomplete
/// and is retried on the next re-check.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("predicate '{predicate}' failed: {message}")]
pub struct PredicateError {
    pub predicate: String,
    pub message: String,
}

impl PredicateError {
    pub fn new(predicate: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            predicate: predicate.into(),
            message: message.into(),
        }
    }
}
