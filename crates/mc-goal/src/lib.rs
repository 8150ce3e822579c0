//! # mc-goal
//!
//! Incremental goal-tree evaluation for Mission Control contracts.
//!
//! A contract is a tree of goal nodes. Leaves test the world (conditions,
//! filters over an entity's items, references to other nodes); inner nodes
//! combine their children (All, Any, AtLeast, AtMost, None, Sequence) or
//! pick a single entity the whole subtree must hold for (tracking groups).
//! Nodes subscribe to world events and are re-evaluated only when something
//! they depend on changes; state changes bubble to the root within one pass.
//!
//! ## Key components
//!
//! - [`GoalTree`] — arena of [`GoalNode`]s, the only place states are stored
//! - [`GoalEngine`] — one tree plus its [`EventBridge`]; runs evaluation
//!   passes and applies queued [`Mutation`]s between them
//! - [`TreeDefinition`] — TOML/YAML description a tree is built from
//! - [`save_tree`] / [`load_tree`] — lenient node-record persistence
//! - [`TreeStore`] — JSON file-based storage for [`SavedTree`]s
//! - [`GoalEvent`] / [`EventDispatcher`] — what happened, sent to
//!   [`NotificationSink`]s after every pass
//! - [`render_outline`] — text outline of the visible tree

pub mod bridge;
pub mod codec;
pub mod combinator;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub(crate) mod eval;
pub mod events;
pub mod filter;
pub mod node;
pub mod outline;
pub mod state;
pub mod store;
pub mod tracking;
pub mod tree;
pub mod world;

pub use bridge::{EventBridge, Triggers};
pub use codec::{load_tree, save_tree, LoadReport, NodeRecord};
pub use config::{EngineConfig, PollDefaults, ProjectLayout};
pub use definition::{DefinitionFormat, KindDef, NodeDef, TreeDefinition};
pub use engine::{GoalEngine, StateChange};
pub use error::{GoalError, PredicateError};
pub use events::{EventDispatcher, GoalEvent, LogSink, MemorySink, NotificationSink};
pub use filter::{CountFilter, DelegateFilter, FilterOutcome, FilterSpec, MatchPolicy};
pub use node::{
    ConditionNode, FilterGroupNode, GoalNode, NodeFlags, NodeKind, NodeSpec, PollSpec, ReferenceNode,
    ReferenceTarget, SequenceNode,
};
pub use outline::render_outline;
pub use state::{Memo, NodeId, NodePath, NodeState};
pub use store::{SavedTree, TreeStore};
pub use tracking::{CandidateMemo, TrackingGroup};
pub use tree::{GoalTree, Mutation, MutationQueue};
pub use world::{ItemId, MemoryWorld, Predicate, PredicateRef, PredicateRegistry, World};
