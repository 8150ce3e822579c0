// event.rs — World event model.
//
// A WorldEvent says "something about this entity changed, re-check". The
// payload is deliberately thin: the engine always re-reads the current world
// snapshot, so events only need to say *what kind* of thing changed and
// *which entity* (if any) it concerns. Duplicate or out-of-order delivery is
// therefore harmless.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EventError;

/// Identifier of a world entity (a craft, a station, a crew member...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Simulated (game) time in seconds.
///
/// Wraps an `f64` and orders with `total_cmp`, so it can key a heap.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimTime(pub f64);

impl SimTime {
    pub fn seconds(self) -> f64 {
        self.0
    }
}

impl PartialEq for SimTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SimTime {}

impl PartialOrd for SimTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SimTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Add<f64> for SimTime {
    type Output = SimTime;

    fn add(self, secs: f64) -> SimTime {
        SimTime(self.0 + secs)
    }
}

impl Sub for SimTime {
    type Output = f64;

    fn sub(self, other: SimTime) -> f64 {
        self.0 - other.0
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T+{:.1}s", self.0)
    }
}

/// The kind of change a world event reports.
///
/// Serialized as a plain string (`"items_changed"`, `"custom:docked"`) so
/// definitions can list event kinds compactly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventKind {
    /// A new entity appeared in the world.
    EntityCreated,
    /// An entity was removed from the world.
    EntityDestroyed,
    /// Some property of an entity changed (situation, orbit, name...).
    EntityModified,
    /// The world's active (focused) entity changed.
    ActiveEntityChanged,
    /// An entity's item collections changed (parts attached, resources moved).
    ItemsChanged,
    /// Crew moved between entities.
    CrewChanged,
    /// A goal node changed state. Raised by the engine itself.
    GoalChanged,
    /// Anything else, named by the world.
    Custom(String),
}

impl EventKind {
    /// The kinds an entity-population watcher (a tracking group) listens to.
    pub fn population() -> Vec<EventKind> {
        vec![
            EventKind::EntityCreated,
            EventKind::EntityDestroyed,
            EventKind::EntityModified,
            EventKind::ActiveEntityChanged,
        ]
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::EntityCreated => write!(f, "entity_created"),
            EventKind::EntityDestroyed => write!(f, "entity_destroyed"),
            EventKind::EntityModified => write!(f, "entity_modified"),
            EventKind::ActiveEntityChanged => write!(f, "active_entity_changed"),
            EventKind::ItemsChanged => write!(f, "items_changed"),
            EventKind::CrewChanged => write!(f, "crew_changed"),
            EventKind::GoalChanged => write!(f, "goal_changed"),
            EventKind::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entity_created" => Ok(EventKind::EntityCreated),
            "entity_destroyed" => Ok(EventKind::EntityDestroyed),
            "entity_modified" => Ok(EventKind::EntityModified),
            "active_entity_changed" => Ok(EventKind::ActiveEntityChanged),
            "items_changed" => Ok(EventKind::ItemsChanged),
            "crew_changed" => Ok(EventKind::CrewChanged),
            "goal_changed" => Ok(EventKind::GoalChanged),
            other => match other.strip_prefix("custom:") {
                Some(name) if !name.is_empty() => Ok(EventKind::Custom(name.to_string())),
                _ => Err(EventError::UnknownKind(other.to_string())),
            },
        }
    }
}

impl TryFrom<String> for EventKind {
    type Error = EventError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> String {
        kind.to_string()
    }
}

/// A change notification delivered by the world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldEvent {
    pub kind: EventKind,
    /// The affected entity, if the change concerns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityId>,
}

impl WorldEvent {
    pub fn new(kind: EventKind) -> Self {
        Self { kind, entity: None }
    }

    pub fn for_entity(kind: EventKind, entity: impl Into<EntityId>) -> Self {
        Self {
            kind,
            entity: Some(entity.into()),
        }
    }
}
