// world.rs — The engine's view of the outside world.
//
// The engine does not simulate anything. It reads a World snapshot through a
// small trait and judges entities and items with opaque predicates. Concrete
// predicates (orbit checks, crew counts, part inventories) live outside this
// crate and are registered by key in a PredicateRegistry, so definitions and
// saved trees can name them as plain strings.
//
// One family of predicates is built in: `attr:<name><op><value>` keys compare
// a numeric attribute exposed by `World::attribute`. They need no
// registration, which lets definitions stay fully declarative.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use mc_events::{EntityId, SimTime};
use serde::{Deserialize, Serialize};

use crate::error::{GoalError, PredicateError};

/// Identifier of an item belonging to an entity (a part, a crew seat...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read-only access to the current world snapshot.
pub trait World {
    /// Current simulated time.
    fn sim_time(&self) -> SimTime;

    /// Every entity that currently exists.
    fn entities(&self) -> Vec<EntityId>;

    /// The entity the player is focused on, if any.
    fn active_entity(&self) -> Option<EntityId>;

    /// One item collection of an entity (e.g. "parts", "crew").
    ///
    /// `None` means the collection cannot be queried yet; the engine treats
    /// that like an empty collection: no information, verdict Incomplete.
    fn items(&self, entity: &EntityId, source: &str) -> Option<Vec<ItemId>>;

    /// A numeric attribute of an entity or item, for `attr:` predicates.
    fn attribute(&self, subject: &str, name: &str) -> Option<f64> {
        let _ = (subject, name);
        None
    }

    fn contains(&self, entity: &EntityId) -> bool {
        self.entities().contains(entity)
    }
}

/// A boolean judgement over one subject (an entity or an item).
///
/// Predicates must be cheap, synchronous and free of side effects. An `Err`
/// means "unknown this pass", never a crash.
pub trait Predicate<S: ?Sized> {
    fn test(&self, world: &dyn World, subject: &S) -> Result<bool, PredicateError>;
}

struct FnPredicate<F>(F);

impl<S: ?Sized, F> Predicate<S> for FnPredicate<F>
where
    F: Fn(&dyn World, &S) -> Result<bool, PredicateError>,
{
    fn test(&self, world: &dyn World, subject: &S) -> Result<bool, PredicateError> {
        (self.0)(world, subject)
    }
}

/// Comparison used by attribute predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl Comparison {
    fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Gt => lhs > rhs,
            Comparison::Ge => lhs >= rhs,
            Comparison::Lt => lhs < rhs,
            Comparison::Le => lhs <= rhs,
            Comparison::Eq => (lhs - rhs).abs() < f64::EPSILON,
            Comparison::Ne => (lhs - rhs).abs() >= f64::EPSILON,
        }
    }
}

/// `attr:<name><op><value>`: compare a numeric attribute of the subject.
///
/// A subject without the attribute does not satisfy the test.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeTest {
    pub attribute: String,
    pub comparison: Comparison,
    pub value: f64,
}

impl AttributeTest {
    pub const PREFIX: &'static str = "attr:";

    /// Parse the part after `attr:`, e.g. `altitude>=70000`.
    pub fn parse(spec: &str) -> Option<Self> {
        // Two-character operators first so ">=" is not read as ">".
        const OPS: [(&str, Comparison); 6] = [
            (">=", Comparison::Ge),
            ("<=", Comparison::Le),
            ("==", Comparison::Eq),
            ("!=", Comparison::Ne),
            (">", Comparison::Gt),
            ("<", Comparison::Lt),
        ];
        for (token, comparison) in OPS {
            if let Some((name, value)) = spec.split_once(token) {
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                let value = value.trim().parse::<f64>().ok()?;
                return Some(Self {
                    attribute: name.to_string(),
                    comparison,
                    value,
                });
            }
        }
        None
    }

    fn holds_for(&self, world: &dyn World, subject: &str) -> bool {
        world
            .attribute(subject, &self.attribute)
            .is_some_and(|v| self.comparison.holds(v, self.value))
    }
}

impl Predicate<EntityId> for AttributeTest {
    fn test(&self, world: &dyn World, subject: &EntityId) -> Result<bool, PredicateError> {
        Ok(self.holds_for(world, subject.as_str()))
    }
}

impl Predicate<ItemId> for AttributeTest {
    fn test(&self, world: &dyn World, subject: &ItemId) -> Result<bool, PredicateError> {
        Ok(self.holds_for(world, subject.as_str()))
    }
}

/// A predicate bound to the key it was registered under.
///
/// The key is what gets persisted. A reference loaded from a save whose key
/// is no longer registered keeps the key but has no predicate; testing it
/// yields a `PredicateError`, so the node stays Incomplete instead of the
/// whole load failing.
pub struct PredicateRef<S: ?Sized> {
    key: String,
    predicate: Option<Rc<dyn Predicate<S>>>,
}

impl<S: ?Sized> PredicateRef<S> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_resolved(&self) -> bool {
        self.predicate.is_some()
    }

    pub fn test(&self, world: &dyn World, subject: &S) -> Result<bool, PredicateError> {
        match &self.predicate {
            Some(p) => p.test(world, subject),
            None => Err(PredicateError::new(&self.key, "predicate is not registered")),
        }
    }

    pub(crate) fn unresolved(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            predicate: None,
        }
    }
}

impl<S: ?Sized> Clone for PredicateRef<S> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<S: ?Sized> fmt::Debug for PredicateRef<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateRef")
            .field("key", &self.key)
            .field("resolved", &self.predicate.is_some())
            .finish()
    }
}

/// Named predicates available to definitions and loaders.
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    entity: BTreeMap<String, Rc<dyn Predicate<EntityId>>>,
    item: BTreeMap<String, Rc<dyn Predicate<ItemId>>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entity(
        &mut self,
        key: impl Into<String>,
        predicate: impl Predicate<EntityId> + 'static,
    ) {
        self.entity.insert(key.into(), Rc::new(predicate));
    }

    pub fn register_item(&mut self, key: impl Into<String>, predicate: impl Predicate<ItemId> + 'static) {
        self.item.insert(key.into(), Rc::new(predicate));
    }

    /// Register a closure as an entity predicate.
    pub fn entity_fn<F>(&mut self, key: impl Into<String>, f: F)
    where
        F: Fn(&dyn World, &EntityId) -> Result<bool, PredicateError> + 'static,
    {
        self.entity.insert(key.into(), Rc::new(FnPredicate(f)));
    }

    /// Register a closure as an item predicate.
    pub fn item_fn<F>(&mut self, key: impl Into<String>, f: F)
    where
        F: Fn(&dyn World, &ItemId) -> Result<bool, PredicateError> + 'static,
    {
        self.item.insert(key.into(), Rc::new(FnPredicate(f)));
    }

    pub fn entity_keys(&self) -> Vec<String> {
        self.entity.keys().cloned().collect()
    }

    pub fn item_keys(&self) -> Vec<String> {
        self.item.keys().cloned().collect()
    }

    /// Resolve an entity predicate key, failing if it is unknown.
    pub fn resolve_entity(&self, key: &str) -> Result<PredicateRef<EntityId>, GoalError> {
        if let Some(p) = self.entity.get(key) {
            return Ok(PredicateRef {
                key: key.to_string(),
                predicate: Some(p.clone()),
            });
        }
        match attribute_test(key) {
            Some(test) => Ok(PredicateRef {
                key: key.to_string(),
                predicate: Some(Rc::new(test)),
            }),
            None => Err(GoalError::UnknownPredicate {
                kind: "entity",
                key: key.to_string(),
            }),
        }
    }

    /// Resolve an item predicate key, failing if it is unknown.
    pub fn resolve_item(&self, key: &str) -> Result<PredicateRef<ItemId>, GoalError> {
        if let Some(p) = self.item.get(key) {
            return Ok(PredicateRef {
                key: key.to_string(),
                predicate: Some(p.clone()),
            });
        }
        match attribute_test(key) {
            Some(test) => Ok(PredicateRef {
                key: key.to_string(),
                predicate: Some(Rc::new(test)),
            }),
            None => Err(GoalError::UnknownPredicate {
                kind: "item",
                key: key.to_string(),
            }),
        }
    }

    /// Like [`resolve_entity`](Self::resolve_entity) but degrades to an
    /// unresolved reference. Used when loading saves.
    pub fn resolve_entity_lenient(&self, key: &str) -> PredicateRef<EntityId> {
        self.resolve_entity(key).unwrap_or_else(|e| {
            tracing::warn!("{}; node will stay incomplete", e);
            PredicateRef::unresolved(key)
        })
    }

    pub fn resolve_item_lenient(&self, key: &str) -> PredicateRef<ItemId> {
        self.resolve_item(key).unwrap_or_else(|e| {
            tracing::warn!("{}; filter will stay incomplete", e);
            PredicateRef::unresolved(key)
        })
    }
}

impl fmt::Debug for PredicateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateRegistry")
            .field("entity", &self.entity.keys().collect::<Vec<_>>())
            .field("item", &self.item.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn attribute_test(key: &str) -> Option<AttributeTest> {
    key.strip_prefix(AttributeTest::PREFIX)
        .and_then(AttributeTest::parse)
}

/// A plain in-memory world.
///
/// Handy for tests and for scripted runs: entities, item collections and
/// numeric attributes are set directly, and the caller fires the matching
/// events into the tree's bus.
#[derive(Debug, Clone, Default)]
pub struct MemoryWorld {
    time: SimTime,
    entities: BTreeSet<EntityId>,
    active: Option<EntityId>,
    items: BTreeMap<(EntityId, String), Vec<ItemId>>,
    attributes: BTreeMap<String, BTreeMap<String, f64>>,
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entity(&mut self, entity: impl Into<EntityId>) {
        self.entities.insert(entity.into());
    }

    /// Remove an entity with its item collections.
    pub fn remove_entity(&mut self, entity: &EntityId) {
        self.entities.remove(entity);
        self.items.retain(|(owner, _), _| owner != entity);
        if self.active.as_ref() == Some(entity) {
            self.active = None;
        }
    }

    pub fn set_active(&mut self, entity: Option<EntityId>) {
        self.active = entity;
    }

    pub fn set_items(&mut self, entity: impl Into<EntityId>, source: &str, items: Vec<ItemId>) {
        self.items.insert((entity.into(), source.to_string()), items);
    }

    pub fn clear_items(&mut self, entity: &EntityId, source: &str) {
        self.items.remove(&(entity.clone(), source.to_string()));
    }

    pub fn set_attribute(&mut self, subject: &str, name: &str, value: f64) {
        self.attributes
            .entry(subject.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    pub fn remove_attribute(&mut self, subject: &str, name: &str) {
        if let Some(attrs) = self.attributes.get_mut(subject) {
            attrs.remove(name);
        }
    }

    pub fn set_time(&mut self, time: SimTime) {
        self.time = time;
    }

    /// Move simulated time forward.
    pub fn advance(&mut self, secs: f64) {
        self.time = self.time + secs;
    }
}

impl World for MemoryWorld {
    fn sim_time(&self) -> SimTime {
        self.time
    }

    fn entities(&self) -> Vec<EntityId> {
        self.entities.iter().cloned().collect()
    }

    fn active_entity(&self) -> Option<EntityId> {
        self.active.clone()
    }

    fn items(&self, entity: &EntityId, source: &str) -> Option<Vec<ItemId>> {
        if !self.entities.contains(entity) {
            return None;
        }
        self.items.get(&(entity.clone(), source.to_string())).cloned()
    }

    fn attribute(&self, subject: &str, name: &str) -> Option<f64> {
        self.attributes.get(subject)?.get(name).copied()
    }

    fn contains(&self, entity: &EntityId) -> bool {
        self.entities.contains(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_test_parses_operators() {
        let t = AttributeTest::parse("altitude>=70000").unwrap();
        assert_eq!(t.attribute, "altitude");
        assert_eq!(t.comparison, Comparison::Ge);
        assert_eq!(t.value, 70000.0);

        assert_eq!(AttributeTest::parse("crew < 3").unwrap().comparison, Comparison::Lt);
        assert!(AttributeTest::parse(">=5").is_none());
        assert!(AttributeTest::parse("mass>heavy").is_none());
        assert!(AttributeTest::parse("no_operator").is_none());
    }

    #[test]
    fn attribute_predicates_resolve_without_registration() {
        let registry = PredicateRegistry::new();
        let mut world = MemoryWorld::new();
        world.add_entity("ship");
        world.set_attribute("ship", "altitude", 80_000.0);

        let high = registry.resolve_entity("attr:altitude>70000").unwrap();
        let low = registry.resolve_entity("attr:altitude<1000").unwrap();
        let ship = EntityId::new("ship");
        assert!(high.test(&world, &ship).unwrap());
        assert!(!low.test(&world, &ship).unwrap());
        // Missing attribute never satisfies.
        let other = EntityId::new("rock");
        assert!(!high.test(&world, &other).unwrap());
    }

    #[test]
    fn unknown_key_fails_strict_and_degrades_lenient() {
        let registry = PredicateRegistry::new();
        assert!(matches!(
            registry.resolve_entity("orbit.eccentric"),
            Err(GoalError::UnknownPredicate { kind: "entity", .. })
        ));

        let lenient = registry.resolve_item_lenient("part.has_antenna");
        assert!(!lenient.is_resolved());
        let err = lenient
            .test(&MemoryWorld::new(), &ItemId::new("p1"))
            .unwrap_err();
        assert_eq!(err.predicate, "part.has_antenna");
    }

    #[test]
    fn closures_register_as_predicates() {
        let mut registry = PredicateRegistry::new();
        registry.entity_fn("named.alpha", |_, e| Ok(e.as_str() == "alpha"));
        let p = registry.resolve_entity("named.alpha").unwrap();
        let world = MemoryWorld::new();
        assert!(p.test(&world, &EntityId::new("alpha")).unwrap());
        assert!(!p.test(&world, &EntityId::new("beta")).unwrap());
        assert_eq!(registry.entity_keys(), vec!["named.alpha".to_string()]);
    }

    #[test]
    fn memory_world_items_need_entity_and_collection() {
        let mut world = MemoryWorld::new();
        let ship = EntityId::new("ship");
        assert!(world.items(&ship, "parts").is_none());

        world.add_entity("ship");
        assert!(world.items(&ship, "parts").is_none());

        world.set_items("ship", "parts", vec![ItemId::new("dock")]);
        assert_eq!(world.items(&ship, "parts").unwrap().len(), 1);

        world.set_active(Some(ship.clone()));
        world.remove_entity(&ship);
        assert!(world.items(&ship, "parts").is_none());
        assert!(world.active_entity().is_none());
    }
}
