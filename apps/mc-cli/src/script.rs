// script.rs — Scripted world timelines for `mc run`.
//
// A script describes a world as a list of timed steps. Each step moves the
// simulated clock and changes the world; the matching world events are fired
// for every change, so a tree sees exactly what a live world would report.
//
//   entities = ["kestrel"]
//   active = "kestrel"
//
//   [[steps]]
//   at = 0.0
//   attributes = { kestrel = { orbit = 1.0 } }
//
//   [[steps]]
//   at = 30.0
//   items = { kestrel = { parts = ["port-1"] } }
//   events = [{ kind = "custom:docked", entity = "kestrel" }]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use mc_events::{EntityId, EventBus, EventKind, SimTime, WorldEvent};
use mc_goal::{ItemId, MemoryWorld, World};
use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WorldScript {
    #[serde(default)]
    pub entities: Vec<EntityId>,

    #[serde(default)]
    pub active: Option<EntityId>,

    #[serde(default)]
    pub steps: Vec<ScriptStep>,
}

/// One point of the timeline.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScriptStep {
    /// Simulated time in seconds.
    pub at: f64,

    #[serde(default)]
    pub add: Vec<EntityId>,

    #[serde(default)]
    pub remove: Vec<EntityId>,

    /// New active entity. An empty string clears it.
    #[serde(default)]
    pub active: Option<String>,

    /// subject → attribute → value. Subjects may be entities or items.
    #[serde(default)]
    pub attributes: BTreeMap<String, BTreeMap<String, f64>>,

    /// entity → source → items.
    #[serde(default)]
    pub items: BTreeMap<EntityId, BTreeMap<String, Vec<ItemId>>>,

    /// Extra events fired as-is.
    #[serde(default)]
    pub events: Vec<WorldEvent>,
}

impl WorldScript {
    /// Parse a script; `.yaml`/`.yml` and `.json` by extension, TOML
    /// otherwise.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading world script {}", path.display()))?;
        let script = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };
        Ok(script)
    }

    /// The world before the first step.
    pub fn initial_world(&self) -> MemoryWorld {
        let mut world = MemoryWorld::new();
        for entity in &self.entities {
            world.add_entity(entity.clone());
        }
        world.set_active(self.active.clone());
        world
    }
}

impl ScriptStep {
    /// Apply the step to `world` and fire the events it implies into `bus`.
    /// Returns the number of events fired.
    pub fn apply(&self, world: &mut MemoryWorld, bus: &EventBus) -> usize {
        let mut fired = Vec::new();
        world.set_time(SimTime(self.at));

        for entity in &self.add {
            world.add_entity(entity.clone());
            fired.push(WorldEvent::for_entity(EventKind::EntityCreated, entity.clone()));
        }
        for entity in &self.remove {
            world.remove_entity(entity);
            fired.push(WorldEvent::for_entity(EventKind::EntityDestroyed, entity.clone()));
        }
        if let Some(active) = &self.active {
            let active = (!active.is_empty()).then(|| EntityId::new(active.as_str()));
            world.set_active(active.clone());
            fired.push(WorldEvent {
                kind: EventKind::ActiveEntityChanged,
                entity: active,
            });
        }
        for (subject, attributes) in &self.attributes {
            for (name, value) in attributes {
                world.set_attribute(subject, name, *value);
            }
            let entity = EntityId::new(subject.as_str());
            fired.push(if world.contains(&entity) {
                WorldEvent::for_entity(EventKind::EntityModified, entity)
            } else {
                WorldEvent::new(EventKind::EntityModified)
            });
        }
        for (entity, sources) in &self.items {
            for (source, items) in sources {
                world.set_items(entity.clone(), source, items.clone());
            }
            fired.push(WorldEvent::for_entity(EventKind::ItemsChanged, entity.clone()));
        }
        fired.extend(self.events.iter().cloned());

        let count = fired.len();
        for event in fired {
            bus.fire(event);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"
entities = ["kestrel"]
active = "kestrel"

[[steps]]
at = 0.0
attributes = { kestrel = { orbit = 1.0 }, "port-1" = { mass = 2.0 } }

[[steps]]
at = 12.5
add = ["heron"]
items = { kestrel = { parts = ["port-1"] } }
events = [{ kind = "custom:docked", entity = "kestrel" }]

[[steps]]
at = 20.0
active = ""
"#;

    fn script() -> WorldScript {
        toml::from_str(SCRIPT).unwrap()
    }

    #[test]
    fn steps_change_the_world_and_fire_matching_events() {
        let script = script();
        let mut world = script.initial_world();
        let bus = EventBus::new();
        assert_eq!(world.active_entity(), Some(EntityId::new("kestrel")));

        assert_eq!(script.steps[0].apply(&mut world, &bus), 2);
        assert_eq!(world.attribute("kestrel", "orbit"), Some(1.0));
        let events = bus.drain();
        assert_eq!(events[0].entity, Some(EntityId::new("kestrel")));
        // "port-1" is an item, not an entity.
        assert_eq!(events[1].entity, None);

        assert_eq!(script.steps[1].apply(&mut world, &bus), 3);
        assert_eq!(world.sim_time(), SimTime(12.5));
        assert!(world.contains(&EntityId::new("heron")));
        assert_eq!(
            world.items(&EntityId::new("kestrel"), "parts"),
            Some(vec![ItemId::new("port-1")])
        );
        let kinds: Vec<EventKind> = bus.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::EntityCreated,
                EventKind::ItemsChanged,
                EventKind::Custom("docked".into())
            ]
        );

        script.steps[2].apply(&mut world, &bus);
        assert_eq!(world.active_entity(), None);
    }

    #[test]
    fn yaml_scripts_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.yaml");
        std::fs::write(
            &path,
            "entities: [kestrel]\nsteps:\n  - at: 1\n    remove: [kestrel]\n",
        )
        .unwrap();
        let script = WorldScript::load(&path).unwrap();
        assert_eq!(script.entities, vec![EntityId::new("kestrel")]);
        assert_eq!(script.steps[0].remove, vec![EntityId::new("kestrel")]);
        assert_eq!(script.steps[0].at, 1.0);
    }
}
