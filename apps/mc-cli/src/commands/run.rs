// run.rs — Drive a goal tree through a scripted world timeline.
//
// `mc run` builds a fresh tree from a definition file; `mc resume` restores a
// saved one. Either way the script's steps are applied in order and the tree
// is processed after each, printing the state changes the step caused.

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use mc_goal::{GoalEngine, LogSink, PredicateRegistry, ProjectLayout, TreeDefinition, TreeStore, World};

use crate::script::WorldScript;

/// Output options shared by `run` and `resume`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Save the tree to the project's store after the last step.
    pub save: bool,
    /// Print the visible outline after every step.
    pub outline: bool,
    /// Append goal events to the project's event log.
    pub log: bool,
}

pub fn execute(layout: &ProjectLayout, definition: &Path, script: &Path, options: RunOptions) -> anyhow::Result<()> {
    let definition = TreeDefinition::load(definition)
        .with_context(|| format!("loading tree definition {}", definition.display()))?;
    let registry = PredicateRegistry::new();
    let engine = GoalEngine::from_definition(&definition, &registry, layout.engine_config())?;
    run_script(layout, engine, script, options)
}

pub fn resume(layout: &ProjectLayout, id: &str, script: &Path, options: RunOptions) -> anyhow::Result<()> {
    let tree_id = uuid::Uuid::parse_str(id).with_context(|| format!("invalid tree id: {}", id))?;
    let store = TreeStore::new(&layout.trees_dir)?;
    let saved = store.load(tree_id)?;

    let registry = PredicateRegistry::new();
    let (engine, report) = GoalEngine::restore(&saved, &registry, layout.engine_config());
    for repair in &report.repairs {
        eprintln!("Repaired: {}", repair);
    }
    run_script(layout, engine, script, options)
}

fn run_script(layout: &ProjectLayout, mut engine: GoalEngine, script: &Path, options: RunOptions) -> anyhow::Result<()> {
    let script = WorldScript::load(script)?;
    tracing::debug!(steps = script.steps.len(), entities = script.entities.len(), "world script loaded");
    if options.log {
        engine.add_sink(Box::new(LogSink::new(&layout.events_log)));
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    drive(&mut engine, &script, options.outline, &mut out)?;

    if options.save {
        let store = TreeStore::new(&layout.trees_dir)?;
        store.save(&engine.snapshot()?)?;
        tracing::info!(tree_id = %engine.tree_id(), dir = %store.dir().display(), "tree saved");
        writeln!(out, "Saved tree: {} ({})", engine.name(), engine.tree_id())?;
    }
    Ok(())
}

/// Activate `engine` at the script's start and play every step through it.
pub(crate) fn drive(
    engine: &mut GoalEngine,
    script: &WorldScript,
    outline: bool,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let mut world = script.initial_world();
    engine.activate(Utc::now(), world.sim_time())?;
    let bus = engine.bus();

    writeln!(out, "Tree:  {} ({})", engine.name(), engine.tree_id())?;
    writeln!(out, "State: {}", engine.state())?;

    for step in &script.steps {
        let fired = step.apply(&mut world, &bus);
        let changes = engine.process(&world, Utc::now())?;

        writeln!(out, "\n{}  {} event(s)", world.sim_time(), fired)?;
        for change in &changes {
            let label = engine
                .tree()
                .node(change.changed)
                .map(|node| node.label().to_string())
                .unwrap_or_else(|| change.changed.to_string());
            writeln!(out, "  {}: {} -> {}", label, change.from, change.to)?;
        }
        writeln!(out, "  root: {}", engine.state())?;
        if outline {
            for line in engine.outline().lines() {
                writeln!(out, "    {}", line)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_goal::{DefinitionFormat, EngineConfig};

    const ORBIT: &str = r#"
name = "Orbit"

[root]
type = "sequence"
title = "Orbit"

[[root.children]]
type = "condition"
title = "Reach orbit"
predicate = "attr:orbit>=1"
events = ["entity_modified"]

[[root.children]]
type = "condition"
title = "Land"
predicate = "attr:landed>=1"
events = ["entity_modified"]
"#;

    const SCRIPT: &str = r#"
entities = ["kestrel"]
active = "kestrel"

[[steps]]
at = 5.0
attributes = { kestrel = { orbit = 1.0 } }

[[steps]]
at = 40.0
attributes = { kestrel = { landed = 1.0 } }
"#;

    fn engine() -> GoalEngine {
        let definition = TreeDefinition::parse(ORBIT, DefinitionFormat::Toml).unwrap();
        GoalEngine::from_definition(&definition, &PredicateRegistry::new(), EngineConfig::default()).unwrap()
    }

    #[test]
    fn drive_prints_changes_per_step() {
        let mut engine = engine();
        let script: WorldScript = toml::from_str(SCRIPT).unwrap();
        let mut out = Vec::new();

        drive(&mut engine, &script, false, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("State: incomplete"));
        assert!(text.contains("T+5.0s  1 event(s)\n  Reach orbit: incomplete -> complete\n  root: incomplete"));
        assert!(text.contains("T+40.0s  1 event(s)"));
        assert!(text.contains("  Land: incomplete -> complete"));
        assert!(text.trim_end().ends_with("root: complete"));
        assert_eq!(engine.state(), mc_goal::NodeState::Complete);
    }

    #[test]
    fn outline_follows_each_step() {
        let mut engine = engine();
        let script: WorldScript = toml::from_str(SCRIPT).unwrap();
        let mut out = Vec::new();

        drive(&mut engine, &script, true, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("    [x] Reach orbit (condition)"));
    }

    #[test]
    fn run_then_resume_through_the_store() {
        let project = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::for_project(project.path());
        let definition = project.path().join("orbit.toml");
        let first = project.path().join("first.toml");
        let second = project.path().join("second.toml");
        std::fs::write(&definition, ORBIT).unwrap();
        std::fs::write(
            &first,
            "entities = [\"kestrel\"]\nactive = \"kestrel\"\n[[steps]]\nat = 5.0\nattributes = { kestrel = { orbit = 1.0 } }\n",
        )
        .unwrap();
        std::fs::write(
            &second,
            "entities = [\"kestrel\"]\nactive = \"kestrel\"\n[[steps]]\nat = 40.0\nattributes = { kestrel = { orbit = 1.0, landed = 1.0 } }\n",
        )
        .unwrap();

        let options = RunOptions {
            save: true,
            log: true,
            ..RunOptions::default()
        };
        execute(&layout, &definition, &first, options).unwrap();

        let store = TreeStore::new(&layout.trees_dir).unwrap();
        let saved = store.list().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].root_state(), mc_goal::NodeState::Incomplete);
        assert!(layout.events_log.exists());

        let id = saved[0].tree_id.to_string();
        resume(&layout, &id, &second, options).unwrap();
        let saved = store.load(saved[0].tree_id).unwrap();
        assert_eq!(saved.root_state(), mc_goal::NodeState::Complete);
    }

    #[test]
    fn resume_rejects_bad_ids() {
        let project = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::for_project(project.path());
        let script = project.path().join("s.toml");
        std::fs::write(&script, "").unwrap();

        assert!(resume(&layout, "not-a-uuid", &script, RunOptions::default()).is_err());
        let missing = uuid::Uuid::new_v4().to_string();
        assert!(resume(&layout, &missing, &script, RunOptions::default()).is_err());
    }
}
