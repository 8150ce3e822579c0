// tree.rs — Saved tree subcommands: list, show, delete.

use std::io::Write;

use anyhow::Context;
use clap::Subcommand;
use mc_goal::{GoalEngine, PredicateRegistry, ProjectLayout, TreeStore};
use uuid::Uuid;

#[derive(Subcommand)]
pub enum TreeCommands {
    /// List saved trees, most recent first.
    List,
    /// Show a saved tree's outline.
    Show {
        /// Tree ID.
        id: String,
        /// Print the stored JSON instead of the outline.
        #[arg(long)]
        json: bool,
    },
    /// Delete a saved tree.
    Delete {
        /// Tree ID.
        id: String,
    },
}

pub fn execute(cmd: &TreeCommands, layout: &ProjectLayout) -> anyhow::Result<()> {
    let store = TreeStore::new(&layout.trees_dir)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match cmd {
        TreeCommands::List => list_trees(&store, &mut out),
        TreeCommands::Show { id, json } => show_tree(&store, layout, id, *json, &mut out),
        TreeCommands::Delete { id } => delete_tree(&store, id, &mut out),
    }
}

fn parse_id(id: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("invalid tree id: {}", id))
}

fn list_trees(store: &TreeStore, out: &mut dyn Write) -> anyhow::Result<()> {
    let trees = store.list()?;
    if trees.is_empty() {
        writeln!(out, "No saved trees found.")?;
        return Ok(());
    }

    writeln!(out, "{:<38} {:<30} {:<22} {:<12}", "ID", "NAME", "SAVED", "STATE")?;
    writeln!(out, "{}", "-".repeat(104))?;
    for t in &trees {
        writeln!(
            out,
            "{:<38} {:<30} {:<22} {:<12}",
            t.tree_id,
            truncate(&t.name, 28),
            t.saved_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            t.root_state().to_string(),
        )?;
    }
    writeln!(out, "\n{} tree(s) total.", trees.len())?;
    Ok(())
}

fn show_tree(
    store: &TreeStore,
    layout: &ProjectLayout,
    id: &str,
    json: bool,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let tree_id = parse_id(id)?;
    let Some(saved) = store.get(tree_id)? else {
        anyhow::bail!("saved tree not found: {}", id);
    };

    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&saved)?)?;
        return Ok(());
    }

    let (engine, report) = GoalEngine::restore(&saved, &PredicateRegistry::new(), layout.engine_config());
    writeln!(out, "Tree:   {}", saved.tree_id)?;
    writeln!(out, "Name:   {}", saved.name)?;
    writeln!(out, "Saved:  {}", saved.saved_at.to_rfc3339())?;
    writeln!(out, "State:  {}", engine.state())?;
    writeln!(out, "Nodes:  {}", engine.tree().len())?;
    if let Some(digest) = &saved.definition_digest {
        writeln!(out, "Digest: {}", digest)?;
    }
    for repair in &report.repairs {
        writeln!(out, "Repair: {}", repair)?;
    }
    writeln!(out)?;
    write!(out, "{}", engine.outline())?;
    Ok(())
}

fn delete_tree(store: &TreeStore, id: &str, out: &mut dyn Write) -> anyhow::Result<()> {
    let tree_id = parse_id(id)?;
    let Some(saved) = store.get(tree_id)? else {
        anyhow::bail!("saved tree not found: {}", id);
    };
    store.delete(tree_id)?;
    writeln!(out, "Deleted tree: {} ({})", saved.name, tree_id)?;
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        s.to_string()
    }
}
