//! # mc-cli
//!
//! Command-line interface for Mission Control goal trees.
//!
//! - `mc run <definition> <script>` — build a tree and play a scripted world
//!   timeline through it
//! - `mc resume <id> <script>` — continue a saved tree against a new timeline
//! - `mc list/show/delete` — inspect and manage saved trees

mod commands;
mod script;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use commands::run::RunOptions;
use mc_goal::ProjectLayout;
use tracing_subscriber::EnvFilter;

/// Mission Control — evaluate contract goal trees against a world.
#[derive(Parser)]
#[command(name = "mc", version, about)]
struct Cli {
    /// Project root directory (defaults to current directory).
    #[arg(long, default_value = ".")]
    project_root: PathBuf,

    /// Log engine passes at debug level.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a tree from a definition and drive it with a world script.
    Run {
        /// Tree definition (TOML, YAML or JSON).
        definition: PathBuf,
        /// World script (TOML, YAML or JSON).
        script: PathBuf,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Continue a saved tree with a world script.
    Resume {
        /// Saved tree ID.
        id: String,
        /// World script (TOML, YAML or JSON).
        script: PathBuf,
        #[command(flatten)]
        output: OutputArgs,
    },
    #[command(flatten)]
    Tree(commands::tree::TreeCommands),
}

#[derive(clap::Args)]
struct OutputArgs {
    /// Save the tree to the project store when the script ends.
    #[arg(long)]
    save: bool,
    /// Print the tree outline after every step.
    #[arg(long)]
    outline: bool,
    /// Append goal events to `.mc/events.jsonl`.
    #[arg(long)]
    log: bool,
}

impl From<&OutputArgs> for RunOptions {
    fn from(args: &OutputArgs) -> Self {
        RunOptions {
            save: args.save,
            outline: args.outline,
            log: args.log,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("mc_goal={}", level).parse()?)
                .add_directive(format!("mc_events={}", level).parse()?),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let project_root = cli.project_root.canonicalize().unwrap_or(cli.project_root);
    let layout = ProjectLayout::for_project(&project_root);

    match &cli.command {
        Commands::Run {
            definition,
            script,
            output,
        } => commands::run::execute(&layout, definition, script, output.into()),
        Commands::Resume { id, script, output } => {
            commands::run::resume(&layout, id, script, output.into())
        }
        Commands::Tree(command) => commands::tree::execute(command, &layout),
    }
}
