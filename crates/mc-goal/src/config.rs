// config.rs — Engine tuning and on-disk layout.
//
// EngineConfig holds the knobs of the evaluation loop (default poll periods
// and the bounds that stop notification storms). It is read from
// `.mc/engine.toml`; every field has a default, so a missing or partial file
// is fine.
//
// ProjectLayout determines where trees and the event log live. The
// `for_project()` constructor places everything under `.mc/` in the project
// root.

use std::path::{Path, PathBuf};

use mc_events::{EventError, PollInterval};
use serde::{Deserialize, Serialize};

use crate::error::GoalError;

/// Default poll periods for nodes that ask to be polled without giving one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollDefaults {
    /// Wall-clock period in milliseconds.
    #[serde(default = "default_wall_ms")]
    pub wall_ms: u64,

    /// Simulated-time period in seconds.
    #[serde(default = "default_sim_secs")]
    pub sim_secs: f64,
}

fn default_wall_ms() -> u64 {
    1000
}

fn default_sim_secs() -> f64 {
    5.0
}

impl Default for PollDefaults {
    fn default() -> Self {
        Self {
            wall_ms: default_wall_ms(),
            sim_secs: default_sim_secs(),
        }
    }
}

impl PollDefaults {
    pub fn interval(&self) -> Result<PollInterval, EventError> {
        PollInterval::from_units(Some(self.wall_ms), Some(self.sim_secs))
    }
}

/// Evaluation loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub poll: PollDefaults,

    /// Goal-changed delivery rounds per pass. Each round re-evaluates the
    /// subscribers that have not yet heard about this pass's changes.
    #[serde(default = "default_goal_change_rounds")]
    pub max_goal_change_rounds: usize,

    /// Passes per `process` call. Events fired during a pass are handled by
    /// the next one; anything left after the last pass waits for the next
    /// call.
    #[serde(default = "default_event_passes")]
    pub max_event_passes: usize,
}

fn default_goal_change_rounds() -> usize {
    8
}

fn default_event_passes() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll: PollDefaults::default(),
            max_goal_change_rounds: default_goal_change_rounds(),
            max_event_passes: default_event_passes(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, GoalError> {
        let content = std::fs::read_to_string(path).map_err(|source| GoalError::IoError {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| GoalError::ConfigError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        config.poll.interval().map_err(|e| GoalError::ConfigError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(config)
    }

    /// Try to load config, returning the default if the file is missing or
    /// unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(GoalError::IoError { .. }) => Self::default(),
            Err(e) => {
                tracing::warn!("{}; using default engine config", e);
                Self::default()
            }
        }
    }
}

/// Where a project keeps its goal engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectLayout {
    pub project_root: PathBuf,

    /// Engine configuration file.
    pub config_file: PathBuf,

    /// TreeStore directory (one JSON file per saved tree).
    pub trees_dir: PathBuf,

    /// Goal event log (JSONL).
    pub events_log: PathBuf,
}

impl ProjectLayout {
    /// Standard `.mc/` layout for a project.
    pub fn for_project(project_root: impl AsRef<Path>) -> Self {
        let root = project_root.as_ref().to_path_buf();
        let mc_dir = root.join(".mc");
        Self {
            project_root: root,
            config_file: mc_dir.join("engine.toml"),
            trees_dir: mc_dir.join("trees"),
            events_log: mc_dir.join("events.jsonl"),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::load_or_default(&self.config_file)
    }
}
