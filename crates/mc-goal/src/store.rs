// store.rs — TreeStore: persistence for saved goal trees.
//
// Each saved tree is a JSON file: `<store_dir>/<tree_id>.json`, holding the
// node records produced by the codec plus a small header (name, save time,
// digest of the definition the tree was built from).
//
// The store supports CRUD operations; listing skips files it cannot parse.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::NodeRecord;
use crate::definition::TreeDefinition;
use crate::error::GoalError;
use crate::node;
use crate::state::NodeState;

/// A goal tree as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedTree {
    pub tree_id: Uuid,
    pub name: String,

    /// SHA-256 of the definition the tree was built from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_digest: Option<String>,

    pub saved_at: DateTime<Utc>,

    /// Root node record, children nested.
    pub root: serde_json::Value,
}

impl SavedTree {
    /// Check the saved digest against `definition`.
    ///
    /// A mismatch is not an error: the tree still loads with the structure
    /// it was saved with, but it no longer reflects the definition file.
    pub fn matches_definition(&self, definition: &TreeDefinition) -> Result<bool, GoalError> {
        let Some(saved) = &self.definition_digest else {
            return Ok(true);
        };
        let current = definition.digest()?;
        if *saved != current {
            tracing::warn!(
                tree_id = %self.tree_id,
                saved = %saved,
                current = %current,
                "saved tree was built from a different definition"
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Root state as recorded, through the soft-failure flag. Unreadable
    /// roots read as Incomplete.
    pub fn root_state(&self) -> NodeState {
        serde_json::from_value::<NodeRecord>(self.root.clone())
            .map(|record| node::effective(&record.flags, record.state))
            .unwrap_or_default()
    }
}

/// Persistent store for saved trees.
pub struct TreeStore {
    store_dir: PathBuf,
}

impl TreeStore {
    /// Create a new store backed by the given directory.
    /// Creates the directory if it doesn't exist.
    pub fn new(store_dir: impl AsRef<Path>) -> Result<Self, GoalError> {
        let store_dir = store_dir.as_ref().to_path_buf();
        fs::create_dir_all(&store_dir).map_err(|source| GoalError::IoError {
            path: store_dir.display().to_string(),
            source,
        })?;
        Ok(Self { store_dir })
    }

    pub fn dir(&self) -> &Path {
        &self.store_dir
    }

    /// Save a tree to disk (creates or overwrites).
    pub fn save(&self, tree: &SavedTree) -> Result<(), GoalError> {
        let path = self.tree_file(tree.tree_id);
        let json = serde_json::to_string_pretty(tree)?;
        fs::write(&path, json).map_err(|source| GoalError::IoError {
            path: path.display().to_string(),
            source,
        })?;
        tracing::debug!(tree_id = %tree.tree_id, path = %path.display(), "saved goal tree");
        Ok(())
    }

    /// Get a saved tree by ID.
    pub fn get(&self, tree_id: Uuid) -> Result<Option<SavedTree>, GoalError> {
        let path = self.tree_file(tree_id);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path).map_err(|source| GoalError::IoError {
            path: path.display().to_string(),
            source,
        })?;
        let tree: SavedTree = serde_json::from_str(&json)?;
        Ok(Some(tree))
    }

    /// Like [`get`](Self::get) but a missing tree is an error.
    pub fn load(&self, tree_id: Uuid) -> Result<SavedTree, GoalError> {
        self.get(tree_id)?.ok_or(GoalError::NotFound(tree_id))
    }

    pub fn exists(&self, tree_id: Uuid) -> bool {
        self.tree_file(tree_id).exists()
    }

    /// List all saved trees, most recently saved first.
    pub fn list(&self) -> Result<Vec<SavedTree>, GoalError> {
        let mut trees = Vec::new();

        let entries = fs::read_dir(&self.store_dir).map_err(|source| GoalError::IoError {
            path: self.store_dir.display().to_string(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| GoalError::IoError {
                path: self.store_dir.display().to_string(),
                source,
            })?;
            let path = entry.path();

            if path.extension().is_some_and(|ext| ext == "json") {
                let json = fs::read_to_string(&path).map_err(|source| GoalError::IoError {
                    path: path.display().to_string(),
                    source,
                })?;
                match serde_json::from_str::<SavedTree>(&json) {
                    Ok(tree) => trees.push(tree),
                    Err(e) => tracing::warn!(path = %path.display(), "skipping unreadable saved tree: {}", e),
                }
            }
        }

        trees.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(trees)
    }

    /// Delete a saved tree. Returns false if it did not exist.
    pub fn delete(&self, tree_id: Uuid) -> Result<bool, GoalError> {
        let path = self.tree_file(tree_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|source| GoalError::IoError {
            path: path.display().to_string(),
            source,
        })?;
        Ok(true)
    }

    fn tree_file(&self, tree_id: Uuid) -> PathBuf {
        self.store_dir.join(format!("{}.json", tree_id))
    }
}
