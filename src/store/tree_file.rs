use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use super::{FileLock, StoreError, DEFAULT_LOCK_TIMEOUT};
use crate::models::{TaskNode, TaskTree, ROOT_ID};

/// A tree read from disk
#[derive(Debug, Clone)]
pub struct Loaded {
    pub tree: TaskTree,
    /// The file was corrupt and has been replaced by a root-only tree
    pub healed: bool,
}

impl Loaded {
    fn intact(tree: TaskTree) -> Self {
        Self {
            tree,
            healed: false,
        }
    }
}

/// The authoritative JSON document holding the task tree
#[derive(Debug, Clone)]
pub struct TreeStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl TreeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Takes the advisory lock guarding a read-modify-write cycle
    pub fn lock(&self) -> Result<FileLock, StoreError> {
        FileLock::acquire(self.lock_path(), self.lock_timeout)
    }

    /// Loads the tree, creating a root-only tree when the file is missing.
    ///
    /// A file that is not valid JSON is moved aside and replaced by a fresh
    /// tree; use [`TreeStore::load_checked`] to learn when that happened.
    pub fn load(&self) -> Result<TaskTree, StoreError> {
        Ok(self.load_checked()?.tree)
    }

    /// Like [`TreeStore::load`], but reports whether the file was healed
    pub fn load_checked(&self) -> Result<Loaded, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "tree file missing, creating");
                let tree = TaskTree::new();
                self.save(&tree)?;
                return Ok(Loaded::intact(tree));
            }
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_str::<TaskNode>(&text) {
            Ok(mut root) => {
                if root.id() != ROOT_ID {
                    warn!(found = root.id(), "tree root had a foreign id, renaming to root");
                    root.set_id(ROOT_ID.to_string());
                }
                root.set_parent_id(None);
                Ok(Loaded::intact(TaskTree::from_root(root)))
            }
            Err(err) => {
                let backup = self.path.with_extension("corrupt.json");
                warn!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    error = %err,
                    "tree file is corrupt, resetting"
                );
                fs::rename(&self.path, &backup)?;
                Ok(Loaded {
                    tree: self.reset()?,
                    healed: true,
                })
            }
        }
    }

    /// Writes the tree atomically: temp file in the same directory, then rename
    pub fn save(&self, tree: &TaskTree) -> Result<(), StoreError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let json = serde_json::to_string_pretty(tree)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        debug!(path = %self.path.display(), tasks = tree.len() - 1, "saved tree");
        Ok(())
    }

    /// Overwrites the file with a root-only tree
    pub fn reset(&self) -> Result<TaskTree, StoreError> {
        let tree = TaskTree::new();
        self.save(&tree)?;
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_missing_file_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = TreeStore::new(dir.path().join("tasks.json"));
        let tree = store.load().unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.root().title(), "Root Task");
        assert!(store.path().exists());
    }

    #[test]
    fn test_corrupt_file_heals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, "{ not json").unwrap();

        let store = TreeStore::new(&path);
        let loaded = store.load_checked().unwrap();
        assert!(loaded.healed);
        assert!(loaded.tree.is_empty());
        assert!(dir.path().join("tasks.corrupt.json").exists());

        let again = store.load_checked().unwrap();
        assert!(!again.healed);
        assert_eq!(again.tree.root().status(), TaskStatus::Pending);
    }

    #[test]
    fn test_foreign_root_id_is_renamed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, r#"{"id": "project", "title": "P", "subtasks": []}"#).unwrap();
        let tree = TreeStore::new(&path).load().unwrap();
        assert_eq!(tree.root().id(), ROOT_ID);
        assert_eq!(tree.root().title(), "P");
    }
}
