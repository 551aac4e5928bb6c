//! SQLite projection of the task tree, one row per non-root task.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};

use super::StoreError;
use crate::models::{ExtensionFields, Priority, TaskNode, TaskStatus, TaskTree};

const COLUMNS: &str = "id, parent_id, title, description, status, priority, due_date, progress, \
     tags, assigned_to, estimated_hours, actual_hours, dependencies, category, notes, \
     created_at, updated_at, json_data";

/// A row of the `task_metadata` table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Option<Priority>,
    pub due_date: Option<String>,
    pub progress: u8,
    pub tags: Vec<String>,
    pub assigned_to: Option<String>,
    pub estimated_hours: Option<f64>,
    pub actual_hours: Option<f64>,
    pub dependencies: Vec<String>,
    pub category: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub json_data: Option<String>,
}

impl TaskRecord {
    fn blank(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            parent_id: None,
            title: String::new(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: None,
            due_date: None,
            progress: 0,
            tags: Vec::new(),
            assigned_to: None,
            estimated_hours: None,
            actual_hours: None,
            dependencies: Vec::new(),
            category: None,
            notes: None,
            created_at: now,
            updated_at: now,
            json_data: None,
        }
    }

    /// Overwrites every field present in `patch`; absent fields survive
    fn merge(&mut self, patch: &RecordPatch) {
        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }
        fn set_opt<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *slot = value.clone();
            }
        }

        set_opt(&mut self.parent_id, &patch.parent_id);
        set(&mut self.title, &patch.title);
        set(&mut self.description, &patch.description);
        set(&mut self.status, &patch.status);
        set_opt(&mut self.priority, &patch.priority);
        set_opt(&mut self.due_date, &patch.due_date);
        set(&mut self.progress, &patch.progress);
        set(&mut self.tags, &patch.tags);
        set_opt(&mut self.assigned_to, &patch.extension.assigned_to);
        set_opt(&mut self.estimated_hours, &patch.extension.estimated_hours);
        set_opt(&mut self.actual_hours, &patch.extension.actual_hours);
        set(&mut self.dependencies, &patch.extension.dependencies);
        set_opt(&mut self.category, &patch.extension.category);
        set_opt(&mut self.notes, &patch.extension.notes);
        set(&mut self.created_at, &patch.created_at);
        set_opt(&mut self.json_data, &patch.json_data);
    }
}

/// Fields to write into a row; `None` leaves the stored value alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub due_date: Option<String>,
    pub progress: Option<u8>,
    pub tags: Option<Vec<String>>,
    pub extension: ExtensionFields,
    pub created_at: Option<DateTime<Utc>>,
    pub json_data: Option<String>,
}

impl RecordPatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Projects a tree node; the tree owns these columns
    pub fn from_node(node: &TaskNode, parent_id: Option<&str>) -> Self {
        let snapshot = serde_json::to_value(node).ok().map(|mut value| {
            if let Some(object) = value.as_object_mut() {
                object.remove("subtasks");
            }
            value.to_string()
        });

        Self {
            id: node.id().to_string(),
            parent_id: parent_id.map(str::to_string),
            title: Some(node.title().to_string()),
            description: Some(node.description().to_string()),
            status: Some(node.status()),
            priority: node.priority(),
            due_date: node.due_date().map(str::to_string),
            progress: Some(node.progress()),
            tags: node.tags().map(<[String]>::to_vec),
            extension: ExtensionFields::default(),
            created_at: Some(node.created_at()),
            json_data: snapshot,
        }
    }

    pub fn with_extension(mut self, extension: ExtensionFields) -> Self {
        self.extension = extension;
        self
    }
}

/// Counts from a full sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub upserted: usize,
    pub removed: usize,
}

/// The relational mirror
#[derive(Debug)]
pub struct Mirror {
    conn: Connection,
}

impl Mirror {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mirror = Self {
            conn: Connection::open(path)?,
        };
        mirror.migrate()?;
        Ok(mirror)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let mirror = Self {
            conn: Connection::open_in_memory()?,
        };
        mirror.migrate()?;
        Ok(mirror)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS task_metadata (
              id TEXT PRIMARY KEY,
              parent_id TEXT,
              title TEXT NOT NULL,
              description TEXT,
              status TEXT NOT NULL DEFAULT 'pending',
              priority TEXT,
              due_date TEXT,
              progress INTEGER NOT NULL DEFAULT 0,
              tags TEXT NOT NULL DEFAULT '[]',
              assigned_to TEXT,
              estimated_hours REAL,
              actual_hours REAL,
              dependencies TEXT NOT NULL DEFAULT '[]',
              category TEXT,
              notes TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              json_data TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_task_metadata_parent ON task_metadata(parent_id);
            "#,
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<TaskRecord>, StoreError> {
        get_in(&self.conn, id)
    }

    /// Every row, oldest first
    pub fn all(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM task_metadata ORDER BY created_at, id"
        ))?;
        let raw = stmt
            .query_map([], RawRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawRecord::into_record).collect()
    }

    pub fn ids(&self) -> Result<HashSet<String>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT id FROM task_metadata")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM task_metadata", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Merges `patch` into the row for its id, creating the row if needed.
    pub fn upsert(&mut self, patch: &RecordPatch) -> Result<TaskRecord, StoreError> {
        let tx = self.conn.transaction()?;
        let record = upsert_in(&tx, patch)?;
        tx.commit()?;
        Ok(record)
    }

    pub fn delete(&mut self, id: &str) -> Result<bool, StoreError> {
        let n = self
            .conn
            .execute("DELETE FROM task_metadata WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn delete_many(&mut self, ids: &[String]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let mut removed = 0;
        for id in ids {
            removed += tx.execute("DELETE FROM task_metadata WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Carries the row for `old` forward under `new`.
    ///
    /// When a row for `new` already exists the stale row is simply dropped.
    pub fn migrate_id(&mut self, old: &str, new: &str) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        let exists_old = get_in(&tx, old)?.is_some();
        if !exists_old {
            return Ok(false);
        }
        if get_in(&tx, new)?.is_some() {
            tx.execute("DELETE FROM task_metadata WHERE id = ?1", params![old])?;
        } else {
            tx.execute(
                "UPDATE task_metadata SET id = ?2, updated_at = ?3 WHERE id = ?1",
                params![old, new, Utc::now().to_rfc3339()],
            )?;
        }
        tx.execute(
            "UPDATE task_metadata SET parent_id = ?2 WHERE parent_id = ?1",
            params![old, new],
        )?;
        tx.commit()?;
        debug!(old, new, "migrated mirror row");
        Ok(true)
    }

    /// Upserts only the listed nodes of `tree`
    pub fn sync_nodes<'a>(
        &mut self,
        tree: &TaskTree,
        ids: impl IntoIterator<Item = &'a String>,
        extensions: &HashMap<String, ExtensionFields>,
    ) -> Result<usize, StoreError> {
        let wanted: HashSet<&String> = ids.into_iter().collect();
        let tx = self.conn.transaction()?;
        let mut upserted = 0;
        for (node, parent) in tree.walk() {
            if node.is_root() || !wanted.contains(&node.id().to_string()) {
                continue;
            }
            upsert_in(&tx, &patch_for(node, parent, extensions))?;
            upserted += 1;
        }
        tx.commit()?;
        Ok(upserted)
    }

    /// Upserts every non-root node and removes rows for vanished tasks
    pub fn sync_tree(
        &mut self,
        tree: &TaskTree,
        extensions: &HashMap<String, ExtensionFields>,
    ) -> Result<SyncReport, StoreError> {
        let present = tree.ids();
        let stale: Vec<String> = self
            .ids()?
            .into_iter()
            .filter(|id| !present.contains(id))
            .collect();

        let tx = self.conn.transaction()?;
        let mut report = SyncReport::default();
        for (node, parent) in tree.walk() {
            if node.is_root() {
                continue;
            }
            upsert_in(&tx, &patch_for(node, parent, extensions))?;
            report.upserted += 1;
        }
        for id in &stale {
            report.removed += tx.execute("DELETE FROM task_metadata WHERE id = ?1", params![id])?;
        }
        tx.commit()?;

        info!(
            upserted = report.upserted,
            removed = report.removed,
            "synced mirror with tree"
        );
        Ok(report)
    }

    /// Removes every row
    pub fn clear(&self) -> Result<usize, StoreError> {
        Ok(self.conn.execute("DELETE FROM task_metadata", [])?)
    }
}

fn patch_for(
    node: &TaskNode,
    parent: Option<&str>,
    extensions: &HashMap<String, ExtensionFields>,
) -> RecordPatch {
    let patch = RecordPatch::from_node(node, parent);
    match extensions.get(node.id()) {
        Some(extension) => patch.with_extension(extension.clone()),
        None => patch,
    }
}

fn get_in(conn: &Connection, id: &str) -> Result<Option<TaskRecord>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM task_metadata WHERE id = ?1"),
            params![id],
            RawRecord::from_row,
        )
        .optional()?;
    raw.map(RawRecord::into_record).transpose()
}

fn upsert_in(conn: &Connection, patch: &RecordPatch) -> Result<TaskRecord, StoreError> {
    let now = Utc::now();
    let mut record = get_in(conn, &patch.id)?.unwrap_or_else(|| TaskRecord::blank(&patch.id, now));
    record.merge(patch);
    record.updated_at = now;

    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO task_metadata ({COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
        ),
        params![
            record.id,
            record.parent_id,
            record.title,
            record.description,
            record.status.as_str(),
            record.priority.map(|p| p.as_str()),
            record.due_date,
            i64::from(record.progress),
            serde_json::to_string(&record.tags)?,
            record.assigned_to,
            record.estimated_hours,
            record.actual_hours,
            serde_json::to_string(&record.dependencies)?,
            record.category,
            record.notes,
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
            record.json_data,
        ],
    )?;
    Ok(record)
}

/// Column values as stored, before parsing
struct RawRecord {
    id: String,
    parent_id: Option<String>,
    title: String,
    description: Option<String>,
    status: String,
    priority: Option<String>,
    due_date: Option<String>,
    progress: i64,
    tags: String,
    assigned_to: Option<String>,
    estimated_hours: Option<f64>,
    actual_hours: Option<f64>,
    dependencies: String,
    category: Option<String>,
    notes: Option<String>,
    created_at: String,
    updated_at: String,
    json_data: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            status: row.get(4)?,
            priority: row.get(5)?,
            due_date: row.get(6)?,
            progress: row.get(7)?,
            tags: row.get(8)?,
            assigned_to: row.get(9)?,
            estimated_hours: row.get(10)?,
            actual_hours: row.get(11)?,
            dependencies: row.get(12)?,
            category: row.get(13)?,
            notes: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
            json_data: row.get(17)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord, StoreError> {
        let corrupt = |reason: String| StoreError::CorruptRecord {
            id: self.id.clone(),
            reason,
        };
        let timestamp = |raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("bad timestamp '{raw}': {e}")))
        };

        let status = TaskStatus::parse_loose(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", self.status)))?;
        let created_at = timestamp(&self.created_at)?;
        let updated_at = timestamp(&self.updated_at)?;

        Ok(TaskRecord {
            status,
            priority: self.priority.as_deref().and_then(Priority::parse_loose),
            progress: self.progress.clamp(0, 100) as u8,
            tags: serde_json::from_str(&self.tags).unwrap_or_default(),
            dependencies: serde_json::from_str(&self.dependencies).unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            created_at,
            updated_at,
            id: self.id,
            parent_id: self.parent_id,
            title: self.title,
            due_date: self.due_date,
            assigned_to: self.assigned_to,
            estimated_hours: self.estimated_hours,
            actual_hours: self.actual_hours,
            category: self.category,
            notes: self.notes,
            json_data: self.json_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_upsert_merges_and_preserves_extension() {
        let mut mirror = Mirror::in_memory().unwrap();
        let mut patch = RecordPatch::new("t1");
        patch.title = Some("Write report".to_string());
        patch.extension.estimated_hours = Some(5.0);
        mirror.upsert(&patch).unwrap();

        let mut later = RecordPatch::new("t1");
        later.title = Some("Write final report".to_string());
        later.status = Some(TaskStatus::InProgress);
        let record = mirror.upsert(&later).unwrap();

        assert_eq!(record.title, "Write final report");
        assert_eq!(record.status, TaskStatus::InProgress);
        assert_eq!(record.estimated_hours, Some(5.0));
        assert_eq!(mirror.get("t1").unwrap(), Some(record));
    }

    #[test]
    fn test_new_row_defaults() {
        let mut mirror = Mirror::in_memory().unwrap();
        mirror.upsert(&RecordPatch::new("t1")).unwrap();
        let record = mirror.get("t1").unwrap().unwrap();
        assert_eq!(record.tags, Vec::<String>::new());
        assert_eq!(record.dependencies, Vec::<String>::new());
        assert_eq!(record.estimated_hours, None);
        assert_eq!(record.status, TaskStatus::Pending);
    }

    #[test]
    fn test_migrate_id_moves_row_and_children() {
        let mut mirror = Mirror::in_memory().unwrap();
        let mut patch = RecordPatch::new("task-1");
        patch.extension.notes = Some("keep me".to_string());
        mirror.upsert(&patch).unwrap();
        let mut child = RecordPatch::new("task-2");
        child.parent_id = Some("task-1".to_string());
        mirror.upsert(&child).unwrap();

        assert!(mirror.migrate_id("task-1", "new-id").unwrap());
        assert!(mirror.get("task-1").unwrap().is_none());
        assert_eq!(
            mirror.get("new-id").unwrap().unwrap().notes.as_deref(),
            Some("keep me")
        );
        assert_eq!(
            mirror.get("task-2").unwrap().unwrap().parent_id.as_deref(),
            Some("new-id")
        );
        assert!(!mirror.migrate_id("missing", "other").unwrap());
        assert_eq!(mirror.count().unwrap(), 2);
    }

    #[test]
    fn test_sync_tree_prunes_vanished_rows() {
        let mut mirror = Mirror::in_memory().unwrap();
        mirror.upsert(&RecordPatch::new("gone")).unwrap();

        let tree: TaskTree = serde_json::from_value(serde_json::json!({
            "id": "root",
            "subtasks": [{"id": "a", "title": "A", "subtasks": [{"id": "b", "title": "B"}]}]
        }))
        .unwrap();
        let report = mirror.sync_tree(&tree, &HashMap::new()).unwrap();

        assert_eq!(report, SyncReport { upserted: 2, removed: 1 });
        assert_eq!(mirror.ids().unwrap(), HashSet::from(["a".to_string(), "b".to_string()]));
        assert_eq!(mirror.get("b").unwrap().unwrap().parent_id.as_deref(), Some("a"));
    }
}
