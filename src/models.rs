//! Core models for the cortexpropel library
//!
//! This module contains the task tree, the typed operations the reconciler
//! understands, and the bounded field record carried by those operations.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub use crate::status::{Priority, TaskStatus};

/// Identifier reserved for the root of every task tree
pub const ROOT_ID: &str = "root";

/// Represents a task in the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    #[serde(default, deserialize_with = "deserialize_id")]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default, deserialize_with = "deserialize_text")]
    description: String,
    #[serde(default, deserialize_with = "deserialize_status")]
    status: TaskStatus,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
    #[serde(
        default,
        deserialize_with = "deserialize_priority",
        skip_serializing_if = "Option::is_none"
    )]
    priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    due_date: Option<String>,
    #[serde(default, deserialize_with = "deserialize_progress")]
    progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_id: Option<String>,
    #[serde(default, alias = "children")]
    subtasks: Vec<TaskNode>,
}

impl TaskNode {
    /// Creates a new pending task with the given id and title
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            priority: None,
            due_date: None,
            progress: 0,
            tags: None,
            parent_id: None,
            subtasks: Vec::new(),
        }
    }

    /// Creates the root node of an empty tree
    pub fn root() -> Self {
        let mut root = Self::new(ROOT_ID, "Root Task");
        root.description = "Main project task".to_string();
        root
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn priority(&self) -> Option<Priority> {
        self.priority
    }

    pub fn due_date(&self) -> Option<&str> {
        self.due_date.as_deref()
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn tags(&self) -> Option<&[String]> {
        self.tags.as_deref()
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn subtasks(&self) -> &[TaskNode] {
        &self.subtasks
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }

    pub(crate) fn set_id(&mut self, id: String) {
        self.id = id;
    }

    pub(crate) fn set_parent_id(&mut self, parent_id: Option<String>) {
        self.parent_id = parent_id;
    }

    pub(crate) fn set_created_at(&mut self, created_at: DateTime<Utc>) {
        self.created_at = created_at;
    }

    pub(crate) fn set_updated_at(&mut self, updated_at: DateTime<Utc>) {
        self.updated_at = updated_at;
    }

    pub(crate) fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    pub(crate) fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
    }

    pub(crate) fn subtasks_mut(&mut self) -> &mut Vec<TaskNode> {
        &mut self.subtasks
    }

    /// Marks the node as modified now
    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Overwrites the descriptive fields present in `fields`.
    ///
    /// Status and progress are applied by the reconciler, which owns the
    /// transition rules.
    pub(crate) fn apply_descriptive(&mut self, fields: &TaskFields) {
        if let Some(title) = &fields.title {
            self.title = title.clone();
        }
        if let Some(description) = &fields.description {
            self.description = description.clone();
        }
        if let Some(priority) = fields.priority {
            self.priority = Some(priority);
        }
        if let Some(due_date) = &fields.due_date {
            self.due_date = Some(due_date.clone());
        }
        if let Some(tags) = &fields.tags {
            self.tags = Some(tags.clone());
        }
    }

    /// Content equality ignoring timestamps and children
    pub(crate) fn same_content(&self, other: &TaskNode) -> bool {
        self.title == other.title
            && self.description == other.description
            && self.status == other.status
            && self.priority == other.priority
            && self.due_date == other.due_date
            && self.progress == other.progress
            && self.tags == other.tags
    }

    /// Counts this node and all of its descendants
    pub fn subtree_len(&self) -> usize {
        1 + self.subtasks.iter().map(TaskNode::subtree_len).sum::<usize>()
    }

    /// Collects the ids of this node and all of its descendants, parent first
    pub fn subtree_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.subtree_len());
        fn collect(node: &TaskNode, ids: &mut Vec<String>) {
            ids.push(node.id.clone());
            for subtask in &node.subtasks {
                collect(subtask, ids);
            }
        }
        collect(self, &mut ids);
        ids
    }
}

/// The canonical task tree, always rooted at [`ROOT_ID`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskTree {
    root: TaskNode,
}

impl Default for TaskTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTree {
    /// Creates a tree holding only the root node
    pub fn new() -> Self {
        Self {
            root: TaskNode::root(),
        }
    }

    /// Wraps an already-resolved root node.
    pub(crate) fn from_root(root: TaskNode) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &TaskNode {
        &self.root
    }

    pub(crate) fn root_mut(&mut self) -> &mut TaskNode {
        &mut self.root
    }

    pub fn into_root(self) -> TaskNode {
        self.root
    }

    /// Depth-first lookup by id
    pub fn find(&self, id: &str) -> Option<&TaskNode> {
        fn search<'a>(node: &'a TaskNode, id: &str) -> Option<&'a TaskNode> {
            if node.id == id {
                return Some(node);
            }
            node.subtasks.iter().find_map(|subtask| search(subtask, id))
        }
        search(&self.root, id)
    }

    /// Depth-first lookup by id, mutably
    pub(crate) fn find_mut(&mut self, id: &str) -> Option<&mut TaskNode> {
        fn search<'a>(node: &'a mut TaskNode, id: &str) -> Option<&'a mut TaskNode> {
            if node.id == id {
                return Some(node);
            }
            node.subtasks
                .iter_mut()
                .find_map(|subtask| search(subtask, id))
        }
        search(&mut self.root, id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    /// Returns the ids from the root down to `id` (inclusive)
    pub fn path_to(&self, id: &str) -> Option<Vec<String>> {
        fn walk(node: &TaskNode, id: &str, path: &mut Vec<String>) -> bool {
            path.push(node.id.clone());
            if node.id == id {
                return true;
            }
            for subtask in &node.subtasks {
                if walk(subtask, id, path) {
                    return true;
                }
            }
            path.pop();
            false
        }

        let mut path = Vec::new();
        walk(&self.root, id, &mut path).then_some(path)
    }

    /// Returns the id of the node's parent, `None` for the root or unknown ids
    pub fn parent_of(&self, id: &str) -> Option<String> {
        let mut path = self.path_to(id)?;
        path.pop();
        path.pop()
    }

    /// Detaches the node with the given id from its parent
    pub(crate) fn detach(&mut self, id: &str) -> Option<TaskNode> {
        let parent_id = self.parent_of(id)?;
        let parent = self.find_mut(&parent_id)?;
        let position = parent.subtasks.iter().position(|t| t.id == id)?;
        Some(parent.subtasks.remove(position))
    }

    /// All ids in the tree, root included
    pub fn ids(&self) -> HashSet<String> {
        self.root.subtree_ids().into_iter().collect()
    }

    /// Number of nodes, root included
    pub fn len(&self) -> usize {
        self.root.subtree_len()
    }

    /// True when the tree holds nothing but the root
    pub fn is_empty(&self) -> bool {
        self.root.subtasks.is_empty()
    }

    /// Pre-order walk yielding each node with the id of its parent
    pub fn walk(&self) -> Vec<(&TaskNode, Option<&str>)> {
        fn visit<'a>(
            node: &'a TaskNode,
            parent: Option<&'a str>,
            out: &mut Vec<(&'a TaskNode, Option<&'a str>)>,
        ) {
            out.push((node, parent));
            for subtask in &node.subtasks {
                visit(subtask, Some(node.id.as_str()), out);
            }
        }

        let mut out = Vec::with_capacity(self.len());
        visit(&self.root, None, &mut out);
        out
    }

    /// Aggregate counts over every non-root task
    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats::default();
        let mut progress_sum = 0u64;
        for (node, _) in self.walk().into_iter().filter(|(n, _)| !n.is_root()) {
            stats.total += 1;
            *stats.by_status.entry(node.status).or_insert(0) += 1;
            progress_sum += u64::from(node.progress);
        }
        if stats.total > 0 {
            stats.average_progress = (progress_sum / stats.total as u64) as u8;
        }
        stats
    }
}

/// Summary counts for a tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeStats {
    pub total: usize,
    pub by_status: BTreeMap<TaskStatus, usize>,
    pub average_progress: u8,
}

/// Metadata that lives only in the relational mirror
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionFields {
    pub assigned_to: Option<String>,
    pub estimated_hours: Option<f64>,
    pub actual_hours: Option<f64>,
    pub dependencies: Option<Vec<String>>,
    pub category: Option<String>,
    pub notes: Option<String>,
}

impl ExtensionFields {
    pub fn is_empty(&self) -> bool {
        self == &ExtensionFields::default()
    }
}

/// The bounded set of fields an operation may set on a task
///
/// Every field is optional; absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFields {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub due_date: Option<String>,
    pub progress: Option<u8>,
    pub tags: Option<Vec<String>>,
    #[serde(flatten)]
    pub extension: ExtensionFields,
}

impl TaskFields {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Filters for a read-only lookup; every filter present must match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskQuery {
    /// Exact task id
    pub id: Option<String>,
    /// Case-insensitive substring of the title or description
    pub text: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    /// The task must carry all of these tags
    pub tags: Option<Vec<String>>,
    /// Direct parent of the task
    pub parent_id: Option<String>,
}

impl TaskQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Whether `node`, sitting under `parent_id`, passes every filter
    pub fn matches(&self, node: &TaskNode, parent_id: Option<&str>) -> bool {
        if self.id.as_deref().is_some_and(|id| node.id() != id) {
            return false;
        }
        if self.status.is_some_and(|status| node.status() != status) {
            return false;
        }
        if self.priority.is_some() && node.priority() != self.priority {
            return false;
        }
        if self.parent_id.is_some() && parent_id != self.parent_id.as_deref() {
            return false;
        }
        if let Some(text) = self.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let needle = text.to_lowercase();
            if !node.title().to_lowercase().contains(&needle)
                && !node.description().to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        if let Some(wanted) = &self.tags {
            let have = node.tags().unwrap_or_default();
            let carries = |tag: &String| have.iter().any(|t| t.eq_ignore_ascii_case(tag.trim()));
            if !wanted.iter().all(carries) {
                return false;
            }
        }
        true
    }
}

/// The kind of an operation, used in reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Add,
    Update,
    Delete,
    Query,
}

/// A validated operation against the task tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    Add {
        parent_id: String,
        /// Id supplied with the request; a placeholder until resolved
        id: Option<String>,
        fields: TaskFields,
    },
    Update {
        id: String,
        fields: TaskFields,
    },
    Delete {
        id: String,
    },
    Query(TaskQuery),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Add { .. } => OperationKind::Add,
            Operation::Update { .. } => OperationKind::Update,
            Operation::Delete { .. } => OperationKind::Delete,
            Operation::Query(_) => OperationKind::Query,
        }
    }

    pub fn add(parent_id: impl Into<String>, fields: TaskFields) -> Self {
        Operation::Add {
            parent_id: parent_id.into(),
            id: None,
            fields,
        }
    }

    pub fn update(id: impl Into<String>, fields: TaskFields) -> Self {
        Operation::Update {
            id: id.into(),
            fields,
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Operation::Delete { id: id.into() }
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => s.trim().to_string(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

fn deserialize_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn deserialize_status<'de, D>(deserializer: D) -> Result<TaskStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .as_deref()
        .and_then(TaskStatus::parse_loose)
        .unwrap_or_default())
}

fn deserialize_priority<'de, D>(deserializer: D) -> Result<Option<Priority>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Priority::parse_loose(&s),
        Some(serde_json::Value::Number(n)) => Priority::parse_loose(&n.to_string()),
        _ => None,
    })
}

/// Reads a progress value from a number or a string such as `"40%"`,
/// clamping it into `0..=100`.
pub(crate) fn progress_from_value(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        serde_json::Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    }
}

fn deserialize_progress<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(progress_from_value)
        .map(|p| p.clamp(0, 100) as u8)
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tree() -> TaskTree {
        let mut tree = TaskTree::new();
        let mut shopping = TaskNode::new("a", "Shopping");
        shopping.subtasks.push(TaskNode::new("a1", "Vegetables"));
        shopping.subtasks.push(TaskNode::new("a2", "Fruit"));
        tree.root_mut().subtasks.push(shopping);
        tree.root_mut().subtasks.push(TaskNode::new("b", "Cooking"));
        tree
    }

    #[test]
    fn test_find_and_path() {
        let tree = sample_tree();
        assert_eq!(tree.find("a2").map(|t| t.title()), Some("Fruit"));
        assert!(tree.find("zzz").is_none());
        assert_eq!(
            tree.path_to("a2"),
            Some(vec!["root".to_string(), "a".to_string(), "a2".to_string()])
        );
        assert_eq!(tree.parent_of("a2").as_deref(), Some("a"));
        assert_eq!(tree.parent_of("b").as_deref(), Some("root"));
        assert_eq!(tree.parent_of("root"), None);
    }

    #[test]
    fn test_detach_removes_subtree() {
        let mut tree = sample_tree();
        let removed = tree.detach("a").unwrap();
        assert_eq!(removed.subtree_len(), 3);
        assert_eq!(tree.len(), 2);
        assert!(!tree.contains("a1"));
    }

    #[test]
    fn test_walk_reports_parents() {
        let tree = sample_tree();
        let walked: Vec<(String, Option<String>)> = tree
            .walk()
            .into_iter()
            .map(|(n, p)| (n.id().to_string(), p.map(str::to_string)))
            .collect();
        assert_eq!(walked[0], ("root".to_string(), None));
        assert_eq!(walked[2], ("a1".to_string(), Some("a".to_string())));
        assert_eq!(walked.len(), 5);
    }

    #[test]
    fn test_lenient_deserialization() {
        let node: TaskNode = serde_json::from_value(json!({
            "id": 7,
            "title": "Weigh in",
            "description": null,
            "status": "done",
            "progress": "150%",
            "priority": 3,
            "children": [{"title": "nested"}]
        }))
        .unwrap();

        assert_eq!(node.id(), "7");
        assert_eq!(node.description(), "");
        assert_eq!(node.status(), TaskStatus::Completed);
        assert_eq!(node.progress(), 100);
        assert_eq!(node.priority(), Some(Priority::High));
        assert_eq!(node.subtasks().len(), 1);
        assert_eq!(node.subtasks()[0].id(), "");
    }

    #[test]
    fn test_tree_round_trip() {
        let tree = sample_tree();
        let text = serde_json::to_string_pretty(&tree).unwrap();
        assert!(text.contains("\"subtasks\""));
        let back: TaskTree = serde_json::from_str(&text).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn test_stats() {
        let mut tree = sample_tree();
        let b = tree.find_mut("b").unwrap();
        b.set_status(TaskStatus::Completed);
        b.set_progress(100);
        let stats = tree.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_status.get(&TaskStatus::Completed), Some(&1));
        assert_eq!(stats.by_status.get(&TaskStatus::Pending), Some(&3));
        assert_eq!(stats.average_progress, 25);
    }
}
