//! Tree reconciliation
//!
//! Applies typed operations to the canonical tree, or adopts a full
//! replacement tree, while keeping the containment invariants: the root is
//! never removed, ids are stable, and every node has exactly one parent.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::{info, warn};

use crate::identity::{generate_id, IdMapping, IdentityResolver};
use crate::models::{
    ExtensionFields, Operation, OperationKind, TaskFields, TaskNode, TaskQuery, TaskStatus,
    TaskTree, ROOT_ID,
};
use crate::rollup::{rollup_ancestors, rollup_from, rollup_node};

/// Structural validation failures
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[serde(tag = "error", content = "detail", rename_all = "snake_case")]
pub enum ReconcileError {
    #[error("parent task {0} not found")]
    ParentNotFound(String),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("the root task cannot be deleted")]
    CannotDeleteRoot,

    #[error("invalid status '{0}'")]
    InvalidStatus(String),

    #[error("progress {0} is outside 0-100")]
    InvalidProgress(i64),

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("malformed operation: {0}")]
    MalformedOperation(String),
}

/// Which reconciliation strategy produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    OperationList,
    FullReplacement,
}

/// Knobs for the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Recompute ancestors after status or progress changes
    pub auto_rollup: bool,
    /// Allow completed or cancelled tasks to be moved back to an open state
    pub allow_reopen: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            auto_rollup: true,
            allow_reopen: false,
        }
    }
}

/// An operation that was rejected while parsing, before it reached the tree
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedOperation {
    pub kind: Option<OperationKind>,
    pub error: ReconcileError,
}

pub type ParsedOperation = Result<Operation, RejectedOperation>;

/// A compact view of a task used in reports
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub progress: u8,
}

impl From<&TaskNode> for TaskSummary {
    fn from(node: &TaskNode) -> Self {
        Self {
            id: node.id().to_string(),
            title: node.title().to_string(),
            status: node.status(),
            progress: node.progress(),
        }
    }
}

/// What a successful operation did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum OperationEffect {
    Added { id: String },
    Updated { id: String },
    Deleted { id: String, count: usize },
    Queried { matches: Vec<TaskSummary> },
}

/// The result of one operation in a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationOutcome {
    pub index: usize,
    pub kind: Option<OperationKind>,
    pub result: Result<OperationEffect, ReconcileError>,
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Ids whose mirror rows must be written or removed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub touched: BTreeSet<String>,
    pub removed: Vec<String>,
    pub extensions: HashMap<String, ExtensionFields>,
}

impl ChangeSet {
    fn touch(&mut self, ids: impl IntoIterator<Item = String>) {
        self.touched.extend(ids);
    }

    fn remove(&mut self, ids: Vec<String>) {
        for id in &ids {
            self.touched.remove(id);
            self.extensions.remove(id);
        }
        self.removed.extend(ids);
    }

    fn extend_extension(&mut self, id: &str, extension: &ExtensionFields) {
        if extension.is_empty() {
            return;
        }
        let entry = self.extensions.entry(id.to_string()).or_default();
        merge_extension(entry, extension);
    }

    pub fn is_empty(&self) -> bool {
        self.touched.is_empty() && self.removed.is_empty()
    }
}

fn merge_extension(into: &mut ExtensionFields, from: &ExtensionFields) {
    if from.assigned_to.is_some() {
        into.assigned_to = from.assigned_to.clone();
    }
    if from.estimated_hours.is_some() {
        into.estimated_hours = from.estimated_hours;
    }
    if from.actual_hours.is_some() {
        into.actual_hours = from.actual_hours;
    }
    if from.dependencies.is_some() {
        into.dependencies = from.dependencies.clone();
    }
    if from.category.is_some() {
        into.category = from.category.clone();
    }
    if from.notes.is_some() {
        into.notes = from.notes.clone();
    }
}

/// Per-operation report for a batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub outcomes: Vec<OperationOutcome>,
    pub mapping: IdMapping,
    pub changes: ChangeSet,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Ids created by successful adds, in batch order
    pub fn added_ids(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.result {
                Ok(OperationEffect::Added { id }) => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Status implied by setting `progress`
fn status_for_progress(current: TaskStatus, progress: u8) -> TaskStatus {
    match (current, progress) {
        (_, 100) => TaskStatus::Completed,
        (TaskStatus::Pending, 1..=99) => TaskStatus::InProgress,
        (TaskStatus::Completed, _) => TaskStatus::InProgress,
        (status, _) => status,
    }
}

/// Progress implied by moving to `status`
fn progress_for_status(status: TaskStatus, current: u8) -> u8 {
    match status {
        TaskStatus::Completed => 100,
        TaskStatus::Pending => 0,
        TaskStatus::InProgress if current == 0 || current == 100 => 10,
        _ => current,
    }
}

/// Applies operations and replacement trees to a [`TaskTree`]
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler {
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(options: ReconcileOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> ReconcileOptions {
        self.options
    }

    /// Target status and progress for applying `fields` to `node`
    fn next_state(
        &self,
        node: &TaskNode,
        fields: &TaskFields,
    ) -> Result<(TaskStatus, u8), ReconcileError> {
        let mut status = node.status();
        let mut progress = node.progress();

        if let Some(next) = fields.status {
            status = next;
            progress = progress_for_status(next, progress);
        }
        if let Some(next) = fields.progress {
            if next > 100 {
                return Err(ReconcileError::InvalidProgress(i64::from(next)));
            }
            progress = next;
            status = status_for_progress(status, next);
        }

        if !self.options.allow_reopen && !node.status().can_transition_to(status) {
            return Err(ReconcileError::InvalidTransition {
                id: node.id().to_string(),
                from: node.status(),
                to: status,
            });
        }
        Ok((status, progress))
    }

    /// Adds a new task under `parent_id` and returns its id.
    ///
    /// `id` must already have been resolved; when absent a fresh one is
    /// generated.
    pub fn add(
        &self,
        tree: &mut TaskTree,
        parent_id: &str,
        id: Option<String>,
        fields: &TaskFields,
        changes: &mut ChangeSet,
    ) -> Result<String, ReconcileError> {
        let title = fields
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ReconcileError::MalformedOperation("add requires a title".into()))?;

        if !tree.contains(parent_id) {
            return Err(ReconcileError::ParentNotFound(parent_id.to_string()));
        }

        let id = id.unwrap_or_else(generate_id);
        let mut node = TaskNode::new(id.clone(), title);
        let (status, progress) = self.next_state(&node, fields)?;
        node.apply_descriptive(&TaskFields {
            title: Some(title.to_string()),
            ..fields.clone()
        });
        node.set_status(status);
        node.set_progress(progress);
        node.set_parent_id(Some(parent_id.to_string()));

        let parent = tree
            .find_mut(parent_id)
            .ok_or_else(|| ReconcileError::ParentNotFound(parent_id.to_string()))?;
        parent.subtasks_mut().push(node);

        changes.touch([id.clone()]);
        changes.extend_extension(&id, &fields.extension);
        if self.options.auto_rollup {
            changes.touch(rollup_from(tree, parent_id));
        }

        info!(task_id = %id, parent_id, "added task");
        Ok(id)
    }

    /// Overwrites the fields present in `fields` on task `id`
    pub fn update(
        &self,
        tree: &mut TaskTree,
        id: &str,
        fields: &TaskFields,
        changes: &mut ChangeSet,
    ) -> Result<(), ReconcileError> {
        let node = tree
            .find_mut(id)
            .ok_or_else(|| ReconcileError::TaskNotFound(id.to_string()))?;

        let (status, progress) = self.next_state(node, fields)?;
        let state_changed = status != node.status() || progress != node.progress();

        node.apply_descriptive(fields);
        node.set_status(status);
        node.set_progress(progress);
        node.touch();

        changes.touch([id.to_string()]);
        changes.extend_extension(id, &fields.extension);
        if self.options.auto_rollup && state_changed {
            changes.touch(rollup_ancestors(tree, id));
        }

        info!(task_id = id, status = %status, progress, "updated task");
        Ok(())
    }

    /// Removes task `id` and all its descendants, returning how many went
    pub fn delete(
        &self,
        tree: &mut TaskTree,
        id: &str,
        changes: &mut ChangeSet,
    ) -> Result<usize, ReconcileError> {
        if id == ROOT_ID {
            return Err(ReconcileError::CannotDeleteRoot);
        }
        let parent_id = tree
            .parent_of(id)
            .ok_or_else(|| ReconcileError::TaskNotFound(id.to_string()))?;
        let removed = tree
            .detach(id)
            .ok_or_else(|| ReconcileError::TaskNotFound(id.to_string()))?;

        let ids = removed.subtree_ids();
        let count = ids.len();
        changes.remove(ids);
        if self.options.auto_rollup {
            changes.touch(rollup_from(tree, &parent_id));
        }

        info!(task_id = id, count, "deleted task");
        Ok(count)
    }

    /// Finds the non-root tasks passing every filter of `query`
    pub fn query(&self, tree: &TaskTree, query: &TaskQuery) -> Vec<TaskSummary> {
        tree.walk()
            .into_iter()
            .filter(|(node, parent)| !node.is_root() && query.matches(node, *parent))
            .map(|(node, _)| TaskSummary::from(node))
            .collect()
    }

    /// Applies a batch best-effort: every operation is attempted and its
    /// result recorded, failures never abort the rest of the batch.
    pub fn apply_operations(
        &self,
        tree: &mut TaskTree,
        parsed: Vec<ParsedOperation>,
        resolver: &IdentityResolver,
    ) -> BatchReport {
        let mut report = BatchReport::default();

        let mut valid: Vec<Operation> = parsed
            .iter()
            .filter_map(|p| p.as_ref().ok().cloned())
            .collect();
        report.mapping = resolver.resolve_operations(&mut valid);
        let mut valid = valid.into_iter();

        for (index, entry) in parsed.into_iter().enumerate() {
            let outcome = match entry {
                Err(rejected) => OperationOutcome {
                    index,
                    kind: rejected.kind,
                    result: Err(rejected.error),
                },
                Ok(_) => {
                    let Some(operation) = valid.next() else {
                        break;
                    };
                    let kind = operation.kind();
                    OperationOutcome {
                        index,
                        kind: Some(kind),
                        result: self.apply_one(tree, operation, &mut report.changes),
                    }
                }
            };

            if let Err(error) = &outcome.result {
                warn!(index, kind = ?outcome.kind, %error, "operation rejected");
            }
            report.outcomes.push(outcome);
        }

        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "applied operation batch"
        );
        report
    }

    fn apply_one(
        &self,
        tree: &mut TaskTree,
        operation: Operation,
        changes: &mut ChangeSet,
    ) -> Result<OperationEffect, ReconcileError> {
        match operation {
            Operation::Add {
                parent_id,
                id,
                fields,
            } => self
                .add(tree, &parent_id, id, &fields, changes)
                .map(|id| OperationEffect::Added { id }),
            Operation::Update { id, fields } => self
                .update(tree, &id, &fields, changes)
                .map(|()| OperationEffect::Updated { id }),
            Operation::Delete { id } => self
                .delete(tree, &id, changes)
                .map(|count| OperationEffect::Deleted { id, count }),
            Operation::Query(query) => Ok(OperationEffect::Queried {
                matches: self.query(tree, &query),
            }),
        }
    }

    /// Adopts `proposed` wholesale after resolving its ids.
    ///
    /// Nodes that survive from `prior` keep their creation time, and their
    /// modification time unless their content changed. No structural diff is
    /// performed: a proposal that drops a subtree drops it.
    pub fn replace_tree(
        &self,
        prior: &TaskTree,
        proposed: TaskNode,
        resolver: &IdentityResolver,
    ) -> (TaskTree, IdMapping) {
        let (mut tree, mapping) = resolver.resolve_tree(proposed);

        fn restore(node: &mut TaskNode, prior: &TaskTree) {
            match prior.find(node.id()) {
                Some(before) => {
                    node.set_created_at(before.created_at());
                    if node.same_content(before) {
                        node.set_updated_at(before.updated_at());
                    } else {
                        node.touch();
                    }
                }
                None => {
                    let now = chrono::Utc::now();
                    node.set_created_at(now);
                    node.set_updated_at(now);
                }
            }
            for subtask in node.subtasks_mut() {
                restore(subtask, prior);
            }
        }

        fn normalize(node: &mut TaskNode, auto_rollup: bool) {
            for subtask in node.subtasks_mut() {
                normalize(subtask, auto_rollup);
            }
            if node.status() == TaskStatus::Completed {
                node.set_progress(100);
            } else if node.progress() == 100 {
                node.set_status(TaskStatus::Completed);
            }
            if auto_rollup {
                rollup_node(node);
            }
        }

        if tree.root().title().is_empty() {
            let fields = TaskFields::titled(prior.root().title())
                .with_description(prior.root().description());
            tree.root_mut().apply_descriptive(&fields);
        }
        restore(tree.root_mut(), prior);
        normalize(tree.root_mut(), self.options.auto_rollup);

        info!(
            tasks = tree.len() - 1,
            generated = mapping.generated(),
            "adopted replacement tree"
        );
        (tree, mapping)
    }
}
