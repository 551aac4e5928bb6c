//! Identity resolution for proposed tasks
//!
//! Decides, for every node of a proposed tree or batch of operations, whether
//! its id is kept or replaced with a freshly generated UUID. The whole
//! old-to-new mapping is computed before anything is applied, so references
//! to a renamed node elsewhere in the same proposal follow the rename.

use std::collections::{HashMap, HashSet};

use tracing::debug;
use uuid::Uuid;

use crate::models::{Operation, TaskNode, TaskTree, ROOT_ID};

/// Returns true for ids in canonical hyphenated UUID form
pub fn is_valid_task_id(id: &str) -> bool {
    id.len() == 36 && Uuid::try_parse(id).is_ok()
}

/// Generates a fresh task id
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// The renames applied to a single proposal
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdMapping {
    renamed: HashMap<String, String>,
    order: Vec<String>,
    generated: usize,
}

impl IdMapping {
    /// Records that `old` was replaced by `new`.
    ///
    /// Only the first rename of an old id is kept, so references follow the
    /// first node that gave the id up.
    fn record(&mut self, old: &str, new: &str) {
        self.generated += 1;
        if !old.is_empty() && !self.renamed.contains_key(old) {
            self.renamed.insert(old.to_string(), new.to_string());
            self.order.push(old.to_string());
        }
    }

    /// Counts a generated id without recording a rename
    fn count_fresh(&mut self) {
        self.generated += 1;
    }

    /// The replacement for `old`, if it was renamed
    pub fn resolve(&self, old: &str) -> Option<&str> {
        self.renamed.get(old).map(String::as_str)
    }

    /// Renamed ids in the order they were first seen
    pub fn renames(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order
            .iter()
            .map(move |old| (old.as_str(), self.renamed[old].as_str()))
    }

    /// Number of ids generated, including ones with no prior id
    pub fn generated(&self) -> usize {
        self.generated
    }

    pub fn is_empty(&self) -> bool {
        self.generated == 0
    }
}

/// Classifies proposed ids against the ids already known to the stores
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    known: HashSet<String>,
}

impl IdentityResolver {
    pub fn new(known: impl IntoIterator<Item = String>) -> Self {
        Self {
            known: known.into_iter().collect(),
        }
    }

    /// Seeds the known ids from a persisted tree
    pub fn from_tree(tree: &TaskTree) -> Self {
        Self::new(tree.ids())
    }

    /// Adds ids known only to the relational mirror
    pub fn with_known_ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.known.extend(ids);
        self
    }

    pub fn is_known(&self, id: &str) -> bool {
        self.known.contains(id)
    }

    /// Rewrites the ids of a proposed tree.
    ///
    /// The top-level node always becomes `root`. Below it an id is kept only
    /// when it is a valid UUID not already used earlier in the proposal;
    /// everything else, including a nested `root`, gets a fresh UUID. Each
    /// node's `parent_id` is rewritten to match its position.
    pub fn resolve_tree(&self, mut proposed: TaskNode) -> (TaskTree, IdMapping) {
        let mut mapping = IdMapping::default();
        let mut seen = HashSet::new();

        proposed.set_id(ROOT_ID.to_string());
        proposed.set_parent_id(None);
        seen.insert(ROOT_ID.to_string());

        for subtask in proposed.subtasks_mut() {
            self.resolve_node(subtask, ROOT_ID, &mut seen, &mut mapping);
        }

        debug!(
            generated = mapping.generated(),
            renamed = mapping.renamed.len(),
            "resolved proposed tree ids"
        );
        (TaskTree::from_root(proposed), mapping)
    }

    fn resolve_node(
        &self,
        node: &mut TaskNode,
        parent_id: &str,
        seen: &mut HashSet<String>,
        mapping: &mut IdMapping,
    ) {
        let old = node.id().to_string();
        let duplicate = seen.contains(&old);
        let keep = old != ROOT_ID && is_valid_task_id(&old) && !duplicate;
        if !keep {
            let fresh = generate_id();
            // A copy of an id already in the tree is not a rename: the id
            // still lives on its first node.
            if duplicate {
                mapping.count_fresh();
            } else {
                mapping.record(&old, &fresh);
            }
            node.set_id(fresh);
        }
        seen.insert(node.id().to_string());
        node.set_parent_id(Some(parent_id.to_string()));

        let id = node.id().to_string();
        for subtask in node.subtasks_mut() {
            self.resolve_node(subtask, &id, seen, mapping);
        }
    }

    /// Assigns ids to the tasks added by a batch and redirects references.
    ///
    /// An add keeps its supplied id only if it is a valid UUID that names no
    /// existing task and was not claimed earlier in the batch. Placeholder ids
    /// used by adds are then substituted wherever later operations refer to
    /// them, unless the placeholder also names an existing task.
    pub fn resolve_operations(&self, operations: &mut [Operation]) -> IdMapping {
        let mut mapping = IdMapping::default();
        let mut claimed = HashSet::new();

        for operation in operations.iter_mut() {
            if let Operation::Add { id, .. } = operation {
                let supplied = id.take().unwrap_or_default();
                let keep = is_valid_task_id(&supplied)
                    && !self.is_known(&supplied)
                    && !claimed.contains(&supplied);
                let assigned = if keep {
                    supplied
                } else {
                    let fresh = generate_id();
                    mapping.record(&supplied, &fresh);
                    fresh
                };
                claimed.insert(assigned.clone());
                *id = Some(assigned);
            }
        }

        let redirect = |reference: &mut String| {
            if self.is_known(reference) {
                return;
            }
            if let Some(new) = mapping.resolve(reference) {
                *reference = new.to_string();
            }
        };

        for operation in operations.iter_mut() {
            match operation {
                Operation::Add { parent_id, .. } => redirect(parent_id),
                Operation::Update { id, .. } | Operation::Delete { id } => redirect(id),
                Operation::Query(query) => {
                    if let Some(id) = query.id.as_mut() {
                        redirect(id);
                    }
                    if let Some(parent_id) = query.parent_id.as_mut() {
                        redirect(parent_id);
                    }
                }
            }
        }

        mapping
    }
}
