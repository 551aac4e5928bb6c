//! Progress rollup
//!
//! A parent's progress is the truncating mean of its direct children's
//! progress, and its status is derived from theirs. Recomputation walks up
//! one level at a time until it reaches the root.

use crate::models::{TaskNode, TaskStatus, TaskTree};

/// Mean of the direct children's progress, `None` for a leaf
pub fn mean_progress(children: &[TaskNode]) -> Option<u8> {
    if children.is_empty() {
        return None;
    }
    let sum: usize = children.iter().map(|c| usize::from(c.progress())).sum();
    Some((sum / children.len()) as u8)
}

/// Status implied by the direct children, `None` when nothing is implied
pub fn derive_status(children: &[TaskNode]) -> Option<TaskStatus> {
    if children.is_empty() {
        return None;
    }
    let all = |status: TaskStatus| children.iter().all(|c| c.status() == status);

    if all(TaskStatus::Completed) {
        Some(TaskStatus::Completed)
    } else if children
        .iter()
        .any(|c| c.status() == TaskStatus::InProgress || c.progress() > 0)
    {
        Some(TaskStatus::InProgress)
    } else if all(TaskStatus::Pending) {
        Some(TaskStatus::Pending)
    } else if all(TaskStatus::Cancelled) {
        Some(TaskStatus::Cancelled)
    } else {
        None
    }
}

/// Recomputes one node from its direct children. Returns true if it changed.
pub fn rollup_node(node: &mut TaskNode) -> bool {
    let Some(progress) = mean_progress(node.subtasks()) else {
        return false;
    };
    let status = derive_status(node.subtasks()).unwrap_or(node.status());

    if node.progress() == progress && node.status() == status {
        return false;
    }
    node.set_progress(progress);
    node.set_status(status);
    node.touch();
    true
}

/// Recomputes `start_id` and then each of its ancestors up to the root.
///
/// Returns the ids of the nodes that changed, nearest first.
pub fn rollup_from(tree: &mut TaskTree, start_id: &str) -> Vec<String> {
    let Some(path) = tree.path_to(start_id) else {
        return Vec::new();
    };

    let mut changed = Vec::new();
    for id in path.iter().rev() {
        if let Some(node) = tree.find_mut(id) {
            if rollup_node(node) {
                changed.push(id.clone());
            }
        }
    }
    changed
}

/// Recomputes the ancestors of `id`, leaving `id` itself alone
pub fn rollup_ancestors(tree: &mut TaskTree, id: &str) -> Vec<String> {
    match tree.parent_of(id) {
        Some(parent_id) => rollup_from(tree, &parent_id),
        None => Vec::new(),
    }
}
