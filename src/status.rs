//! Task status and priority vocabularies
//!
//! The core only ever sees the canonical [`TaskStatus`]. Model output uses a
//! looser vocabulary (`todo`, `done`, `blocked`, Chinese labels, ...), which is
//! folded into the canonical set by [`TaskStatus::parse_loose`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical lifecycle state of a task
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Parses any of the status spellings seen in model output.
    ///
    /// Returns `None` for anything unrecognized; callers turn that into an
    /// `InvalidStatus` rejection.
    pub fn parse_loose(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase().replace(['-', ' '], "_");
        let status = match normalized.as_str() {
            "pending" | "todo" | "to_do" | "blocked" | "待办" | "未开始" => {
                TaskStatus::Pending
            }
            "in_progress" | "inprogress" | "doing" | "active" | "started" | "进行中" => {
                TaskStatus::InProgress
            }
            "completed" | "complete" | "done" | "finished" | "完成" | "已完成" => {
                TaskStatus::Completed
            }
            "cancelled" | "canceled" | "取消" | "已取消" => TaskStatus::Cancelled,
            _ => return None,
        };
        Some(status)
    }

    /// Terminal states can only be left when re-opening is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Pending, InProgress) | (Pending, Completed) | (InProgress, Completed) => true,
            (Pending, Cancelled) | (InProgress, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::parse_loose(s).ok_or_else(|| s.to_string())
    }
}

/// Priority of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    /// Accepts names, the `1..=4` numeric scale used by the metadata table,
    /// and the Chinese labels.
    pub fn parse_loose(raw: &str) -> Option<Self> {
        let priority = match raw.trim().to_lowercase().as_str() {
            "low" | "1" | "低" => Priority::Low,
            "medium" | "normal" | "2" | "中" => Priority::Medium,
            "high" | "3" | "高" => Priority::High,
            "critical" | "urgent" | "4" | "紧急" => Priority::Critical,
            _ => return None,
        };
        Some(priority)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::parse_loose(s).ok_or_else(|| s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loose_status_vocabulary() {
        assert_eq!(TaskStatus::parse_loose("todo"), Some(TaskStatus::Pending));
        assert_eq!(TaskStatus::parse_loose("blocked"), Some(TaskStatus::Pending));
        assert_eq!(TaskStatus::parse_loose("In Progress"), Some(TaskStatus::InProgress));
        assert_eq!(TaskStatus::parse_loose("in-progress"), Some(TaskStatus::InProgress));
        assert_eq!(TaskStatus::parse_loose("DONE"), Some(TaskStatus::Completed));
        assert_eq!(TaskStatus::parse_loose("已完成"), Some(TaskStatus::Completed));
        assert_eq!(TaskStatus::parse_loose("canceled"), Some(TaskStatus::Cancelled));
        assert_eq!(TaskStatus::parse_loose("someday"), None);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn test_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Cancelled));
        assert!(Completed.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(InProgress));
    }

    #[test]
    fn test_priority_numeric_scale() {
        assert_eq!(Priority::parse_loose("3"), Some(Priority::High));
        assert_eq!(Priority::parse_loose("Urgent"), Some(Priority::Critical));
        assert_eq!(Priority::parse_loose("whenever"), None);
    }
}
