//! Parsing of untrusted model replies
//!
//! The reply is free text that should contain one JSON object, either an
//! operation list or a complete replacement tree. Nothing here fails: a reply
//! that cannot be used becomes an empty operation list with a diagnostic, and
//! a single bad operation becomes a rejected entry.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::models::{
    progress_from_value, ExtensionFields, Operation, OperationKind, Priority, TaskFields,
    TaskNode, TaskQuery, TaskStatus, ROOT_ID,
};
use crate::reconcile::{ParsedOperation, ReconcileError, RejectedOperation};

/// What the reply asked for
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Operations(Vec<ParsedOperation>),
    Tree(TaskNode),
}

impl Payload {
    fn empty() -> Self {
        Payload::Operations(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub payload: Payload,
    /// Human-facing reply from the model, if any
    pub message: Option<String>,
    /// Why the reply could not be fully used
    pub diagnostic: Option<String>,
}

impl ParsedResponse {
    fn unusable(diagnostic: impl Into<String>) -> Self {
        let diagnostic = diagnostic.into();
        warn!(%diagnostic, "model reply was not usable");
        Self {
            payload: Payload::empty(),
            message: None,
            diagnostic: Some(diagnostic),
        }
    }
}

/// The text between the first `{` and the last `}`
pub fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

pub fn parse_response(raw: &str) -> ParsedResponse {
    let Some(json) = extract_json(raw) else {
        return ParsedResponse::unusable("no JSON object found in model reply");
    };
    let value: Value = match serde_json::from_str(json) {
        Ok(value) => value,
        Err(err) => return ParsedResponse::unusable(format!("model reply is not valid JSON: {err}")),
    };
    let Value::Object(object) = value else {
        return ParsedResponse::unusable("model reply is not a JSON object");
    };

    let message = object
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(operations) = object.get("operations") {
        let Some(items) = operations.as_array() else {
            let mut response = ParsedResponse::unusable("\"operations\" is not a list");
            response.message = message;
            return response;
        };
        let parsed: Vec<ParsedOperation> = items.iter().map(parse_operation).collect();
        debug!(count = parsed.len(), "parsed operation list");
        return ParsedResponse {
            payload: Payload::Operations(parsed),
            message,
            diagnostic: None,
        };
    }

    if looks_like_tree(&object) {
        return match serde_json::from_value::<TaskNode>(Value::Object(object)) {
            Ok(root) => ParsedResponse {
                payload: Payload::Tree(root),
                message,
                diagnostic: None,
            },
            Err(err) => ParsedResponse::unusable(format!("replacement tree is malformed: {err}")),
        };
    }

    let mut response = ParsedResponse::unusable("model reply has no \"operations\" list");
    response.message = message;
    response
}

fn looks_like_tree(object: &Map<String, Value>) -> bool {
    object.contains_key("id")
        && (object.contains_key("subtasks") || object.contains_key("children"))
}

fn kind_of(name: &str) -> Option<OperationKind> {
    let kind = match name.trim().to_lowercase().as_str() {
        "add" | "create" | "insert" => OperationKind::Add,
        "update" | "modify" | "edit" => OperationKind::Update,
        "delete" | "remove" => OperationKind::Delete,
        "query" | "search" | "find" | "get" => OperationKind::Query,
        _ => return None,
    };
    Some(kind)
}

/// Reads a string or number as an id
fn id_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_value(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

fn hours_value(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('h').trim().parse().ok(),
        _ => None,
    }
}

fn list_value(value: Option<&Value>) -> Option<Vec<String>> {
    match value? {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .collect(),
        ),
        Value::String(s) => Some(
            s.split([',', '，'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

/// Validates a `task` object into the bounded field record
pub fn parse_fields(task: &Map<String, Value>) -> Result<TaskFields, ReconcileError> {
    let status = match task.get("status") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => Some(
            TaskStatus::parse_loose(raw).ok_or_else(|| ReconcileError::InvalidStatus(raw.clone()))?,
        ),
        Some(other) => return Err(ReconcileError::InvalidStatus(other.to_string())),
    };

    let progress = match task.get("progress") {
        None | Some(Value::Null) => None,
        Some(value) => {
            let progress = progress_from_value(value).ok_or_else(|| {
                ReconcileError::MalformedOperation(format!("progress {value} is not a number"))
            })?;
            if !(0..=100).contains(&progress) {
                return Err(ReconcileError::InvalidProgress(progress));
            }
            Some(progress as u8)
        }
    };

    let priority = match task.get("priority") {
        Some(Value::String(s)) => Priority::parse_loose(s),
        Some(Value::Number(n)) => Priority::parse_loose(&n.to_string()),
        _ => None,
    };

    Ok(TaskFields {
        title: string_value(task.get("title")),
        description: string_value(task.get("description")),
        status,
        priority,
        due_date: string_value(task.get("due_date")),
        progress,
        tags: list_value(task.get("tags")),
        extension: ExtensionFields {
            assigned_to: string_value(task.get("assigned_to").or_else(|| task.get("assignee"))),
            estimated_hours: hours_value(task.get("estimated_hours")),
            actual_hours: hours_value(task.get("actual_hours")),
            dependencies: list_value(task.get("dependencies")),
            category: string_value(task.get("category")),
            notes: string_value(task.get("notes")),
        },
    })
}

/// Parses one entry of the `operations` list
pub fn parse_operation(value: &Value) -> ParsedOperation {
    let reject = |kind: Option<OperationKind>, error: ReconcileError| RejectedOperation { kind, error };

    let Some(object) = value.as_object() else {
        return Err(reject(
            None,
            ReconcileError::MalformedOperation("operation is not an object".to_string()),
        ));
    };

    let name = ["operation", "op", "type", "action"]
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str));
    let Some(kind) = name.and_then(kind_of) else {
        return Err(reject(
            None,
            ReconcileError::MalformedOperation(format!(
                "unknown operation {}",
                name.unwrap_or("<missing>")
            )),
        ));
    };

    // Fields normally live under "task"; accept them inline as well.
    let task = object
        .get("task")
        .and_then(Value::as_object)
        .unwrap_or(object);
    let target = id_value(task.get("id"))
        .or_else(|| id_value(object.get("id")))
        .or_else(|| id_value(object.get("task_id")));

    let operation = match kind {
        OperationKind::Add => {
            let parent_id = id_value(object.get("parent_id"))
                .or_else(|| id_value(task.get("parent_id")))
                .unwrap_or_else(|| ROOT_ID.to_string());
            let fields = parse_fields(task).map_err(|e| reject(Some(kind), e))?;
            Operation::Add {
                parent_id,
                id: target,
                fields,
            }
        }
        OperationKind::Update => {
            let id = target.ok_or_else(|| {
                reject(
                    Some(kind),
                    ReconcileError::MalformedOperation("update requires a task id".to_string()),
                )
            })?;
            let fields = parse_fields(task).map_err(|e| reject(Some(kind), e))?;
            Operation::Update { id, fields }
        }
        OperationKind::Delete => {
            let id = target.ok_or_else(|| {
                reject(
                    Some(kind),
                    ReconcileError::MalformedOperation("delete requires a task id".to_string()),
                )
            })?;
            Operation::Delete { id }
        }
        OperationKind::Query => {
            let filters = object
                .get("filters")
                .and_then(Value::as_object)
                .unwrap_or(task);
            let lookup = |key: &str| filters.get(key).or_else(|| object.get(key));
            let fields = parse_fields(filters).map_err(|e| reject(Some(kind), e))?;
            Operation::Query(TaskQuery {
                id: target.or_else(|| id_value(filters.get("id"))),
                text: ["text", "query", "title"]
                    .iter()
                    .find_map(|key| string_value(lookup(key))),
                status: fields.status,
                priority: fields.priority,
                tags: fields.tags,
                parent_id: id_value(lookup("parent_id")),
            })
        }
    };
    Ok(operation)
}
