use std::path::Path;

use cortexpropel::api::parse_response;
use cortexpropel::manager::ChatOutcome;
use cortexpropel::identity::is_valid_task_id;
use cortexpropel::store::RecordPatch;
use cortexpropel::{
    Config, ManagerError, Mirror, Priority, ReconcileError, ScriptedGateway, Strategy,
    TaskFields, TaskManager, TaskQuery, TaskStatus, ROOT_ID,
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn manager(dir: &Path) -> TaskManager<ScriptedGateway> {
    TaskManager::open(&Config::with_data_dir(dir)).unwrap()
}

fn scripted(dir: &Path, replies: Vec<serde_json::Value>) -> TaskManager<ScriptedGateway> {
    manager(dir).with_gateway(ScriptedGateway::new(replies.iter().map(|r| r.to_string())))
}

#[tokio::test]
async fn test_two_adds_under_root() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = scripted(
        dir.path(),
        vec![json!({
            "operations": [
                {"operation": "add", "parent_id": "root", "task": {"title": "买菜", "status": "pending"}},
                {"operation": "add", "parent_id": "root", "task": {"title": "做饭", "status": "pending"}}
            ],
            "message": "已添加两个任务"
        })],
    );

    let outcome = manager.process_input("明天要买菜和做饭").await.unwrap();

    assert_eq!(outcome.strategy, Strategy::OperationList);
    assert_eq!(outcome.message.as_deref(), Some("已添加两个任务"));
    let children = outcome.tree.root().subtasks();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| is_valid_task_id(c.id())));
    assert_ne!(children[0].id(), children[1].id());
    assert_eq!(manager.records().unwrap().len(), 2);
    assert_eq!(
        manager.gateway().unwrap().inputs(),
        vec!["明天要买菜和做饭".to_string()]
    );

    // The file on disk holds the same tree
    assert_eq!(manager.tree().unwrap(), outcome.tree);
}

#[tokio::test]
async fn test_unusable_reply_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = manager(dir.path()).with_gateway(ScriptedGateway::new(["抱歉，我没听懂。"]));
    manager.add_task(ROOT_ID, TaskFields::titled("existing")).unwrap();
    let before = manager.tree().unwrap();

    let outcome = manager.process_input("???").await.unwrap();

    assert!(outcome.diagnostic.is_some());
    assert!(outcome.report.outcomes.is_empty());
    assert!(!outcome.changed());
    assert_eq!(manager.tree().unwrap(), before);
}

#[tokio::test]
async fn test_missing_gateway_and_empty_input() {
    let dir = tempfile::tempdir().unwrap();
    let mut bare = manager(dir.path());
    assert!(matches!(
        bare.process_input("add something").await,
        Err(ManagerError::NoGateway)
    ));

    let mut manager = manager(dir.path()).with_gateway(ScriptedGateway::default());
    assert!(matches!(
        manager.process_input("   ").await,
        Err(ManagerError::EmptyInput)
    ));
    assert!(matches!(
        manager.process_input("anything").await,
        Err(ManagerError::Gateway(_))
    ));
}

#[test]
fn test_cascade_delete_removes_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = manager(dir.path());
    let keep = manager.add_task(ROOT_ID, TaskFields::titled("keep")).unwrap();
    let party = manager.add_task(ROOT_ID, TaskFields::titled("party")).unwrap();
    let food = manager.add_task(&party, TaskFields::titled("food")).unwrap();
    manager.add_task(&food, TaskFields::titled("salad")).unwrap();
    manager.add_task(&party, TaskFields::titled("music")).unwrap();
    assert_eq!(manager.records().unwrap().len(), 5);

    assert_eq!(manager.delete_task(&party).unwrap(), 4);

    let rows = manager.records().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, keep);
}

#[test]
fn test_delete_root_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = manager(dir.path());
    let err = manager.delete_task(ROOT_ID).unwrap_err();
    assert!(matches!(
        err,
        ManagerError::Reconcile(ReconcileError::CannotDeleteRoot)
    ));
    assert_eq!(manager.tree().unwrap().root().id(), ROOT_ID);
}

#[test]
fn test_mirror_keeps_extension_fields() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = manager(dir.path());

    let added = manager
        .apply_response(parse_response(
            &json!({"operations": [{
                "operation": "add",
                "parent_id": "root",
                "task": {"title": "Quarterly report", "estimated_hours": 5}
            }]})
            .to_string(),
        ))
        .unwrap();
    let id = added.report.added_ids()[0].to_string();
    assert_eq!(manager.record(&id).unwrap().unwrap().estimated_hours, Some(5.0));

    manager
        .apply_response(parse_response(
            &json!({"operations": [{
                "operation": "update",
                "task": {"id": id, "title": "Quarterly report v2", "status": "in_progress"}
            }]})
            .to_string(),
        ))
        .unwrap();

    let record = manager.record(&id).unwrap().unwrap();
    assert_eq!(record.title, "Quarterly report v2");
    assert_eq!(record.status, TaskStatus::InProgress);
    assert_eq!(record.estimated_hours, Some(5.0));
}

#[test]
fn test_rollup_reaches_root() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = manager(dir.path());
    let parent = manager.add_task(ROOT_ID, TaskFields::titled("parent")).unwrap();
    let children: Vec<String> = ["a", "b", "c"]
        .iter()
        .map(|t| manager.add_task(&parent, TaskFields::titled(*t)).unwrap())
        .collect();

    manager
        .update_task(&children[1], TaskFields::default().with_progress(50))
        .unwrap();
    manager
        .update_task(&children[2], TaskFields::default().with_status(TaskStatus::Completed))
        .unwrap();

    let tree = manager.tree().unwrap();
    let node = tree.find(&parent).unwrap();
    assert_eq!(node.progress(), 50);
    assert_eq!(node.status(), TaskStatus::InProgress);
    assert_eq!(tree.root().progress(), 50);

    let row = manager.record(&parent).unwrap().unwrap();
    assert_eq!(row.progress, 50);
    assert_eq!(row.status, TaskStatus::InProgress);
}

#[test]
fn test_full_replacement_migrates_legacy_ids() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("task_tree.json"),
        json!({
            "id": "root",
            "title": "Root Task",
            "subtasks": [{"id": "task-1a2b3c4d", "title": "Legacy", "subtasks": []}]
        })
        .to_string(),
    )
    .unwrap();

    let mut manager = manager(dir.path());
    manager.resync().unwrap();
    let mut fields = TaskFields::default();
    fields.extension.notes = Some("from the old days".to_string());
    manager.update_task("task-1a2b3c4d", fields).unwrap();

    let outcome = manager
        .apply_response(parse_response(
            &json!({
                "id": "root",
                "subtasks": [
                    {"id": "task-1a2b3c4d", "title": "Legacy", "status": "in_progress", "subtasks": [
                        {"title": "New step", "status": "in_progress", "progress": 30}
                    ]}
                ]
            })
            .to_string(),
        ))
        .unwrap();

    assert_eq!(outcome.strategy, Strategy::FullReplacement);
    let new_id = outcome.report.mapping.resolve("task-1a2b3c4d").unwrap().to_string();
    assert!(is_valid_task_id(&new_id));
    assert!(manager.record("task-1a2b3c4d").unwrap().is_none());

    let migrated = manager.record(&new_id).unwrap().unwrap();
    assert_eq!(migrated.notes.as_deref(), Some("from the old days"));
    assert_eq!(migrated.status, TaskStatus::InProgress);
    assert_eq!(migrated.progress, 30);
    assert_eq!(manager.records().unwrap().len(), 2);
}

#[test]
fn test_reset_clears_tree_and_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = manager(dir.path());
    manager.add_task(ROOT_ID, TaskFields::titled("one")).unwrap();
    manager.add_task(ROOT_ID, TaskFields::titled("two")).unwrap();

    let tree = manager.reset_tree().unwrap();

    assert!(tree.is_empty());
    assert!(manager.tree().unwrap().is_empty());
    assert!(manager.records().unwrap().is_empty());
    assert_eq!(manager.overview().unwrap().stats.total, 0);
}

#[test]
fn test_resync_repairs_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = manager(dir.path());
    let id = manager.add_task(ROOT_ID, TaskFields::titled("one")).unwrap();

    // Another writer drops the database
    drop(manager);
    std::fs::remove_file(dir.path().join("tasks.db")).unwrap();

    let mut manager = self::manager(dir.path());
    assert!(manager.record(&id).unwrap().is_none());
    let report = manager.resync().unwrap();
    assert_eq!(report.upserted, 1);
    assert!(manager.record(&id).unwrap().is_some());
}

fn apply_json(manager: &mut TaskManager<ScriptedGateway>, reply: serde_json::Value) -> ChatOutcome {
    manager.apply_response(parse_response(&reply.to_string())).unwrap()
}

#[test]
fn test_duplicate_id_in_replacement_keeps_mirror_row() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = manager(dir.path());
    let added = apply_json(
        &mut manager,
        json!({"operations": [{
            "operation": "add",
            "task": {"title": "Report", "estimated_hours": 5}
        }]}),
    );
    let id = added.report.added_ids()[0].to_string();

    let outcome = apply_json(
        &mut manager,
        json!({
            "id": "root",
            "subtasks": [
                {"id": id, "title": "Report"},
                {"id": id, "title": "Duplicate"}
            ]
        }),
    );

    let duplicate = outcome.tree.root().subtasks()[1].id().to_string();
    assert_ne!(duplicate, id);
    let kept = manager.record(&id).unwrap().unwrap();
    assert_eq!(kept.title, "Report");
    assert_eq!(kept.estimated_hours, Some(5.0));
    let copy = manager.record(&duplicate).unwrap().unwrap();
    assert_eq!(copy.title, "Duplicate");
    assert_eq!(copy.estimated_hours, None);
    assert_eq!(manager.records().unwrap().len(), 2);
}

#[test]
fn test_corrupt_tree_file_clears_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = manager(dir.path());
    manager.add_task(ROOT_ID, TaskFields::titled("one")).unwrap();
    manager.add_task(ROOT_ID, TaskFields::titled("two")).unwrap();
    std::fs::write(dir.path().join("task_tree.json"), "{ not json").unwrap();

    let id = manager.add_task(ROOT_ID, TaskFields::titled("three")).unwrap();

    let tree = manager.tree().unwrap();
    assert_eq!(tree.len() - 1, 1);
    let rows = manager.records().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id);
    assert!(dir.path().join("task_tree.corrupt.json").exists());
}

#[test]
fn test_ids_known_only_to_mirror_are_not_reused() {
    let dir = tempfile::tempdir().unwrap();
    const ARCHIVED: &str = "3f2504e0-4f89-41d3-9a0c-0305e82c3301";
    {
        let mut mirror = Mirror::open(dir.path().join("tasks.db")).unwrap();
        let mut patch = RecordPatch::new(ARCHIVED);
        patch.title = Some("Archived".to_string());
        mirror.upsert(&patch).unwrap();
    }

    let mut manager = manager(dir.path());
    let outcome = apply_json(
        &mut manager,
        json!({"operations": [{
            "operation": "add",
            "task": {"id": ARCHIVED, "title": "Fresh"}
        }]}),
    );

    let id = outcome.report.added_ids()[0].to_string();
    assert_ne!(id, ARCHIVED);
    assert!(is_valid_task_id(&id));
    assert_eq!(manager.record(&id).unwrap().unwrap().title, "Fresh");
    assert_eq!(manager.record(ARCHIVED).unwrap().unwrap().title, "Archived");
}

#[test]
fn test_leftover_lock_of_dead_process_does_not_block_reset() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = manager(dir.path());
    manager.add_task(ROOT_ID, TaskFields::titled("one")).unwrap();
    std::fs::write(dir.path().join("task_tree.lock"), "999999999\n").unwrap();

    let tree = manager.reset_tree().unwrap();

    assert!(tree.is_empty());
    assert!(!dir.path().join("task_tree.lock").exists());
}

#[test]
fn test_query_with_filters() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = manager(dir.path());
    let trip = manager.add_task(ROOT_ID, TaskFields::titled("Trip")).unwrap();
    let mut hotel = TaskFields::titled("Book hotel");
    hotel.priority = Some(Priority::High);
    let hotel = manager.add_task(&trip, hotel).unwrap();
    manager.add_task(&trip, TaskFields::titled("Book train")).unwrap();
    manager.add_task(ROOT_ID, TaskFields::titled("Book club")).unwrap();

    let under_trip = TaskQuery {
        text: Some("book".to_string()),
        parent_id: Some(trip.clone()),
        ..TaskQuery::default()
    };
    assert_eq!(manager.query(&under_trip).unwrap().len(), 2);

    let urgent = TaskQuery {
        priority: Some(Priority::High),
        ..under_trip
    };
    let found = manager.query(&urgent).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, hotel);
}
