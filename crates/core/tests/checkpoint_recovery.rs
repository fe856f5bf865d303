mod common;

use std::sync::Arc;

use serde_json::json;
use tether_core::{
    CheckpointConfig, CheckpointManager, CheckpointRequest, CheckpointStatus, EntityRef,
    ErrorKind, Workflow, WorkflowConfig, WorkflowError,
};
use tether_storage::{InMemoryRepository, Repository};

use common::{alice, assistant, at, seed, value_of, workflow, CountingPort, FlakyRepository};

fn request(name: &str, refs: Vec<EntityRef>, cursor: u64) -> CheckpointRequest {
    CheckpointRequest {
        name: name.to_string(),
        snapshot_entity_refs: refs,
        audit_cursor: cursor,
        rollback_target: "before-bulk-edit".to_string(),
    }
}

#[tokio::test]
async fn recover_restores_captured_content() {
    let repo = Arc::new(InMemoryRepository::new());
    let wf = workflow(repo.clone(), CountingPort::new());
    seed(repo.as_ref(), "note", "E", json!({"content": "A"})).await;

    let cursor = wf.audit().cursor().await.unwrap();
    let checkpoint = wf
        .checkpoints()
        .create(request("C", vec![EntityRef::new("note", "E")], cursor), &assistant(), Some(at(0)))
        .await
        .unwrap();
    assert_eq!(checkpoint.status, CheckpointStatus::Created);
    assert_eq!(checkpoint.created_by, assistant());

    seed(repo.as_ref(), "note", "E", json!({"content": "B"})).await;

    let result = wf
        .checkpoints()
        .recover(&checkpoint.id, &alice(), Some(at(10)))
        .await
        .unwrap();
    assert_eq!(
        value_of(repo.as_ref(), "note", "E").await,
        Some(json!({"content": "A"}))
    );
    assert_eq!(result.checkpoint.status, CheckpointStatus::Recovered);
    assert_eq!(result.checkpoint.recovered_at, Some(at(10)));
    assert_eq!(result.restored, vec![EntityRef::new("note", "E")]);
    assert_eq!(result.rollback_target, "before-bulk-edit");

    let stored = wf.checkpoints().inspect(&checkpoint.id).await.unwrap();
    assert_eq!(stored.status, CheckpointStatus::Recovered);
}

#[tokio::test]
async fn recover_removes_entities_that_did_not_exist() {
    let repo = Arc::new(InMemoryRepository::new());
    let wf = workflow(repo.clone(), CountingPort::new());
    seed(repo.as_ref(), "task", "t-1", json!({"title": "draft plan"})).await;

    let refs = vec![EntityRef::new("task", "t-1"), EntityRef::new("task", "t-2")];
    let checkpoint = wf
        .checkpoints()
        .create(request("bulk", refs, 0), &alice(), Some(at(0)))
        .await
        .unwrap();
    assert!(checkpoint.snapshot_entities[0].existed);
    assert!(!checkpoint.snapshot_entities[1].existed);
    assert!(checkpoint.snapshot_entities[1].state.is_none());

    seed(repo.as_ref(), "task", "t-1", json!({"title": "final plan"})).await;
    seed(repo.as_ref(), "task", "t-2", json!({"title": "added later"})).await;

    let result = wf
        .checkpoints()
        .recover(&checkpoint.id, &alice(), Some(at(5)))
        .await
        .unwrap();
    assert_eq!(result.restored.len(), 2);
    assert_eq!(
        value_of(repo.as_ref(), "task", "t-1").await,
        Some(json!({"title": "draft plan"}))
    );
    assert_eq!(value_of(repo.as_ref(), "task", "t-2").await, None);

    let history = wf.audit().history("checkpoint", &checkpoint.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].from_state, "created");
    assert_eq!(history[0].to_state, "recovered");
    assert_eq!(history[0].metadata["restored_count"], "2");
    assert_eq!(history[0].metadata["removed_count"], "1");
    assert_eq!(history[1].from_state, "none");
    assert_eq!(history[1].to_state, "created");
    assert_eq!(history[1].metadata["ref_count"], "2");
}

#[tokio::test]
async fn terminal_checkpoints_reject_further_transitions() {
    let repo = Arc::new(InMemoryRepository::new());
    let wf = workflow(repo.clone(), CountingPort::new());
    let checkpoints = wf.checkpoints();

    let kept = checkpoints
        .create(request("k", vec![], 0), &alice(), Some(at(0)))
        .await
        .unwrap();
    let kept = checkpoints.keep(&kept.id, &alice(), Some(at(1))).await.unwrap();
    assert_eq!(kept.status, CheckpointStatus::Kept);

    let err = checkpoints.recover(&kept.id, &alice(), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = checkpoints.keep(&kept.id, &alice(), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let recovered = checkpoints
        .create(request("r", vec![], 0), &alice(), Some(at(2)))
        .await
        .unwrap();
    checkpoints.recover(&recovered.id, &alice(), Some(at(3))).await.unwrap();
    let err = checkpoints.keep(&recovered.id, &alice(), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // Rejected transitions leave the trail alone: two per checkpoint.
    assert_eq!(wf.audit().cursor().await.unwrap(), 4);
}

#[tokio::test]
async fn create_validates_input() {
    let wf = workflow(Arc::new(InMemoryRepository::new()), CountingPort::new());
    let checkpoints = wf.checkpoints();

    let blank_name = request("  ", vec![], 0);
    let err = checkpoints.create(blank_name, &alice(), None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));

    let mut blank_target = request("c", vec![], 0);
    blank_target.rollback_target = String::new();
    let err = checkpoints.create(blank_target, &alice(), None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));

    let blank_ref = request("c", vec![EntityRef::new("task", "")], 0);
    let err = checkpoints.create(blank_ref, &alice(), None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));

    assert_eq!(wf.audit().cursor().await.unwrap(), 0);
}

#[tokio::test]
async fn missing_checkpoint_is_not_found() {
    let wf = workflow(Arc::new(InMemoryRepository::new()), CountingPort::new());
    let err = wf.checkpoints().inspect("nope").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = wf.checkpoints().recover("nope", &alice(), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn failed_restore_leaves_everything_untouched() {
    let repo = Arc::new(FlakyRepository::new());
    let wf = workflow(repo.clone(), CountingPort::new());
    for id in ["a", "b", "c"] {
        seed(repo.as_ref(), "task", id, json!({"v": 1})).await;
    }
    let refs = ["a", "b", "c"]
        .iter()
        .map(|id| EntityRef::new("task", *id))
        .collect();
    let checkpoint = wf
        .checkpoints()
        .create(request("mid-restore", refs, 0), &alice(), Some(at(0)))
        .await
        .unwrap();
    for id in ["a", "b", "c"] {
        seed(repo.as_ref(), "task", id, json!({"v": 2})).await;
    }
    let cursor_before = wf.audit().cursor().await.unwrap();

    // First restore write succeeds, the second blows up.
    repo.fail_writes_after(1);
    let err = wf
        .checkpoints()
        .recover(&checkpoint.id, &alice(), Some(at(5)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(matches!(err, WorkflowError::Storage(_)));

    for id in ["a", "b", "c"] {
        assert_eq!(value_of(repo.as_ref(), "task", id).await, Some(json!({"v": 2})));
    }
    let stored = wf.checkpoints().inspect(&checkpoint.id).await.unwrap();
    assert_eq!(stored.status, CheckpointStatus::Created);
    assert_eq!(wf.audit().cursor().await.unwrap(), cursor_before);

    repo.heal();
    wf.checkpoints()
        .recover(&checkpoint.id, &alice(), Some(at(6)))
        .await
        .unwrap();
    for id in ["a", "b", "c"] {
        assert_eq!(value_of(repo.as_ref(), "task", id).await, Some(json!({"v": 1})));
    }
}

#[tokio::test]
async fn tampered_snapshot_fails_digest_check() {
    let repo = Arc::new(InMemoryRepository::new());
    let wf = workflow(repo.clone(), CountingPort::new());
    seed(repo.as_ref(), "note", "n-1", json!({"content": "original"})).await;
    let checkpoint = wf
        .checkpoints()
        .create(request("guarded", vec![EntityRef::new("note", "n-1")], 0), &alice(), Some(at(0)))
        .await
        .unwrap();

    let mut raw = repo.get_entity("checkpoint", &checkpoint.id).await.unwrap().unwrap().value;
    raw["snapshotEntities"][0]["state"] = json!({"content": "forged"});
    seed(repo.as_ref(), "checkpoint", &checkpoint.id, raw).await;

    let err = wf
        .checkpoints()
        .recover(&checkpoint.id, &alice(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Corrupted { .. }));
    assert_eq!(err.public_message(), "internal error");

    let lenient = CheckpointManager::new(
        repo.clone(),
        CheckpointConfig {
            verify_digest: false,
            ..CheckpointConfig::default()
        },
    );
    lenient.recover(&checkpoint.id, &alice(), None).await.unwrap();
    assert_eq!(
        value_of(repo.as_ref(), "note", "n-1").await,
        Some(json!({"content": "forged"}))
    );
}

#[tokio::test]
async fn list_is_newest_first_and_filters_by_status() {
    let repo = Arc::new(InMemoryRepository::new());
    let config = WorkflowConfig {
        checkpoints: CheckpointConfig {
            max_snapshot_refs: 2,
            verify_digest: true,
        },
        ..WorkflowConfig::default()
    };
    let wf = Workflow::new(repo, CountingPort::new(), config);
    let checkpoints = wf.checkpoints();

    let first = checkpoints
        .create(request("first", vec![], 0), &alice(), Some(at(0)))
        .await
        .unwrap();
    let second = checkpoints
        .create(request("second", vec![], 1), &alice(), Some(at(10)))
        .await
        .unwrap();
    checkpoints.keep(&first.id, &alice(), Some(at(20))).await.unwrap();

    let all = checkpoints.list(None).await.unwrap();
    let names: Vec<_> = all.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["second", "first"]);

    let open = checkpoints.list(Some(CheckpointStatus::Created)).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, second.id);

    let too_many = request(
        "wide",
        vec![
            EntityRef::new("task", "a"),
            EntityRef::new("task", "b"),
            EntityRef::new("task", "c"),
        ],
        0,
    );
    let err = checkpoints.create(too_many, &alice(), None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));
}
