mod common;

use std::sync::Arc;

use serde_json::json;
use tether_core::{AuditFilter, ErrorKind, WorkflowError};
use tether_storage::InMemoryRepository;

use common::{
    alice, assistant, at, scheduler, seed, value_of, workflow, CountingPort, FlakyRepository,
};

async fn pending_event(repo: &InMemoryRepository, id: &str) {
    seed(
        repo,
        "event",
        id,
        json!({"title": "Quarterly review", "syncState": "pending_approval"}),
    )
    .await;
}

#[tokio::test]
async fn request_then_approve_executes_once() {
    let repo = Arc::new(InMemoryRepository::new());
    let port = CountingPort::new();
    let wf = workflow(repo.clone(), port.clone());
    seed(repo.as_ref(), "event", "ev-1", json!({"title": "Quarterly review"})).await;

    let requested = wf
        .approvals()
        .request_approval("calendar_sync", "event", "ev-1", &assistant(), Some(at(0)))
        .await
        .unwrap();
    assert_eq!(requested.from_state, "local_only");
    assert_eq!(requested.to_state, "pending_approval");
    assert_eq!(requested.metadata["action_type"], "calendar_sync");

    let result = wf
        .approvals()
        .approve("calendar_sync", "event", "ev-1", true, &alice(), Some(at(30)))
        .await
        .unwrap();
    assert_eq!(port.calls(), 1);
    assert_eq!(result.state, "synced");
    assert_eq!(result.approved_by, alice());

    let value = value_of(repo.as_ref(), "event", "ev-1").await.unwrap();
    assert_eq!(value["syncState"], "synced");
    assert_eq!(value["executionId"], result.execution_id.as_str());
    assert_eq!(value["title"], "Quarterly review");

    let history = wf.audit().history("event", "ev-1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].from_state, "pending_approval");
    assert_eq!(history[0].to_state, "synced");
    assert_eq!(history[0].actor, alice());
    assert_eq!(history[0].metadata["execution_id"], result.execution_id);
}

#[tokio::test]
async fn draft_execution_uses_status_field() {
    let repo = Arc::new(InMemoryRepository::new());
    let port = CountingPort::new();
    let wf = workflow(repo.clone(), port.clone());
    seed(repo.as_ref(), "draft", "d-1", json!({"status": "draft", "body": "hi"})).await;

    wf.approvals()
        .request_approval("draft_execution", "draft", "d-1", &scheduler(), None)
        .await
        .unwrap();
    wf.approvals()
        .approve("draft_execution", "draft", "d-1", true, &alice(), None)
        .await
        .unwrap();

    let value = value_of(repo.as_ref(), "draft", "d-1").await.unwrap();
    assert_eq!(value["status"], "executed");
    assert!(value["executionId"].is_string());
}

#[tokio::test]
async fn only_users_may_approve() {
    let repo = Arc::new(InMemoryRepository::new());
    let port = CountingPort::new();
    let wf = workflow(repo.clone(), port.clone());
    pending_event(repo.as_ref(), "ev-1").await;

    for actor in [assistant(), scheduler()] {
        let err = wf
            .approvals()
            .approve("calendar_sync", "event", "ev-1", true, &actor, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }
    assert_eq!(port.calls(), 0);
    let value = value_of(repo.as_ref(), "event", "ev-1").await.unwrap();
    assert_eq!(value["syncState"], "pending_approval");
}

#[tokio::test]
async fn existence_is_checked_before_authority() {
    let wf = workflow(Arc::new(InMemoryRepository::new()), CountingPort::new());
    let err = wf
        .approvals()
        .approve("calendar_sync", "event", "ghost", true, &assistant(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn rejection_changes_nothing() {
    let repo = Arc::new(InMemoryRepository::new());
    let port = CountingPort::new();
    let wf = workflow(repo.clone(), port.clone());
    pending_event(repo.as_ref(), "ev-1").await;
    let before = value_of(repo.as_ref(), "event", "ev-1").await;

    let err = wf
        .approvals()
        .approve("calendar_sync", "event", "ev-1", false, &alice(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));
    assert_eq!(port.calls(), 0);
    assert_eq!(value_of(repo.as_ref(), "event", "ev-1").await, before);
    assert_eq!(wf.audit().cursor().await.unwrap(), 0);

    // Still approvable afterwards.
    wf.approvals()
        .approve("calendar_sync", "event", "ev-1", true, &alice(), None)
        .await
        .unwrap();
    assert_eq!(port.calls(), 1);
}

#[tokio::test]
async fn approve_requires_pending_state() {
    let repo = Arc::new(InMemoryRepository::new());
    let port = CountingPort::new();
    let wf = workflow(repo.clone(), port.clone());
    seed(repo.as_ref(), "event", "idle", json!({"syncState": "local_only"})).await;
    seed(repo.as_ref(), "event", "done", json!({"syncState": "synced"})).await;

    for id in ["idle", "done"] {
        let err = wf
            .approvals()
            .approve("calendar_sync", "event", id, true, &alice(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict, "{id}");
    }
    assert_eq!(port.calls(), 0);

    let err = wf
        .approvals()
        .request_approval("calendar_sync", "event", "done", &alice(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn malformed_input_is_rejected_before_lookup() {
    let wf = workflow(Arc::new(InMemoryRepository::new()), CountingPort::new());
    let gate = wf.approvals();

    let err = gate
        .approve("fax_send", "event", "ev-1", true, &alice(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));

    let err = gate
        .approve("calendar_sync", "draft", "ev-1", true, &alice(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));
}

#[tokio::test]
async fn port_failure_keeps_entity_pending() {
    let repo = Arc::new(InMemoryRepository::new());
    let port = CountingPort::new();
    let wf = workflow(repo.clone(), port.clone());
    pending_event(repo.as_ref(), "ev-1").await;

    port.set_failing(true);
    let err = wf
        .approvals()
        .approve("calendar_sync", "event", "ev-1", true, &alice(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Execution { .. }));
    assert_eq!(err.kind(), ErrorKind::Internal);

    port.set_failing(false);
    port.set_blank_ids(true);
    let err = wf
        .approvals()
        .approve("calendar_sync", "event", "ev-1", true, &alice(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Execution { .. }));

    let value = value_of(repo.as_ref(), "event", "ev-1").await.unwrap();
    assert_eq!(value["syncState"], "pending_approval");
    assert!(value.get("executionId").is_none());
    assert_eq!(wf.audit().cursor().await.unwrap(), 0);
}

#[tokio::test]
async fn approval_after_storage_failure_reuses_idempotency_key() {
    let repo = Arc::new(FlakyRepository::new());
    let port = CountingPort::new();
    let wf = workflow(repo.clone(), port.clone());
    seed(repo.as_ref(), "event", "ev-1", json!({"syncState": "pending_approval"})).await;

    // The port runs, then the terminal write fails and the snapshot aborts.
    repo.fail_writes_after(0);
    let err = wf
        .approvals()
        .approve("calendar_sync", "event", "ev-1", true, &alice(), Some(at(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Storage(_)));
    assert_eq!(port.calls(), 1);
    let value = value_of(repo.as_ref(), "event", "ev-1").await.unwrap();
    assert_eq!(value["syncState"], "pending_approval");
    assert_eq!(wf.audit().cursor().await.unwrap(), 0);

    repo.heal();
    let result = wf
        .approvals()
        .approve("calendar_sync", "event", "ev-1", true, &alice(), Some(at(20)))
        .await
        .unwrap();
    assert_eq!(result.state, "synced");
    assert_eq!(port.calls(), 2);

    let keys = port.keys();
    assert_eq!(keys, ["event/ev-1@v0", "event/ev-1@v0"]);

    // The approved write is v1; pending again is a fresh version and key.
    seed(repo.as_ref(), "event", "ev-1", json!({"syncState": "pending_approval"})).await;
    wf.approvals()
        .approve("calendar_sync", "event", "ev-1", true, &alice(), Some(at(30)))
        .await
        .unwrap();
    assert_eq!(port.keys()[2], "event/ev-1@v2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_execute_exactly_once() {
    const RACERS: usize = 8;

    let repo = Arc::new(InMemoryRepository::new());
    let port = CountingPort::new();
    let wf = Arc::new(workflow(repo.clone(), port.clone()));
    pending_event(repo.as_ref(), "ev-race").await;

    let mut handles = Vec::with_capacity(RACERS);
    for _ in 0..RACERS {
        let gate = wf.approvals();
        handles.push(tokio::spawn(async move {
            gate.approve("calendar_sync", "event", "ev-race", true, &alice(), None)
                .await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(err) => {
                assert_eq!(err.kind(), ErrorKind::Conflict, "{err}");
                conflicts += 1;
            }
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, RACERS - 1);
    assert_eq!(port.calls(), 1);

    let executed = wf
        .audit()
        .list(&AuditFilter {
            entity_id: Some("ev-race".into()),
            ..AuditFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].to_state, "synced");
}
