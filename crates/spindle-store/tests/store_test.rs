use serde_json::json;
use spindle_store::{
  Error, ExecutionRecord, ExecutionStatus, MemoryStore, SqliteStore, StatusUpdate, Store,
  StoredCheckpoint,
};

async fn exercise_lifecycle(store: &dyn Store) {
  store
    .create_execution(&ExecutionRecord::queued("exec-1", "greet", json!({ "name": "Ada" })))
    .await
    .unwrap();
  assert!(matches!(
    store
      .create_execution(&ExecutionRecord::queued("exec-1", "greet", json!({})))
      .await,
    Err(Error::AlreadyExists(_))
  ));

  for status in [ExecutionStatus::Starting, ExecutionStatus::Running] {
    store
      .update_status("exec-1", status, StatusUpdate::default())
      .await
      .unwrap();
  }
  let done = store
    .update_status(
      "exec-1",
      ExecutionStatus::Completed,
      StatusUpdate::output(json!("hello Ada")),
    )
    .await
    .unwrap();
  assert_eq!(done.status, ExecutionStatus::Completed);

  let record = store.get_execution("exec-1").await.unwrap();
  assert_eq!(record.input.0, json!({ "name": "Ada" }));
  assert_eq!(record.output.map(|o| o.0), Some(json!("hello Ada")));

  let err = store
    .update_status("exec-1", ExecutionStatus::Failed, StatusUpdate::error("late"))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::InvalidTransition { .. }));

  assert!(matches!(
    store.get_execution("missing").await,
    Err(Error::NotFound(_))
  ));
}

async fn exercise_listing(store: &dyn Store) {
  for (id, name) in [("a", "triage"), ("b", "letters"), ("c", "triage")] {
    store
      .create_execution(&ExecutionRecord::queued(id, name, json!({})))
      .await
      .unwrap();
  }
  let before = store.list_executions(None).await.unwrap().len();
  assert!(before >= 3);
  let triage = store.list_executions(Some("triage")).await.unwrap();
  assert_eq!(triage.len(), 2);
  assert!(triage.iter().all(|r| r.workflow_name == "triage"));
}

async fn exercise_messages(store: &dyn Store) {
  for n in 1..=3 {
    let stored = store
      .append_message("exec-m", &json!({ "type": "status", "n": n }))
      .await
      .unwrap();
    assert_eq!(stored.seq, n);
  }
  store.append_message("other", &json!({})).await.unwrap();

  let all = store.list_messages("exec-m", 0).await.unwrap();
  assert_eq!(all.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
  let tail = store.list_messages("exec-m", 2).await.unwrap();
  assert_eq!(tail.len(), 1);
  assert_eq!(tail[0].message.0["n"], 3);
}

async fn exercise_checkpoints(store: &dyn Store) {
  assert!(store.get_checkpoint("exec-c").await.unwrap().is_none());
  store
    .save_checkpoint(&StoredCheckpoint::new("exec-c", "greet", json!({ "id": "v1" })))
    .await
    .unwrap();
  store
    .save_checkpoint(&StoredCheckpoint::new("exec-c", "greet", json!({ "id": "v2" })))
    .await
    .unwrap();
  let latest = store.get_checkpoint("exec-c").await.unwrap().unwrap();
  assert_eq!(latest.tree.0, json!({ "id": "v2" }));
}

#[tokio::test]
async fn test_memory_store() {
  let store = MemoryStore::new();
  exercise_lifecycle(&store).await;
  exercise_listing(&store).await;
  exercise_messages(&store).await;
  exercise_checkpoints(&store).await;
}

#[tokio::test]
async fn test_sqlite_in_memory_store() {
  let store = SqliteStore::in_memory().await.unwrap();
  exercise_lifecycle(&store).await;
  exercise_listing(&store).await;
  exercise_messages(&store).await;
  exercise_checkpoints(&store).await;
}

#[tokio::test]
async fn test_sqlite_file_store_survives_reopen() {
  let dir = tempfile::tempdir().unwrap();
  let url = format!("sqlite://{}", dir.path().join("spindle.db").display());

  {
    let store = SqliteStore::connect(&url).await.unwrap();
    store
      .create_execution(&ExecutionRecord::queued("persisted", "greet", json!({})))
      .await
      .unwrap();
    store
      .append_message("persisted", &json!({ "type": "status" }))
      .await
      .unwrap();
  }

  let reopened = SqliteStore::connect(&url).await.unwrap();
  assert_eq!(
    reopened.get_execution("persisted").await.unwrap().status,
    ExecutionStatus::Queued
  );
  assert_eq!(reopened.list_messages("persisted", 0).await.unwrap().len(), 1);
}
