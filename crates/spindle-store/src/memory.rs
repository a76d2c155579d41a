use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use sqlx::types::Json;

use crate::{
  Error, ExecutionRecord, ExecutionStatus, StatusUpdate, Store, StoredCheckpoint, StoredMessage,
  check_transition,
};

/// In-process store, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
  executions: RwLock<HashMap<String, ExecutionRecord>>,
  messages: RwLock<HashMap<String, Vec<StoredMessage>>>,
  checkpoints: RwLock<HashMap<String, StoredCheckpoint>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn create_execution(&self, execution: &ExecutionRecord) -> Result<(), Error> {
    let mut executions = self.executions.write();
    if executions.contains_key(&execution.execution_id) {
      return Err(Error::AlreadyExists(execution.execution_id.clone()));
    }
    executions.insert(execution.execution_id.clone(), execution.clone());
    Ok(())
  }

  async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, Error> {
    self
      .executions
      .read()
      .get(execution_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(execution_id.to_string()))
  }

  async fn update_status(
    &self,
    execution_id: &str,
    status: ExecutionStatus,
    update: StatusUpdate,
  ) -> Result<ExecutionRecord, Error> {
    let mut executions = self.executions.write();
    let record = executions
      .get_mut(execution_id)
      .ok_or_else(|| Error::NotFound(execution_id.to_string()))?;
    check_transition(execution_id, record.status, status)?;

    record.status = status;
    if let Some(output) = update.output {
      record.output = Some(Json(output));
    }
    if let Some(error) = update.error {
      record.error = Some(error);
    }
    record.updated_at = Utc::now();
    Ok(record.clone())
  }

  async fn list_executions(
    &self,
    workflow_name: Option<&str>,
  ) -> Result<Vec<ExecutionRecord>, Error> {
    let mut records: Vec<ExecutionRecord> = self
      .executions
      .read()
      .values()
      .filter(|record| workflow_name.is_none_or(|name| record.workflow_name == name))
      .cloned()
      .collect();
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(records)
  }

  async fn append_message(
    &self,
    execution_id: &str,
    message: &Value,
  ) -> Result<StoredMessage, Error> {
    let mut messages = self.messages.write();
    let log = messages.entry(execution_id.to_string()).or_default();
    let stored = StoredMessage {
      execution_id: execution_id.to_string(),
      seq: log.len() as i64 + 1,
      message: Json(message.clone()),
      recorded_at: Utc::now(),
    };
    log.push(stored.clone());
    Ok(stored)
  }

  async fn list_messages(
    &self,
    execution_id: &str,
    after_seq: i64,
  ) -> Result<Vec<StoredMessage>, Error> {
    Ok(
      self
        .messages
        .read()
        .get(execution_id)
        .map(|log| {
          log
            .iter()
            .filter(|message| message.seq > after_seq)
            .cloned()
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  async fn save_checkpoint(&self, checkpoint: &StoredCheckpoint) -> Result<(), Error> {
    self
      .checkpoints
      .write()
      .insert(checkpoint.execution_id.clone(), checkpoint.clone());
    Ok(())
  }

  async fn get_checkpoint(&self, execution_id: &str) -> Result<Option<StoredCheckpoint>, Error> {
    Ok(self.checkpoints.read().get(execution_id).cloned())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_rejects_invalid_transition() {
    let store = MemoryStore::new();
    store
      .create_execution(&ExecutionRecord::queued("e1", "greet", json!({})))
      .await
      .unwrap();

    let err = store
      .update_status("e1", ExecutionStatus::Completed, StatusUpdate::default())
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
    assert_eq!(
      store.get_execution("e1").await.unwrap().status,
      ExecutionStatus::Queued
    );
  }

  #[tokio::test]
  async fn test_messages_are_numbered_per_execution() {
    let store = MemoryStore::new();
    store.append_message("a", &json!({ "n": 1 })).await.unwrap();
    store.append_message("b", &json!({ "n": 1 })).await.unwrap();
    let second = store.append_message("a", &json!({ "n": 2 })).await.unwrap();
    assert_eq!(second.seq, 2);

    let tail = store.list_messages("a", 1).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].message.0, json!({ "n": 2 }));
  }
}
