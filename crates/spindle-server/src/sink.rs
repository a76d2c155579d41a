use std::sync::Arc;

use async_trait::async_trait;
use spindle_checkpoint::{CheckpointBatch, CheckpointError, CheckpointReceipt, CheckpointSink};
use spindle_store::{Store, StoredCheckpoint};
use uuid::Uuid;

/// Persists checkpoint trees straight into the server's [`Store`].
pub struct StoreCheckpointSink {
  store: Arc<dyn Store>,
}

impl StoreCheckpointSink {
  pub fn new(store: Arc<dyn Store>) -> Self {
    Self { store }
  }
}

#[async_trait]
impl CheckpointSink for StoreCheckpointSink {
  async fn persist(&self, batch: &CheckpointBatch) -> Result<CheckpointReceipt, CheckpointError> {
    let execution_id = batch
      .execution_id
      .clone()
      .unwrap_or_else(|| Uuid::new_v4().to_string());
    let tree = serde_json::to_value(&batch.tree).map_err(|err| CheckpointError::Encoding {
      message: err.to_string(),
    })?;

    self
      .store
      .save_checkpoint(&StoredCheckpoint::new(
        &execution_id,
        &batch.workflow_name,
        tree,
      ))
      .await
      .map_err(|err| CheckpointError::Transport {
        message: err.to_string(),
      })?;

    Ok(CheckpointReceipt {
      execution_id,
      trace_id: Uuid::new_v4().to_string(),
      workflow_name: batch.workflow_name.clone(),
    })
  }
}
