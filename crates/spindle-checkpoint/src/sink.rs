//! Destinations for checkpoint transmissions.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::CheckpointError;
use crate::node::ExecutionNode;
use crate::wire::CheckpointReceipt;

/// One transmission: the full tree as of the moment it was taken.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointBatch {
  pub workflow_name: String,
  /// `None` until the storage side has assigned an execution id.
  pub execution_id: Option<String>,
  pub tree: ExecutionNode,
}

/// Durable storage for checkpoint trees.
///
/// The manager calls `persist` from its background task, never concurrently
/// for the same tree.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
  async fn persist(&self, batch: &CheckpointBatch) -> Result<CheckpointReceipt, CheckpointError>;
}

fn local_receipt(batch: &CheckpointBatch) -> CheckpointReceipt {
  let execution_id = batch
    .execution_id
    .clone()
    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
  CheckpointReceipt {
    trace_id: execution_id.clone(),
    execution_id,
    workflow_name: batch.workflow_name.clone(),
  }
}

/// Discards every batch.
#[derive(Debug, Clone, Default)]
pub struct NoopSink;

#[async_trait]
impl CheckpointSink for NoopSink {
  async fn persist(&self, batch: &CheckpointBatch) -> Result<CheckpointReceipt, CheckpointError> {
    Ok(local_receipt(batch))
  }
}

/// Keeps the most recent batch in memory.
///
/// Used for standalone runs and in tests.
#[derive(Debug, Default)]
pub struct MemorySink {
  latest: Mutex<Option<CheckpointBatch>>,
  sends: AtomicUsize,
}

impl MemorySink {
  pub fn new() -> Self {
    Self::default()
  }

  /// The last batch persisted.
  pub fn latest(&self) -> Option<CheckpointBatch> {
    self.latest.lock().clone()
  }

  /// How many batches have been persisted.
  pub fn send_count(&self) -> usize {
    self.sends.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl CheckpointSink for MemorySink {
  async fn persist(&self, batch: &CheckpointBatch) -> Result<CheckpointReceipt, CheckpointError> {
    let receipt = local_receipt(batch);
    *self.latest.lock() = Some(batch.clone());
    self.sends.fetch_add(1, Ordering::SeqCst);
    Ok(receipt)
  }
}
