//! Spindle Store
//!
//! Storage for the orchestration server. The [`Store`] trait covers:
//! - execution records and their status transitions
//! - the ordered message log of each execution
//! - the latest checkpoint tree of each execution
//!
//! [`MemoryStore`] keeps everything in process; [`SqliteStore`] persists to
//! SQLite through `sqlx`.

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{ExecutionRecord, ExecutionStatus, StatusUpdate, StoredCheckpoint, StoredMessage};

use async_trait::async_trait;
use serde_json::Value;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// The record already exists.
  #[error("already exists: {0}")]
  AlreadyExists(String),

  /// The status change is not allowed from the current status.
  #[error("execution '{execution_id}' cannot move from {from} to {to}")]
  InvalidTransition {
    execution_id: String,
    from: ExecutionStatus,
    to: ExecutionStatus,
  },

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Applying migrations failed.
  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Storage for executions, their message logs and checkpoints.
#[async_trait]
pub trait Store: Send + Sync {
  /// Create a new execution record.
  async fn create_execution(&self, execution: &ExecutionRecord) -> Result<(), Error>;

  /// Get an execution by ID.
  async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, Error>;

  /// Move an execution to `status`, rejecting transitions the lifecycle does
  /// not allow.
  async fn update_status(
    &self,
    execution_id: &str,
    status: ExecutionStatus,
    update: StatusUpdate,
  ) -> Result<ExecutionRecord, Error>;

  /// List executions, newest first, optionally for one workflow.
  async fn list_executions(&self, workflow_name: Option<&str>)
  -> Result<Vec<ExecutionRecord>, Error>;

  /// Append a message to the execution's log and return it with its
  /// sequence number.
  async fn append_message(&self, execution_id: &str, message: &Value)
  -> Result<StoredMessage, Error>;

  /// Messages with a sequence number greater than `after_seq`, in order.
  async fn list_messages(&self, execution_id: &str, after_seq: i64)
  -> Result<Vec<StoredMessage>, Error>;

  /// Replace the stored checkpoint of an execution.
  async fn save_checkpoint(&self, checkpoint: &StoredCheckpoint) -> Result<(), Error>;

  /// The latest checkpoint of an execution, if any was received.
  async fn get_checkpoint(&self, execution_id: &str) -> Result<Option<StoredCheckpoint>, Error>;
}

pub(crate) fn check_transition(
  execution_id: &str,
  from: ExecutionStatus,
  to: ExecutionStatus,
) -> Result<(), Error> {
  if from.can_transition_to(to) {
    Ok(())
  } else {
    Err(Error::InvalidTransition {
      execution_id: execution_id.to_string(),
      from,
      to,
    })
  }
}
