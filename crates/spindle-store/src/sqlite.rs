use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;

use crate::{
  Error, ExecutionRecord, ExecutionStatus, StatusUpdate, Store, StoredCheckpoint, StoredMessage,
  check_transition,
};

const EXECUTION_COLUMNS: &str =
  "execution_id, workflow_name, status, input, output, error, created_at, updated_at";

/// SQLite-based store implementation.
#[derive(Debug, Clone)]
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if missing) the database at `url`, e.g.
  /// `sqlite:///var/lib/spindle/spindle.db`, and run migrations.
  pub async fn connect(url: &str) -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// A private in-memory database.
  ///
  /// The pool holds a single connection because every SQLite `:memory:`
  /// connection is its own database.
  pub async fn in_memory() -> Result<Self, Error> {
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect("sqlite::memory:")
      .await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::migrate!("../../migrations").run(&self.pool).await?;
    Ok(())
  }
}

#[async_trait]
impl Store for SqliteStore {
  async fn create_execution(&self, execution: &ExecutionRecord) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
      INSERT INTO workflow_executions
        (execution_id, workflow_name, status, input, output, error, created_at, updated_at)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&execution.execution_id)
    .bind(&execution.workflow_name)
    .bind(execution.status)
    .bind(&execution.input)
    .bind(&execution.output)
    .bind(&execution.error)
    .bind(execution.created_at)
    .bind(execution.updated_at)
    .execute(&self.pool)
    .await;

    match result {
      Ok(_) => Ok(()),
      Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
        Err(Error::AlreadyExists(execution.execution_id.clone()))
      }
      Err(err) => Err(err.into()),
    }
  }

  async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, Error> {
    sqlx::query_as(&format!(
      "SELECT {} FROM workflow_executions WHERE execution_id = ?",
      EXECUTION_COLUMNS
    ))
    .bind(execution_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| Error::NotFound(execution_id.to_string()))
  }

  async fn update_status(
    &self,
    execution_id: &str,
    status: ExecutionStatus,
    update: StatusUpdate,
  ) -> Result<ExecutionRecord, Error> {
    let mut tx = self.pool.begin().await?;
    let current: ExecutionRecord = sqlx::query_as(&format!(
      "SELECT {} FROM workflow_executions WHERE execution_id = ?",
      EXECUTION_COLUMNS
    ))
    .bind(execution_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| Error::NotFound(execution_id.to_string()))?;
    check_transition(execution_id, current.status, status)?;

    let updated = ExecutionRecord {
      status,
      output: update.output.map(Json).or(current.output),
      error: update.error.or(current.error),
      updated_at: Utc::now(),
      ..current
    };
    sqlx::query(
      r#"
      UPDATE workflow_executions
      SET status = ?, output = ?, error = ?, updated_at = ?
      WHERE execution_id = ?
      "#,
    )
    .bind(updated.status)
    .bind(&updated.output)
    .bind(&updated.error)
    .bind(updated.updated_at)
    .bind(execution_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(updated)
  }

  async fn list_executions(
    &self,
    workflow_name: Option<&str>,
  ) -> Result<Vec<ExecutionRecord>, Error> {
    let records = match workflow_name {
      Some(name) => {
        sqlx::query_as(&format!(
          "SELECT {} FROM workflow_executions WHERE workflow_name = ? ORDER BY created_at DESC",
          EXECUTION_COLUMNS
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await?
      }
      None => {
        sqlx::query_as(&format!(
          "SELECT {} FROM workflow_executions ORDER BY created_at DESC",
          EXECUTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?
      }
    };
    Ok(records)
  }

  async fn append_message(
    &self,
    execution_id: &str,
    message: &Value,
  ) -> Result<StoredMessage, Error> {
    let recorded_at = Utc::now();
    let message = Json(message.clone());
    // Numbering inside a single statement keeps concurrent appends unique.
    let seq: i64 = sqlx::query_scalar(
      r#"
      INSERT INTO execution_messages (execution_id, seq, message, recorded_at)
      VALUES (
        ?,
        (SELECT COALESCE(MAX(seq), 0) + 1 FROM execution_messages WHERE execution_id = ?),
        ?,
        ?
      )
      RETURNING seq
      "#,
    )
    .bind(execution_id)
    .bind(execution_id)
    .bind(&message)
    .bind(recorded_at)
    .fetch_one(&self.pool)
    .await?;

    Ok(StoredMessage {
      execution_id: execution_id.to_string(),
      seq,
      message,
      recorded_at,
    })
  }

  async fn list_messages(
    &self,
    execution_id: &str,
    after_seq: i64,
  ) -> Result<Vec<StoredMessage>, Error> {
    let messages = sqlx::query_as(
      r#"
      SELECT execution_id, seq, message, recorded_at
      FROM execution_messages
      WHERE execution_id = ? AND seq > ?
      ORDER BY seq ASC
      "#,
    )
    .bind(execution_id)
    .bind(after_seq)
    .fetch_all(&self.pool)
    .await?;
    Ok(messages)
  }

  async fn save_checkpoint(&self, checkpoint: &StoredCheckpoint) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO execution_checkpoints (execution_id, workflow_name, tree, updated_at)
      VALUES (?, ?, ?, ?)
      ON CONFLICT (execution_id) DO UPDATE SET
        workflow_name = excluded.workflow_name,
        tree = excluded.tree,
        updated_at = excluded.updated_at
      "#,
    )
    .bind(&checkpoint.execution_id)
    .bind(&checkpoint.workflow_name)
    .bind(&checkpoint.tree)
    .bind(checkpoint.updated_at)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn get_checkpoint(&self, execution_id: &str) -> Result<Option<StoredCheckpoint>, Error> {
    let checkpoint = sqlx::query_as(
      r#"
      SELECT execution_id, workflow_name, tree, updated_at
      FROM execution_checkpoints
      WHERE execution_id = ?
      "#,
    )
    .bind(execution_id)
    .fetch_optional(&self.pool)
    .await?;
    Ok(checkpoint)
  }
}
