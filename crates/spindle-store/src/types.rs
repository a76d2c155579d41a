use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;

/// Lifecycle of a server-side execution.
///
/// `queued -> starting -> running -> completed`, with `failed` reachable from
/// every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ExecutionStatus {
  Queued,
  Starting,
  Running,
  Completed,
  Failed,
}

impl ExecutionStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Queued => "queued",
      Self::Starting => "starting",
      Self::Running => "running",
      Self::Completed => "completed",
      Self::Failed => "failed",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Completed | Self::Failed)
  }

  pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
    use ExecutionStatus::*;
    matches!(
      (self, next),
      (Queued, Starting) | (Starting, Running) | (Running, Completed) | (Queued | Starting | Running, Failed)
    )
  }
}

impl fmt::Display for ExecutionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ExecutionStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "queued" => Ok(Self::Queued),
      "starting" => Ok(Self::Starting),
      "running" => Ok(Self::Running),
      "completed" => Ok(Self::Completed),
      "failed" => Ok(Self::Failed),
      other => Err(format!("unknown execution status: {}", other)),
    }
  }
}

/// An execution as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ExecutionRecord {
  pub execution_id: String,
  pub workflow_name: String,
  pub status: ExecutionStatus,
  pub input: Json<Value>,
  pub output: Option<Json<Value>>,
  pub error: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
  /// A freshly queued execution.
  pub fn queued(
    execution_id: impl Into<String>,
    workflow_name: impl Into<String>,
    input: Value,
  ) -> Self {
    let now = Utc::now();
    Self {
      execution_id: execution_id.into(),
      workflow_name: workflow_name.into(),
      status: ExecutionStatus::Queued,
      input: Json(input),
      output: None,
      error: None,
      created_at: now,
      updated_at: now,
    }
  }
}

/// The outcome written alongside a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
  pub output: Option<Value>,
  pub error: Option<String>,
}

impl StatusUpdate {
  pub fn output(output: Value) -> Self {
    Self {
      output: Some(output),
      error: None,
    }
  }

  pub fn error(message: impl Into<String>) -> Self {
    Self {
      output: None,
      error: Some(message.into()),
    }
  }
}

/// One entry of an execution's message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StoredMessage {
  pub execution_id: String,
  /// Position in the log, starting at 1.
  pub seq: i64,
  pub message: Json<Value>,
  pub recorded_at: DateTime<Utc>,
}

/// The latest checkpoint tree received for an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StoredCheckpoint {
  pub execution_id: String,
  pub workflow_name: String,
  pub tree: Json<Value>,
  pub updated_at: DateTime<Utc>,
}

impl StoredCheckpoint {
  pub fn new(execution_id: impl Into<String>, workflow_name: impl Into<String>, tree: Value) -> Self {
    Self {
      execution_id: execution_id.into(),
      workflow_name: workflow_name.into(),
      tree: Json(tree),
      updated_at: Utc::now(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_transitions() {
    use ExecutionStatus::*;
    assert!(Queued.can_transition_to(Starting));
    assert!(Starting.can_transition_to(Running));
    assert!(Running.can_transition_to(Completed));
    assert!(Queued.can_transition_to(Failed));
    assert!(!Queued.can_transition_to(Running));
    assert!(!Completed.can_transition_to(Failed));
    assert!(!Failed.can_transition_to(Running));
  }

  #[test]
  fn test_status_round_trips_through_str() {
    for status in [
      ExecutionStatus::Queued,
      ExecutionStatus::Running,
      ExecutionStatus::Failed,
    ] {
      assert_eq!(status.as_str().parse::<ExecutionStatus>(), Ok(status));
    }
    assert!("paused".parse::<ExecutionStatus>().is_err());
  }
}
