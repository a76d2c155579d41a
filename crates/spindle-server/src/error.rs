//! Server error types.

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde_json::json;
use spindle_checkpoint::CheckpointError;
use spindle_engine::EngineError;

/// Errors returned by the orchestrator and its HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
  #[error("workflow not found: {0}")]
  WorkflowNotFound(String),

  #[error("workflow already registered: {0}")]
  AlreadyRegistered(String),

  #[error("invalid request: {0}")]
  InvalidRequest(String),

  #[error("no checkpoint recorded for execution: {0}")]
  CheckpointNotFound(String),

  #[error(transparent)]
  Store(#[from] spindle_store::Error),

  #[error(transparent)]
  Checkpoint(#[from] CheckpointError),

  #[error("internal error: {0}")]
  Internal(String),
}

impl From<EngineError> for ServerError {
  fn from(err: EngineError) -> Self {
    match err {
      EngineError::InvalidInput { message } => Self::InvalidRequest(message),
      other => Self::Internal(other.to_string()),
    }
  }
}

impl IntoResponse for ServerError {
  fn into_response(self) -> Response {
    let (status, code) = match &self {
      Self::WorkflowNotFound(_) => (StatusCode::NOT_FOUND, "WORKFLOW_NOT_FOUND"),
      Self::AlreadyRegistered(_) => (StatusCode::CONFLICT, "WORKFLOW_ALREADY_REGISTERED"),
      Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
      Self::CheckpointNotFound(_) => (StatusCode::NOT_FOUND, "CHECKPOINT_NOT_FOUND"),
      Self::Store(spindle_store::Error::NotFound(_)) => {
        (StatusCode::NOT_FOUND, "EXECUTION_NOT_FOUND")
      }
      Self::Store(spindle_store::Error::InvalidTransition { .. }) => {
        (StatusCode::CONFLICT, "INVALID_TRANSITION")
      }
      Self::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
      Self::Checkpoint(CheckpointError::Encoding { .. }) => {
        (StatusCode::BAD_REQUEST, "INVALID_CHECKPOINT")
      }
      Self::Checkpoint(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CHECKPOINT_ERROR"),
      Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    };

    let body = Json(json!({
      "error": {
        "code": code,
        "message": self.to_string(),
      }
    }));

    (status, body).into_response()
  }
}

pub type ServerResult<T> = Result<T, ServerError>;
