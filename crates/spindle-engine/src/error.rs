//! Engine error types.

use serde_json::{Value, json};
use spindle_checkpoint::CheckpointError;

/// Boxed error returned by component bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while running components.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// Props were not an object, or a payload failed schema validation.
  #[error("invalid input: {message}")]
  InvalidInput { message: String },

  /// A component body failed.
  #[error("component '{component}' failed: {source}")]
  ComponentFailure {
    component: String,
    node_id: String,
    #[source]
    source: BoxError,
  },

  /// An awaited value or stream failed outside any component body.
  #[error("failed to resolve value: {source}")]
  Resolve {
    #[source]
    source: BoxError,
  },

  /// The checkpoint tree rejected an operation.
  #[error(transparent)]
  Checkpoint(#[from] CheckpointError),

  /// A spawned resolution task panicked or was cancelled.
  #[error("task failed: {message}")]
  Task { message: String },

  /// A suspended run could not be resumed.
  #[error("suspension failed: {message}")]
  Suspension { message: String },
}

impl EngineError {
  pub fn invalid_input(message: impl Into<String>) -> Self {
    Self::InvalidInput {
      message: message.into(),
    }
  }

  /// Recover an `EngineError` from a boxed error, wrapping anything else as a
  /// failure of `component`.
  ///
  /// Errors raised by nested components pass through unchanged, so the top
  /// level sees the innermost failure.
  pub fn from_boxed(err: BoxError, component: &str, node_id: &str) -> Self {
    match err.downcast::<EngineError>() {
      Ok(engine) => *engine,
      Err(source) => Self::ComponentFailure {
        component: component.to_string(),
        node_id: node_id.to_string(),
        source,
      },
    }
  }

  /// Like [`EngineError::from_boxed`] for failures that belong to no
  /// component.
  pub fn from_resolve(err: BoxError) -> Self {
    match err.downcast::<EngineError>() {
      Ok(engine) => *engine,
      Err(source) => Self::Resolve { source },
    }
  }

  /// The error as recorded on a checkpoint node: `{message, sources[]}`.
  pub fn to_value(&self) -> Value {
    serialize_error(self)
  }
}

/// Serialize an error chain as `{message, sources[]}`.
pub fn serialize_error(err: &(dyn std::error::Error + 'static)) -> Value {
  let mut sources = Vec::new();
  let mut next = err.source();
  while let Some(source) = next {
    sources.push(Value::String(source.to_string()));
    next = source.source();
  }
  json!({ "message": err.to_string(), "sources": sources })
}
