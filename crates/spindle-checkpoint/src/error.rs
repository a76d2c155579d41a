//! Checkpoint errors.

/// Errors raised by the checkpoint tree and its transports.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
  /// A node named a parent that is not in the tree.
  #[error("parent node '{parent_id}' not found in checkpoint tree")]
  ParentNotFound { parent_id: String },

  /// An update referenced a node that is not in the tree.
  #[error("node '{node_id}' not found in checkpoint tree")]
  NodeNotFound { node_id: String },

  /// A second parentless node was added to a tree that already has a root.
  #[error("checkpoint tree already has root node '{root_id}'")]
  RootExists { root_id: String },

  /// Serializing or compressing a checkpoint failed.
  #[error("failed to encode checkpoint: {message}")]
  Encoding { message: String },

  /// Sending a checkpoint to durable storage failed.
  #[error("checkpoint transport failed: {message}")]
  Transport { message: String },
}

impl CheckpointError {
  pub(crate) fn encoding(err: impl std::fmt::Display) -> Self {
    Self::Encoding {
      message: err.to_string(),
    }
  }

  pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
    Self::Transport {
      message: err.to_string(),
    }
  }
}
