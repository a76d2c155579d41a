//! Checkpoint wire format.
//!
//! A transmitted checkpoint is a gzip-compressed JSON body:
//!
//! ```text
//! { "workflowName": "...", "rawExecution": "<base64(gzip(json(ExecutionNode)))>", "executionId": "..." }
//! ```
//!
//! and the storage endpoint answers with a [`CheckpointReceipt`].

use std::io::{Read, Write};

use base64::{Engine, engine::general_purpose::STANDARD};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;
use crate::node::ExecutionNode;
use crate::sink::CheckpointBatch;

/// Body of a checkpoint transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCheckpoint {
  pub workflow_name: String,
  pub raw_execution: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub execution_id: Option<String>,
}

/// Acknowledgement returned by checkpoint storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointReceipt {
  pub execution_id: String,
  pub trace_id: String,
  pub workflow_name: String,
}

impl WireCheckpoint {
  /// Encode a batch for transmission.
  pub fn from_batch(batch: &CheckpointBatch) -> Result<Self, CheckpointError> {
    Ok(Self {
      workflow_name: batch.workflow_name.clone(),
      raw_execution: encode_execution(&batch.tree)?,
      execution_id: batch.execution_id.clone(),
    })
  }

  /// Decode the carried execution tree.
  pub fn tree(&self) -> Result<ExecutionNode, CheckpointError> {
    decode_execution(&self.raw_execution)
  }

  /// Serialize and gzip the whole body.
  pub fn to_body(&self) -> Result<Vec<u8>, CheckpointError> {
    let json = serde_json::to_vec(self).map_err(CheckpointError::encoding)?;
    gzip(&json)
  }

  /// Parse a body, gunzipping it first when `compressed` is set.
  pub fn from_body(bytes: &[u8], compressed: bool) -> Result<Self, CheckpointError> {
    let json = if compressed {
      gunzip(bytes)?
    } else {
      bytes.to_vec()
    };
    serde_json::from_slice(&json).map_err(CheckpointError::encoding)
  }
}

/// `base64(gzip(json(tree)))`
pub fn encode_execution(tree: &ExecutionNode) -> Result<String, CheckpointError> {
  let json = serde_json::to_vec(tree).map_err(CheckpointError::encoding)?;
  Ok(STANDARD.encode(gzip(&json)?))
}

/// Inverse of [`encode_execution`].
pub fn decode_execution(raw: &str) -> Result<ExecutionNode, CheckpointError> {
  let compressed = STANDARD.decode(raw).map_err(CheckpointError::encoding)?;
  let json = gunzip(&compressed)?;
  serde_json::from_slice(&json).map_err(CheckpointError::encoding)
}

pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>, CheckpointError> {
  let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
  encoder.write_all(bytes).map_err(CheckpointError::encoding)?;
  encoder.finish().map_err(CheckpointError::encoding)
}

pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, CheckpointError> {
  let mut decoder = GzDecoder::new(bytes);
  let mut out = Vec::new();
  decoder
    .read_to_end(&mut out)
    .map_err(CheckpointError::encoding)?;
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use serde_json::{Map, json};

  fn tree() -> ExecutionNode {
    ExecutionNode {
      id: "Root:abc".to_string(),
      component_name: "Root".to_string(),
      parent_id: None,
      start_time: Utc::now(),
      end_time: None,
      props: json!({ "input": "value" }),
      output: None,
      children: vec![],
      metadata: Map::new(),
      error: None,
    }
  }

  #[test]
  fn test_batch_survives_transport_encoding() {
    let batch = CheckpointBatch {
      workflow_name: "wf".to_string(),
      execution_id: Some("exec-1".to_string()),
      tree: tree(),
    };

    let body = WireCheckpoint::from_batch(&batch).unwrap().to_body().unwrap();
    let decoded = WireCheckpoint::from_body(&body, true).unwrap();

    assert_eq!(decoded.workflow_name, "wf");
    assert_eq!(decoded.execution_id.as_deref(), Some("exec-1"));
    assert_eq!(decoded.tree().unwrap(), batch.tree);
  }

  #[test]
  fn test_wire_field_names() {
    let wire = WireCheckpoint {
      workflow_name: "wf".to_string(),
      raw_execution: "abc".to_string(),
      execution_id: None,
    };
    let value = serde_json::to_value(&wire).unwrap();

    assert_eq!(value, json!({ "workflowName": "wf", "rawExecution": "abc" }));
  }

  #[test]
  fn test_decode_rejects_garbage() {
    assert!(matches!(
      decode_execution("not base64!"),
      Err(CheckpointError::Encoding { .. })
    ));
  }
}
