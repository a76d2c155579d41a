//! Checkpoint ingestion over the wire protocol
//!
//! POST /org/{org}/workflowExecutions      - first checkpoint, assigns the id
//! PUT  /org/{org}/workflowExecutions/{id} - later checkpoints
//!
//! Bodies are `{workflowName, rawExecution, executionId?}`, gzip-compressed
//! when `Content-Encoding: gzip` is set.

use std::sync::Arc;

use axum::{
  Json,
  extract::{Path, State},
  http::{HeaderMap, header},
};
use bytes::Bytes;
use spindle_checkpoint::{CheckpointReceipt, WireCheckpoint};
use tracing::debug;

use crate::error::ServerResult;
use crate::state::AppState;

fn is_gzip(headers: &HeaderMap) -> bool {
  headers
    .get(header::CONTENT_ENCODING)
    .and_then(|value| value.to_str().ok())
    .is_some_and(|value| value.eq_ignore_ascii_case("gzip"))
}

/// POST /org/{org}/workflowExecutions
pub async fn create_checkpoint(
  State(state): State<Arc<AppState>>,
  Path(org): Path<String>,
  headers: HeaderMap,
  body: Bytes,
) -> ServerResult<Json<CheckpointReceipt>> {
  let wire = WireCheckpoint::from_body(&body, is_gzip(&headers))?;
  let receipt = state.orchestrator.ingest_checkpoint(wire, None).await?;
  debug!(org = %org, execution_id = %receipt.execution_id, "checkpoint_created");
  Ok(Json(receipt))
}

/// PUT /org/{org}/workflowExecutions/{id}
pub async fn update_checkpoint(
  State(state): State<Arc<AppState>>,
  Path((org, id)): Path<(String, String)>,
  headers: HeaderMap,
  body: Bytes,
) -> ServerResult<Json<CheckpointReceipt>> {
  let wire = WireCheckpoint::from_body(&body, is_gzip(&headers))?;
  let receipt = state.orchestrator.ingest_checkpoint(wire, Some(id)).await?;
  debug!(org = %org, execution_id = %receipt.execution_id, "checkpoint_updated");
  Ok(Json(receipt))
}

pub fn checkpoints_router() -> axum::Router<Arc<AppState>> {
  use axum::routing::{post, put};
  axum::Router::new()
    .route("/org/{org}/workflowExecutions", post(create_checkpoint))
    .route("/org/{org}/workflowExecutions/{id}", put(update_checkpoint))
}
