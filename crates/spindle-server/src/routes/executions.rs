//! Execution queries and input delivery
//!
//! POST /workflowExecutions/{id}/fulfill/{nodeId} - payload required, checked
//!   against the waiting node's schema
//! POST /workflowExecutions/{id}/resume/{nodeId}  - payload optional

use std::sync::Arc;

use axum::{
  Json,
  extract::{Path, Query, State},
  response::Response,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{execution_json, ndjson_response, parse_json};
use crate::error::{ServerError, ServerResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
  pub workflow: Option<String>,
}

/// GET /workflowExecutions
pub async fn list_executions(
  State(state): State<Arc<AppState>>,
  Query(query): Query<ListQuery>,
) -> ServerResult<Json<Value>> {
  let records = state
    .orchestrator
    .executions(query.workflow.as_deref())
    .await?;
  let executions: Vec<Value> = records
    .iter()
    .map(|record| execution_json(record, &[]))
    .collect();
  Ok(Json(json!({ "executions": executions })))
}

/// GET /workflowExecutions/{id}
pub async fn get_execution(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
) -> ServerResult<Json<Value>> {
  let record = state.orchestrator.execution(&id).await?;
  let waiting = state.orchestrator.waiting_nodes(&id);
  Ok(Json(execution_json(&record, &waiting)))
}

/// GET /workflowExecutions/{id}/progress
pub async fn progress(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
) -> ServerResult<Response> {
  Ok(ndjson_response(state.orchestrator.progress(&id).await?))
}

/// GET /workflowExecutions/{id}/checkpoint
pub async fn get_checkpoint(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
) -> ServerResult<Json<Value>> {
  state
    .orchestrator
    .checkpoint(&id)
    .await?
    .map(Json)
    .ok_or(ServerError::CheckpointNotFound(id))
}

async fn deliver(
  state: &AppState,
  id: &str,
  node_id: &str,
  payload: Option<Value>,
) -> ServerResult<Json<Value>> {
  let outcome = state.orchestrator.fulfill(id, node_id, payload).await?;
  Ok(Json(json!({
    "executionId": id,
    "nodeId": node_id,
    "outcome": outcome,
  })))
}

/// POST /workflowExecutions/{id}/fulfill/{nodeId}
pub async fn fulfill(
  State(state): State<Arc<AppState>>,
  Path((id, node_id)): Path<(String, String)>,
  body: Bytes,
) -> ServerResult<Json<Value>> {
  let payload = parse_json(&body, None)?
    .ok_or_else(|| ServerError::InvalidRequest("fulfillment requires a JSON payload".to_string()))?;
  deliver(&state, &id, &node_id, Some(payload)).await
}

/// POST /workflowExecutions/{id}/resume/{nodeId}
pub async fn resume(
  State(state): State<Arc<AppState>>,
  Path((id, node_id)): Path<(String, String)>,
  body: Bytes,
) -> ServerResult<Json<Value>> {
  let payload = parse_json(&body, None)?;
  deliver(&state, &id, &node_id, payload).await
}

/// POST /org/{org}/workflowExecutions/{id}/fulfill/{nodeId}
pub async fn org_fulfill(
  state: State<Arc<AppState>>,
  Path((org, id, node_id)): Path<(String, String, String)>,
  body: Bytes,
) -> ServerResult<Json<Value>> {
  debug!(org = %org, execution_id = %id, "org_scoped_fulfill");
  fulfill(state, Path((id, node_id)), body).await
}

/// POST /org/{org}/workflowExecutions/{id}/resume/{nodeId}
pub async fn org_resume(
  state: State<Arc<AppState>>,
  Path((org, id, node_id)): Path<(String, String, String)>,
  body: Bytes,
) -> ServerResult<Json<Value>> {
  debug!(org = %org, execution_id = %id, "org_scoped_resume");
  resume(state, Path((id, node_id)), body).await
}

pub fn executions_router() -> axum::Router<Arc<AppState>> {
  use axum::routing::{get, post};
  axum::Router::new()
    .route("/workflowExecutions", get(list_executions))
    .route("/workflowExecutions/{id}", get(get_execution))
    .route("/workflowExecutions/{id}/progress", get(progress))
    .route("/workflowExecutions/{id}/checkpoint", get(get_checkpoint))
    .route("/workflowExecutions/{id}/fulfill/{node_id}", post(fulfill))
    .route("/workflowExecutions/{id}/resume/{node_id}", post(resume))
    .route(
      "/org/{org}/workflowExecutions/{id}/fulfill/{node_id}",
      post(org_fulfill),
    )
    .route(
      "/org/{org}/workflowExecutions/{id}/resume/{node_id}",
      post(org_resume),
    )
}
