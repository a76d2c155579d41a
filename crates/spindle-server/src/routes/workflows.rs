//! Workflow listing and run endpoints
//!
//! POST /workflows/{name}        - run; the response shape follows `Accept`
//! POST /workflows/{name}/start  - start and return `{executionId}` at once

use std::io;
use std::sync::Arc;

use axum::{
  Json,
  body::Body,
  extract::{Path, State},
  http::{HeaderMap, StatusCode, header},
  response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{NDJSON, accepts, execution_json, ndjson_response, parse_json, with_execution_id};
use crate::error::{ServerError, ServerResult};
use crate::state::AppState;

/// GET /workflows
pub async fn list_workflows(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  let workflows: Vec<Value> = state
    .orchestrator
    .registry()
    .list()
    .iter()
    .map(|workflow| workflow.describe())
    .collect();
  Json(json!({ "workflows": workflows }))
}

/// GET /workflows/{name}
pub async fn get_workflow(
  State(state): State<Arc<AppState>>,
  Path(name): Path<String>,
) -> ServerResult<Json<Value>> {
  let workflow = state
    .orchestrator
    .registry()
    .get(&name)
    .ok_or(ServerError::WorkflowNotFound(name))?;
  Ok(Json(workflow.describe()))
}

/// POST /workflows/{name}
///
/// - `Accept: application/x-ndjson`: the execution's message log as it grows
/// - `Accept: text/plain`: the root's output fragments as they are produced
/// - otherwise: wait and return `{executionId, executionStatus, output|error}`
pub async fn run_workflow(
  State(state): State<Arc<AppState>>,
  Path(name): Path<String>,
  headers: HeaderMap,
  body: Bytes,
) -> ServerResult<Response> {
  let input = parse_json(&body, Some(json!({})))?.unwrap_or_else(|| json!({}));
  let handle = state.orchestrator.start(&name, input).await?;
  let execution_id = handle.execution_id.clone();

  let response = if accepts(&headers, NDJSON) {
    ndjson_response(state.orchestrator.progress(&execution_id).await?)
  } else if accepts(&headers, "text/plain") {
    let chunks = UnboundedReceiverStream::new(handle.fragments).map(|fragment| match fragment {
      Ok(fragment) => Ok(Bytes::from(fragment)),
      // Aborts the body so the client sees the stream did not complete.
      Err(message) => Err(io::Error::other(message)),
    });
    (
      StatusCode::OK,
      [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
      Body::from_stream(chunks),
    )
      .into_response()
  } else {
    let record = handle.wait().await?;
    Json(execution_json(&record, &[])).into_response()
  };

  with_execution_id(response, &execution_id)
}

/// POST /workflows/{name}/start
pub async fn start_workflow(
  State(state): State<Arc<AppState>>,
  Path(name): Path<String>,
  body: Bytes,
) -> ServerResult<Response> {
  let input = parse_json(&body, Some(json!({})))?.unwrap_or_else(|| json!({}));
  let handle = state.orchestrator.start(&name, input).await?;
  let response = (
    StatusCode::ACCEPTED,
    Json(json!({ "executionId": handle.execution_id })),
  )
    .into_response();
  with_execution_id(response, &handle.execution_id)
}

pub fn workflows_router() -> axum::Router<Arc<AppState>> {
  use axum::routing::{get, post};
  axum::Router::new()
    .route("/workflows", get(list_workflows))
    .route("/workflows/{name}", get(get_workflow).post(run_workflow))
    .route("/workflows/{name}/start", post(start_workflow))
}
