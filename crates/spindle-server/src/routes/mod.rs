//! HTTP surface of the orchestration server.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness probe |
//! | `GET`  | `/workflows` | Registered workflows |
//! | `GET`  | `/workflows/{name}` | One workflow and its schemas |
//! | `POST` | `/workflows/{name}` | Run and wait: JSON, ndjson progress or plain-text output by `Accept` |
//! | `POST` | `/workflows/{name}/start` | Start and return the execution id |
//! | `GET`  | `/workflowExecutions` | Executions, newest first |
//! | `GET`  | `/workflowExecutions/{id}` | Execution record and waiting nodes |
//! | `GET`  | `/workflowExecutions/{id}/progress` | ndjson message log, live until the end |
//! | `GET`  | `/workflowExecutions/{id}/checkpoint` | Latest checkpoint tree |
//! | `POST` | `/workflowExecutions/{id}/fulfill/{nodeId}` | Deliver a payload to a suspended node |
//! | `POST` | `/workflowExecutions/{id}/resume/{nodeId}` | Resume a suspended node |
//! | `POST` | `/org/{org}/workflowExecutions` | Ingest a first checkpoint |
//! | `PUT`  | `/org/{org}/workflowExecutions/{id}` | Ingest a checkpoint update |
//!
//! The fulfill and resume routes are also mounted under `/org/{org}`, the
//! shape of the callback URLs handed to suspended nodes.

mod checkpoints;
mod executions;
mod health;
mod workflows;

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde_json::{Value, json};
use spindle_store::{ExecutionRecord, StoredMessage};

use crate::error::{ServerError, ServerResult};
use crate::state::AppState;

pub const EXECUTION_ID_HEADER: &str = "x-execution-id";
pub const NDJSON: &str = "application/x-ndjson";

pub fn router(state: Arc<AppState>) -> Router {
  Router::new()
    .merge(health::health_router())
    .merge(workflows::workflows_router())
    .merge(executions::executions_router())
    .merge(checkpoints::checkpoints_router())
    .with_state(state)
}

/// The body as JSON; an empty body is `default`.
fn parse_json(body: &Bytes, default: Option<Value>) -> ServerResult<Option<Value>> {
  if body.iter().all(u8::is_ascii_whitespace) {
    return Ok(default);
  }
  serde_json::from_slice(body)
    .map(Some)
    .map_err(|err| ServerError::InvalidRequest(format!("body is not valid JSON: {}", err)))
}

fn accepts(headers: &HeaderMap, mime: &str) -> bool {
  headers
    .get_all(header::ACCEPT)
    .iter()
    .filter_map(|value| value.to_str().ok())
    .any(|value| value.split(',').any(|part| part.trim().starts_with(mime)))
}

fn with_execution_id(mut response: Response, execution_id: &str) -> ServerResult<Response> {
  let value = HeaderValue::from_str(execution_id)
    .map_err(|err| ServerError::Internal(format!("bad execution id header: {}", err)))?;
  response.headers_mut().insert(EXECUTION_ID_HEADER, value);
  Ok(response)
}

fn ndjson_response(messages: BoxStream<'static, StoredMessage>) -> Response {
  let lines = messages.map(|message| Ok::<_, Infallible>(Bytes::from(format!("{}\n", message.message.0))));
  (
    StatusCode::OK,
    [(header::CONTENT_TYPE, NDJSON)],
    Body::from_stream(lines),
  )
    .into_response()
}

fn execution_json(record: &ExecutionRecord, waiting: &[String]) -> Value {
  let mut body = json!({
    "executionId": record.execution_id,
    "workflowName": record.workflow_name,
    "executionStatus": record.status.as_str(),
    "input": record.input.0,
    "createdAt": record.created_at,
    "updatedAt": record.updated_at,
  });
  if let Some(output) = &record.output {
    body["output"] = output.0.clone();
  }
  if let Some(error) = &record.error {
    body["error"] = Value::String(error.clone());
  }
  if !waiting.is_empty() {
    body["waitingNodes"] = json!(waiting);
  }
  body
}
