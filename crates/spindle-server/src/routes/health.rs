//! GET /health - liveness probe

use axum::{Json, response::IntoResponse};
use serde_json::json;
use std::sync::Arc;

use crate::state::AppState;

pub async fn health() -> impl IntoResponse {
  Json(json!({ "status": "ok" }))
}

pub fn health_router() -> axum::Router<Arc<AppState>> {
  use axum::routing::get;
  axum::Router::new().route("/health", get(health))
}
