//! Suspending a run to wait for external input.
//!
//! `request_input` and `wait_for_input` each record their own checkpoint node
//! under the current node. Before the run yields, the node is marked
//! `awaitingInput` and the checkpoint is flushed, so a later run given this
//! checkpoint can pick up from the same place. Once the input has been
//! supplied the node completes with it, and a replay returns the recorded
//! payload without asking again.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use spindle_checkpoint::NewNode;
use spindle_context::ExecutionContext;
use tracing::{info, warn};
use url::Url;

use crate::error::{BoxError, EngineError};
use crate::events::ProgressEvent;
use crate::workflow_context::{RunIdentity, WORKFLOW, WorkflowExecutionContext};

/// Component name recorded for `request_input` nodes.
pub const REQUEST_INPUT: &str = "RequestInput";
/// Component name recorded for `wait_for_input` nodes.
pub const WAIT_FOR_INPUT: &str = "WaitForInput";

/// Which kind of input a suspended node waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
  /// A schema-validated payload, delivered via `/fulfill/{nodeId}`.
  Fulfill,
  /// An optional payload, delivered via `/resume/{nodeId}`.
  Resume,
}

impl InputKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Fulfill => "fulfill",
      Self::Resume => "resume",
    }
  }

  fn component_name(&self) -> &'static str {
    match self {
      Self::Fulfill => REQUEST_INPUT,
      Self::Resume => WAIT_FOR_INPUT,
    }
  }
}

/// Handed to the [`SuspendHandler`] when a node suspends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
  pub kind: InputKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub execution_id: Option<String>,
  pub node_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub schema: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub callback_url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_at: Option<DateTime<Utc>>,
}

/// Delivers external input to suspended nodes.
///
/// Both calls resolve once the input for `request.node_id` has arrived.
#[async_trait]
pub trait SuspendHandler: Send + Sync {
  async fn on_request_input(&self, request: InputRequest) -> Result<Option<Value>, BoxError>;

  async fn on_wait_for_input(&self, request: InputRequest) -> Result<Option<Value>, BoxError>;
}

/// Called with the callback URL before the run suspends.
pub type Trigger = Arc<dyn Fn(String) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Options for [`request_input`] and [`wait_for_input`].
#[derive(Clone, Default)]
pub struct SuspendOptions {
  /// Distinguishes several asks made by the same component.
  pub label: Option<String>,
  /// Advisory deadline relative to now.
  pub timeout_ms: Option<u64>,
  /// Advisory absolute deadline; wins over `timeout_ms`.
  pub timeout_at: Option<DateTime<Utc>>,
  pub trigger: Option<Trigger>,
}

impl SuspendOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_label(mut self, label: impl Into<String>) -> Self {
    self.label = Some(label.into());
    self
  }

  pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
    self.timeout_ms = Some(timeout_ms);
    self
  }

  pub fn with_timeout_at(mut self, timeout_at: DateTime<Utc>) -> Self {
    self.timeout_at = Some(timeout_at);
    self
  }

  pub fn with_trigger<F>(mut self, trigger: F) -> Self
  where
    F: Fn(String) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync + 'static,
  {
    self.trigger = Some(Arc::new(trigger));
    self
  }

  fn deadline(&self) -> Option<DateTime<Utc>> {
    self.timeout_at.or_else(|| {
      self
        .timeout_ms
        .and_then(|ms| i64::try_from(ms).ok())
        .map(|ms| Utc::now() + Duration::milliseconds(ms))
    })
  }
}

impl fmt::Debug for SuspendOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SuspendOptions")
      .field("label", &self.label)
      .field("timeout_ms", &self.timeout_ms)
      .field("timeout_at", &self.timeout_at)
      .field("has_trigger", &self.trigger.is_some())
      .finish()
  }
}

/// Suspend until a payload matching `schema` is supplied.
///
/// Returns `None` when the run has no suspend handler.
pub async fn request_input(
  schema: Value,
  options: SuspendOptions,
) -> Result<Option<Value>, EngineError> {
  suspend(InputKind::Fulfill, Some(schema), options).await
}

/// Suspend until the run is resumed, optionally with a payload.
///
/// Returns `None` when the run has no suspend handler.
pub async fn wait_for_input(options: SuspendOptions) -> Result<Option<Value>, EngineError> {
  suspend(InputKind::Resume, None, options).await
}

/// Validate `instance` against a JSON schema.
pub fn validate_schema(schema: &Value, instance: &Value) -> Result<(), EngineError> {
  let validator = jsonschema::validator_for(schema)
    .map_err(|err| EngineError::invalid_input(format!("invalid schema: {}", err)))?;
  let errors: Vec<String> = validator
    .iter_errors(instance)
    .map(|err| {
      let path = err.instance_path.to_string();
      if path.is_empty() {
        err.to_string()
      } else {
        format!("{}: {}", path, err)
      }
    })
    .collect();
  if errors.is_empty() {
    Ok(())
  } else {
    Err(EngineError::invalid_input(errors.join("; ")))
  }
}

/// `{api_base}/org/{org}/workflowExecutions/{executionId}/{fulfill|resume}/{nodeId}`
///
/// `None` unless the API base, org and execution id are all known.
pub fn callback_url(
  identity: &RunIdentity,
  execution_id: Option<&str>,
  kind: InputKind,
  node_id: &str,
) -> Option<String> {
  let api_base = identity.api_base.as_deref()?;
  let org = identity.org.as_deref()?;
  let execution_id = execution_id?;

  let mut url = Url::parse(api_base).ok()?;
  url
    .path_segments_mut()
    .ok()?
    .pop_if_empty()
    .extend([
      "org",
      org,
      "workflowExecutions",
      execution_id,
      kind.as_str(),
      node_id,
    ]);
  if let Some(verifier) = &identity.code_verifier {
    url.query_pairs_mut().append_pair("code_verifier", verifier);
  }
  Some(url.to_string())
}

async fn suspend(
  kind: InputKind,
  schema: Option<Value>,
  options: SuspendOptions,
) -> Result<Option<Value>, EngineError> {
  let ctx = ExecutionContext::current();
  let Some(workflow) = ctx.as_ref().and_then(|ctx| ctx.get(&WORKFLOW)) else {
    warn!(kind = kind.as_str(), "suspension_unsupported: not inside a run");
    return Ok(None);
  };
  let parent = ctx.as_ref().and_then(ExecutionContext::current_node);

  let mut props = Map::new();
  if let Some(schema) = &schema {
    props.insert("schema".to_string(), schema.clone());
  }
  if let Some(label) = &options.label {
    props.insert("label".to_string(), Value::String(label.clone()));
  }

  let checkpoint = workflow.checkpoint();
  let added = checkpoint
    .add_node(NewNode::new(kind.component_name(), Value::Object(props)).with_parent(parent))?;
  if let Some(prior) = added.cached {
    info!(node_id = %added.id, "input_restored_from_checkpoint");
    return Ok((!prior.is_null()).then_some(prior));
  }
  let node_id = added.id;

  workflow.notify(ProgressEvent::ComponentStart {
    node_id: node_id.clone(),
    component_name: kind.component_name().to_string(),
  });
  let result = await_input(&workflow, kind, &node_id, schema, &options).await;

  let recorded = match &result {
    Ok(payload) => checkpoint.complete_node(&node_id, payload.clone().unwrap_or(Value::Null)),
    Err(err) => checkpoint
      .set_error(&node_id, err.to_value())
      .and_then(|_| checkpoint.complete_node(&node_id, Value::Null)),
  };
  if let Err(err) = recorded {
    warn!(node_id = %node_id, error = %err, "failed_to_record_input");
  }
  workflow.notify(ProgressEvent::ComponentEnd {
    node_id,
    component_name: kind.component_name().to_string(),
  });
  result
}

async fn await_input(
  workflow: &WorkflowExecutionContext,
  kind: InputKind,
  node_id: &str,
  schema: Option<Value>,
  options: &SuspendOptions,
) -> Result<Option<Value>, EngineError> {
  let checkpoint = workflow.checkpoint();
  let Some(handler) = workflow.suspend_handler().cloned() else {
    warn!(
      node_id = %node_id,
      "suspension_unsupported: no suspend handler installed, pause/resume is unavailable"
    );
    let mut metadata = Map::new();
    metadata.insert("suspensionUnsupported".to_string(), Value::Bool(true));
    checkpoint.add_metadata(node_id, metadata)?;
    return Ok(None);
  };

  let timeout_at = options.deadline();
  let mut execution_id = workflow.execution_id();
  if execution_id.is_none() {
    // The sink assigns the id on its first acknowledgement.
    if let Err(err) = checkpoint.wait_for_pending_updates().await {
      warn!(node_id = %node_id, error = %err, "execution_id_unavailable");
    }
    execution_id = workflow.execution_id();
  }
  let callback = callback_url(workflow.identity(), execution_id.as_deref(), kind, node_id);

  let mut metadata = Map::new();
  metadata.insert("awaitingInput".to_string(), Value::Bool(true));
  if let Some(timeout_at) = timeout_at {
    metadata.insert("timeoutAt".to_string(), json!(timeout_at));
  }
  if let Some(url) = &callback {
    metadata.insert("callbackUrl".to_string(), Value::String(url.clone()));
  }
  checkpoint.add_metadata(node_id, metadata)?;

  if let Err(err) = checkpoint.wait_for_pending_updates().await {
    warn!(node_id = %node_id, error = %err, "checkpoint_not_flushed_before_suspend");
  }

  if let (Some(trigger), Some(url)) = (&options.trigger, &callback) {
    trigger(url.clone()).await.map_err(|err| EngineError::Suspension {
      message: format!("trigger failed: {}", err),
    })?;
  }

  workflow.notify(ProgressEvent::InputRequest {
    node_id: node_id.to_string(),
    callback_url: callback.clone(),
    schema: schema.clone(),
    timeout_at,
  });
  info!(node_id = %node_id, kind = kind.as_str(), "run_suspended");

  let request = InputRequest {
    kind,
    execution_id,
    node_id: node_id.to_string(),
    schema: schema.clone(),
    callback_url: callback,
    timeout_at,
  };
  let payload = match kind {
    InputKind::Fulfill => handler.on_request_input(request).await,
    InputKind::Resume => handler.on_wait_for_input(request).await,
  }
  .map_err(|err| EngineError::Suspension {
    message: err.to_string(),
  })?;

  if let (Some(schema), Some(payload)) = (&schema, &payload) {
    validate_schema(schema, payload)?;
  }

  let mut metadata = Map::new();
  metadata.insert("awaitingInput".to_string(), Value::Bool(false));
  checkpoint.add_metadata(node_id, metadata)?;
  info!(node_id = %node_id, "run_resumed");
  Ok(payload)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn identity() -> RunIdentity {
    RunIdentity {
      api_base: Some("https://api.example.com".to_string()),
      org: Some("acme".to_string()),
      execution_id: None,
      code_verifier: None,
    }
  }

  #[test]
  fn test_callback_url_shape() {
    let url = callback_url(&identity(), Some("exec-1"), InputKind::Fulfill, "RequestInput:ab");
    assert_eq!(
      url.as_deref(),
      Some("https://api.example.com/org/acme/workflowExecutions/exec-1/fulfill/RequestInput:ab")
    );
  }

  #[test]
  fn test_callback_url_carries_code_verifier() {
    let mut identity = identity();
    identity.code_verifier = Some("v 1".to_string());
    let url = callback_url(&identity, Some("e"), InputKind::Resume, "n").unwrap();
    assert!(url.ends_with("/workflowExecutions/e/resume/n?code_verifier=v+1"));
  }

  #[test]
  fn test_callback_url_needs_full_identity() {
    assert!(callback_url(&RunIdentity::default(), Some("e"), InputKind::Resume, "n").is_none());
    assert!(callback_url(&identity(), None, InputKind::Resume, "n").is_none());
  }

  #[test]
  fn test_validate_schema() {
    let schema = json!({
      "type": "object",
      "properties": { "approved": { "type": "boolean" } },
      "required": ["approved"],
    });
    assert!(validate_schema(&schema, &json!({ "approved": true })).is_ok());
    assert!(matches!(
      validate_schema(&schema, &json!({ "approved": "yes" })),
      Err(EngineError::InvalidInput { .. })
    ));
  }

  #[test]
  fn test_deadline_prefers_absolute_time() {
    let at = Utc::now() + Duration::hours(1);
    let options = SuspendOptions::new().with_timeout_ms(5).with_timeout_at(at);
    assert_eq!(options.deadline(), Some(at));
    assert!(SuspendOptions::new().deadline().is_none());
  }

  #[tokio::test]
  async fn test_outside_a_run_returns_none() {
    let payload = wait_for_input(SuspendOptions::new()).await.unwrap();
    assert!(payload.is_none());
  }
}
