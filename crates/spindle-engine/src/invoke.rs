//! The component invocation protocol.
//!
//! For every invocation:
//!
//! 1. props must be a JSON object
//! 2. find the run context and the parent node (or start a standalone run)
//! 3. merge call-site options over the component's defaults
//! 4. add a checkpoint node, or restore it from the prior run
//! 5. run the body with the new node as the current node, resolve its result
//! 6. on success complete the node with the output
//! 7. on failure record the error, complete the node with `null`, re-raise

use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::{Map, Value};
use spindle_checkpoint::NewNode;
use spindle_context::{CURRENT_NODE, ExecutionContext, Scope};
use tracing::{debug, warn};

use crate::component::{Component, Invocation, StreamComponent, StreamMode, Target};
use crate::error::{BoxError, EngineError, serialize_error};
use crate::events::ProgressEvent;
use crate::resolve::resolve;
use crate::value::{Aggregator, ComponentStream, Output, Resolvable, StreamingResult};
use crate::workflow_context::{WORKFLOW, WorkflowExecutionContext};

/// Output recorded on a streaming node until its stream ends.
pub const IN_PROGRESS: &str = "[in progress]";

/// Invoke a component and resolve its output.
pub async fn invoke(component: &Arc<dyn Component>, props: Value) -> Result<Value, EngineError> {
  Invocation::new(component.clone(), props).value().await
}

/// Invoke a streaming component and return its live, checkpointed stream.
pub async fn stream(
  component: &Arc<dyn StreamComponent>,
  props: Value,
) -> Result<StreamingResult, EngineError> {
  match Invocation::stream(component.clone(), props).run().await? {
    Output::Stream(stream) => Ok(stream),
    Output::Value(value) => Ok(StreamingResult::replay(value)),
  }
}

/// Invoke a streaming component, drain it and return the aggregate.
pub async fn invoke_buffered(
  component: &Arc<dyn StreamComponent>,
  props: Value,
) -> Result<Value, EngineError> {
  Invocation::stream(component.clone(), props)
    .buffered()
    .value()
    .await
}

pub(crate) async fn execute(invocation: Invocation) -> Result<Resolvable, EngineError> {
  if !invocation.props.is_object() {
    return Err(EngineError::invalid_input(format!(
      "props for '{}' must be a JSON object",
      invocation.name()
    )));
  }

  let current = ExecutionContext::current();
  if let Some(ctx) = &current {
    if let Some(workflow) = ctx.get(&WORKFLOW) {
      return execute_in(ctx.clone(), workflow, invocation).await;
    }
  }

  let workflow = WorkflowExecutionContext::standalone(invocation.name());
  let ctx = current
    .unwrap_or_else(ExecutionContext::root)
    .derive(Scope::new().with(&WORKFLOW, workflow.clone()));
  debug!(component = %invocation.name(), "standalone_invocation");
  ctx.clone().scope(execute_in(ctx, workflow, invocation)).await
}

async fn execute_in(
  ctx: ExecutionContext,
  workflow: WorkflowExecutionContext,
  invocation: Invocation,
) -> Result<Resolvable, EngineError> {
  let Invocation {
    target,
    props,
    options,
  } = invocation;
  let options = target.options().merge(&options);
  let name = options
    .name
    .clone()
    .unwrap_or_else(|| target.name().to_string());

  let added = workflow.checkpoint().add_node(
    NewNode::new(name.clone(), props.clone())
      .with_parent(ctx.current_node())
      .with_metadata(options.metadata)
      .with_secret_keys(options.secret_props),
  )?;

  if let Some(output) = added.cached {
    debug!(node_id = %added.id, component = %name, "component_restored");
    return Ok(match target {
      Target::Stream(_, StreamMode::Stream) => Resolvable::Stream(StreamingResult::replay(output)),
      _ => Resolvable::Value(output),
    });
  }

  let node = NodeScope {
    workflow,
    node_id: added.id,
    component: name,
  };
  node.start();
  let body_ctx = ctx.derive(Scope::new().with(&CURRENT_NODE, Some(node.node_id.clone())));

  match target {
    Target::Component(component) => {
      let (component_name, node_id) = (node.component.clone(), node.node_id.clone());
      let result = body_ctx
        .scope(async move {
          let value = component
            .run(props)
            .await
            .map_err(|err| EngineError::from_boxed(err, &component_name, &node_id))?;
          resolve(value).await
        })
        .await;
      node.finish(result).map(Resolvable::Value)
    }
    Target::Stream(component, mode) => {
      let stream = match body_ctx.clone().scope(component.run(props)).await {
        Ok(stream) => stream,
        Err(err) => {
          let err = EngineError::from_boxed(err, &node.component, &node.node_id);
          return node.finish(Err(err)).map(Resolvable::Value);
        }
      };

      match mode {
        StreamMode::Buffer => {
          let result = body_ctx
            .scope(stream.collect())
            .await
            .map_err(|err| EngineError::from_boxed(err, &node.component, &node.node_id));
          node.finish(result).map(Resolvable::Value)
        }
        StreamMode::Stream => {
          node
            .workflow
            .checkpoint()
            .update_node(&node.node_id, Value::String(IN_PROGRESS.to_string()))?;
          Ok(Resolvable::Stream(CheckpointedStream::wrap(
            stream, node, body_ctx,
          )))
        }
      }
    }
  }
}

/// The node of one running invocation.
struct NodeScope {
  workflow: WorkflowExecutionContext,
  node_id: String,
  component: String,
}

impl NodeScope {
  fn start(&self) {
    debug!(node_id = %self.node_id, component = %self.component, "component_started");
    self.workflow.notify(ProgressEvent::ComponentStart {
      node_id: self.node_id.clone(),
      component_name: self.component.clone(),
    });
  }

  fn end(&self) {
    self.workflow.notify(ProgressEvent::ComponentEnd {
      node_id: self.node_id.clone(),
      component_name: self.component.clone(),
    });
  }

  fn finish(&self, result: Result<Value, EngineError>) -> Result<Value, EngineError> {
    let checkpoint = self.workflow.checkpoint();
    match result {
      Ok(output) => {
        checkpoint.complete_node(&self.node_id, output.clone())?;
        debug!(node_id = %self.node_id, component = %self.component, "component_completed");
        self.end();
        Ok(output)
      }
      Err(err) => {
        warn!(
          node_id = %self.node_id,
          component = %self.component,
          error = %err,
          "component_failed"
        );
        let recorded = checkpoint
          .set_error(&self.node_id, err.to_value())
          .and_then(|_| checkpoint.complete_node(&self.node_id, Value::Null));
        if let Err(checkpoint_err) = recorded {
          warn!(node_id = %self.node_id, error = %checkpoint_err, "failed_to_record_error");
        }
        self.end();
        Err(err)
      }
    }
  }
}

/// Forwards fragments unchanged while keeping the node's partial output
/// current.
struct CheckpointedStream {
  inner: ComponentStream,
  aggregator: Aggregator,
  fragments: Vec<String>,
  node: NodeScope,
  ctx: ExecutionContext,
  finished: bool,
}

impl CheckpointedStream {
  fn wrap(stream: StreamingResult, node: NodeScope, ctx: ExecutionContext) -> StreamingResult {
    let (inner, aggregator) = stream.into_parts();
    let wrapped = Self {
      inner,
      aggregator: aggregator.clone(),
      fragments: Vec::new(),
      node,
      ctx,
      finished: false,
    };
    StreamingResult::from_parts(Box::pin(wrapped), aggregator)
  }

  fn finish(&mut self, error: Option<&(dyn StdError + 'static)>, completed: bool) {
    self.finished = true;
    let checkpoint = self.node.workflow.checkpoint();
    let id = &self.node.node_id;
    let aggregate = (self.aggregator)(&self.fragments);

    let mut metadata = Map::new();
    metadata.insert("streamCompleted".to_string(), Value::Bool(completed));
    let recorded = match error {
      Some(err) => checkpoint.set_error(id, serialize_error(err)),
      None => Ok(()),
    }
    .and_then(|_| checkpoint.add_metadata(id, metadata))
    .and_then(|_| checkpoint.complete_node(id, aggregate));
    if let Err(err) = recorded {
      warn!(node_id = %id, error = %err, "failed_to_record_stream_end");
    }
    self.node.end();
  }
}

impl Stream for CheckpointedStream {
  type Item = Result<String, BoxError>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.get_mut();
    if this.finished {
      return Poll::Ready(None);
    }

    let ctx = this.ctx.clone();
    let inner = &mut this.inner;
    match ctx.sync_scope(|| inner.as_mut().poll_next(cx)) {
      Poll::Pending => Poll::Pending,
      Poll::Ready(Some(Ok(fragment))) => {
        this.fragments.push(fragment.clone());
        let partial = (this.aggregator)(&this.fragments);
        if let Err(err) = this
          .node
          .workflow
          .checkpoint()
          .update_node(&this.node.node_id, partial)
        {
          warn!(node_id = %this.node.node_id, error = %err, "failed_to_record_fragment");
        }
        Poll::Ready(Some(Ok(fragment)))
      }
      Poll::Ready(Some(Err(err))) => {
        let source: &(dyn StdError + 'static) = &*err;
        this.finish(Some(source), true);
        Poll::Ready(Some(Err(err)))
      }
      Poll::Ready(None) => {
        this.finish(None, true);
        Poll::Ready(None)
      }
    }
  }
}

impl Drop for CheckpointedStream {
  fn drop(&mut self) {
    // Consumer went away before the end of the stream.
    if !self.finished {
      self.finish(None, false);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::component::{component, stream_component};
  use futures::StreamExt;
  use serde_json::json;

  #[tokio::test]
  async fn test_non_object_props_are_rejected() {
    let echo = component("Echo", |props: Value| async move { Ok::<_, BoxError>(props) });
    let err = invoke(&echo, json!("nope")).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput { .. }));
  }

  #[tokio::test]
  async fn test_standalone_invocation_records_a_root() {
    let probe = component("Probe", |_props: Value| async move {
      let workflow = WorkflowExecutionContext::current().ok_or("no run context")?;
      let current = ExecutionContext::current().and_then(|ctx| ctx.current_node());
      let tree = workflow.checkpoint().snapshot().ok_or("no tree")?;
      Ok::<_, BoxError>(json!({ "root": tree.id, "current": current }))
    });

    let out = invoke(&probe, json!({})).await.unwrap();
    assert_eq!(out["root"], out["current"]);
  }

  #[tokio::test]
  async fn test_failure_is_recorded_and_reraised() {
    let failing = component("Failing", |_props: Value| async move {
      Err::<Value, BoxError>("exploded".into())
    });
    let err = invoke(&failing, json!({})).await.unwrap_err();
    assert!(matches!(err, EngineError::ComponentFailure { .. }));
    assert!(err.to_string().contains("exploded"));
  }

  #[tokio::test]
  async fn test_stream_forwards_fragments_unchanged() {
    let letters = stream_component("Letters", |_props: Value| async move {
      Ok::<_, BoxError>(StreamingResult::from_fragments(["a", "b", "c"]))
    });
    let fragments: Vec<String> = stream(&letters, json!({}))
      .await
      .unwrap()
      .map(|fragment| fragment.unwrap())
      .collect()
      .await;
    assert_eq!(fragments, vec!["a", "b", "c"]);
  }

  #[tokio::test]
  async fn test_buffered_stream_returns_aggregate() {
    let letters = stream_component("Letters", |_props: Value| async move {
      Ok::<_, BoxError>(StreamingResult::from_fragments(["x", "y"]))
    });
    assert_eq!(invoke_buffered(&letters, json!({})).await.unwrap(), json!("xy"));
  }
}
