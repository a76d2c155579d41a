//! Top-level workflow runs.
//!
//! A [`Workflow`] names a root component. Running it creates the run's
//! checkpoint manager and [`WorkflowExecutionContext`], invokes the root inside
//! a fresh context, reports progress, and flushes the checkpoint before
//! returning.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use spindle_checkpoint::{
  CheckpointConfig, CheckpointManager, CheckpointReceipt, CheckpointSink, ExecutionNode, NoopSink,
  ReplayMode,
};
use spindle_context::{CURRENT_NODE, ExecutionContext, Scope};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, instrument, warn};

use crate::component::{Component, Invocation, StreamComponent};
use crate::error::EngineError;
use crate::events::{NoopNotifier, ProgressEvent, ProgressNotifier};
use crate::suspend::SuspendHandler;
use crate::value::Output;
use crate::workflow_context::{RunIdentity, WORKFLOW, WorkflowExecutionContext};

#[derive(Clone)]
enum Root {
  Component(Arc<dyn Component>),
  Stream(Arc<dyn StreamComponent>),
}

/// A named root component.
#[derive(Clone)]
pub struct Workflow {
  name: String,
  root: Root,
}

/// Options for a single run.
#[derive(Clone)]
pub struct RunOptions {
  /// Execution id to record under; assigned by the sink when absent.
  pub execution_id: Option<String>,
  pub sink: Arc<dyn CheckpointSink>,
  /// Checkpoint tree of an earlier attempt of this execution.
  pub prior: Option<ExecutionNode>,
  pub replay: ReplayMode,
  pub notifier: Arc<dyn ProgressNotifier>,
  pub suspend: Option<Arc<dyn SuspendHandler>>,
  pub identity: RunIdentity,
  /// Ambient entries made available to every component of the run.
  pub scope: Scope,
}

impl Default for RunOptions {
  fn default() -> Self {
    Self {
      execution_id: None,
      sink: Arc::new(NoopSink),
      prior: None,
      replay: ReplayMode::default(),
      notifier: Arc::new(NoopNotifier),
      suspend: None,
      identity: RunIdentity::default(),
      scope: Scope::new(),
    }
  }
}

impl RunOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
    self.execution_id = Some(execution_id.into());
    self
  }

  pub fn with_sink(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
    self.sink = sink;
    self
  }

  pub fn with_prior(mut self, prior: Option<ExecutionNode>) -> Self {
    self.prior = prior;
    self
  }

  pub fn with_replay(mut self, replay: ReplayMode) -> Self {
    self.replay = replay;
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ProgressNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn with_suspend_handler(mut self, handler: Arc<dyn SuspendHandler>) -> Self {
    self.suspend = Some(handler);
    self
  }

  pub fn with_identity(mut self, identity: RunIdentity) -> Self {
    self.identity = identity;
    self
  }

  pub fn with_scope(mut self, scope: Scope) -> Self {
    self.scope = scope;
    self
  }
}

/// The result of a finished run.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
  pub execution_id: String,
  pub output: Value,
  /// The final checkpoint tree.
  pub checkpoint: Option<ExecutionNode>,
  /// Receipt of the last acknowledged checkpoint transmission.
  pub receipt: Option<CheckpointReceipt>,
}

/// Live output of [`Workflow::run_stream`].
///
/// Yields the root's fragments as they are produced; [`WorkflowStream::finish`]
/// returns the run result once the stream has been drained.
pub struct WorkflowStream {
  execution_id: String,
  fragments: BoxStream<'static, Result<String, String>>,
  outcome: oneshot::Receiver<Result<WorkflowRun, EngineError>>,
}

impl WorkflowStream {
  pub fn execution_id(&self) -> &str {
    &self.execution_id
  }

  /// Drain any remaining fragments and wait for the run result.
  pub async fn finish(mut self) -> Result<WorkflowRun, EngineError> {
    while self.fragments.next().await.is_some() {}
    self.outcome.await.map_err(|_| EngineError::Task {
      message: "workflow run task ended without a result".to_string(),
    })?
  }
}

impl Stream for WorkflowStream {
  /// A fragment, or the failure message that ended the stream.
  type Item = Result<String, String>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.fragments.as_mut().poll_next(cx)
  }
}

struct Prepared {
  execution_id: String,
  ctx: ExecutionContext,
  workflow: WorkflowExecutionContext,
}

impl Workflow {
  pub fn new(name: impl Into<String>, root: Arc<dyn Component>) -> Self {
    Self {
      name: name.into(),
      root: Root::Component(root),
    }
  }

  /// A workflow whose root streams its output.
  pub fn streaming(name: impl Into<String>, root: Arc<dyn StreamComponent>) -> Self {
    Self {
      name: name.into(),
      root: Root::Stream(root),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_streaming(&self) -> bool {
    matches!(self.root, Root::Stream(_))
  }

  fn prepare(&self, options: RunOptions) -> Prepared {
    // Without a configured id the sink assigns one on the first transmission;
    // the local id only correlates logs and the start event until then.
    let execution_id = options
      .execution_id
      .clone()
      .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut config = CheckpointConfig::new(self.name.clone())
      .with_sink(options.sink)
      .with_prior(options.prior)
      .with_replay(options.replay);
    if let Some(id) = &options.execution_id {
      config = config.with_execution_id(id.clone());
    }
    let identity = RunIdentity {
      execution_id: options.execution_id.or(options.identity.execution_id.clone()),
      ..options.identity
    };
    let workflow = WorkflowExecutionContext::new(CheckpointManager::new(config))
      .with_notifier(options.notifier)
      .with_suspend_handler(options.suspend)
      .with_identity(identity);

    // Entries of an enclosing run are inherited, but its current node is not.
    let base = ExecutionContext::current().unwrap_or_else(ExecutionContext::root);
    let ctx = base.derive(
      options.scope.merge(
        Scope::new()
          .with(&WORKFLOW, workflow.clone())
          .with(&CURRENT_NODE, None),
      ),
    );
    Prepared {
      execution_id,
      ctx,
      workflow,
    }
  }

  fn invocation(&self, props: Value) -> Invocation {
    match &self.root {
      Root::Component(component) => Invocation::new(component.clone(), props),
      Root::Stream(component) => Invocation::stream(component.clone(), props),
    }
  }

  /// Run to completion and return the output.
  ///
  /// A streaming root is drained and its aggregate returned.
  #[instrument(name = "workflow_run", skip(self, props, options), fields(workflow_name = %self.name))]
  pub async fn run(&self, props: Value, options: RunOptions) -> Result<WorkflowRun, EngineError> {
    let Prepared {
      execution_id,
      ctx,
      workflow,
    } = self.prepare(options);
    self.started(&workflow, &execution_id);

    let invocation = match &self.root {
      Root::Component(_) => self.invocation(props),
      Root::Stream(_) => self.invocation(props).buffered(),
    };
    let result = ctx.scope(invocation.value()).await;
    finish_run(&self.name, execution_id, &workflow, result).await
  }

  /// Run and stream the root's fragments as they are produced.
  ///
  /// Each fragment is also reported as a `data` progress event. A
  /// non-streaming root yields its output as a single fragment.
  pub async fn run_stream(&self, props: Value, options: RunOptions) -> WorkflowStream {
    let Prepared {
      execution_id,
      ctx,
      workflow,
    } = self.prepare(options);
    self.started(&workflow, &execution_id);

    let (fragment_tx, fragment_rx) = mpsc::unbounded_channel::<Result<String, String>>();
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let invocation = self.invocation(props);
    let name = self.name.clone();
    let run_id = execution_id.clone();

    tokio::spawn(ctx.scope(async move {
      let result = forward_output(invocation, &workflow, &fragment_tx).await;
      if let Err(err) = &result {
        let _ = fragment_tx.send(Err(err.to_string()));
      }
      drop(fragment_tx);
      let outcome = finish_run(&name, run_id, &workflow, result).await;
      let _ = outcome_tx.send(outcome);
    }));

    let fragments = futures::stream::unfold(fragment_rx, |mut rx| async move {
      rx.recv().await.map(|item| (item, rx))
    })
    .boxed();
    WorkflowStream {
      execution_id,
      fragments,
      outcome: outcome_rx,
    }
  }

  fn started(&self, workflow: &WorkflowExecutionContext, execution_id: &str) {
    info!(
      execution_id = %execution_id,
      workflow_name = %self.name,
      "workflow_started"
    );
    workflow.notify(ProgressEvent::Start {
      workflow_name: self.name.clone(),
      execution_id: execution_id.to_string(),
    });
  }
}

async fn forward_output(
  invocation: Invocation,
  workflow: &WorkflowExecutionContext,
  fragments: &mpsc::UnboundedSender<Result<String, String>>,
) -> Result<Value, EngineError> {
  match invocation.run().await? {
    Output::Value(value) => {
      let content = match &value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      };
      workflow.notify(ProgressEvent::Data {
        content: content.clone(),
      });
      let _ = fragments.send(Ok(content));
      Ok(value)
    }
    Output::Stream(stream) => {
      let (mut inner, aggregator) = stream.into_parts();
      let mut seen = Vec::new();
      while let Some(fragment) = inner.next().await {
        let fragment = fragment.map_err(EngineError::from_resolve)?;
        workflow.notify(ProgressEvent::Data {
          content: fragment.clone(),
        });
        let _ = fragments.send(Ok(fragment.clone()));
        seen.push(fragment);
      }
      Ok(aggregator(&seen))
    }
  }
}

async fn finish_run(
  workflow_name: &str,
  execution_id: String,
  workflow: &WorkflowExecutionContext,
  result: Result<Value, EngineError>,
) -> Result<WorkflowRun, EngineError> {
  match &result {
    Ok(output) => {
      info!(execution_id = %execution_id, workflow_name = %workflow_name, "workflow_completed");
      workflow.notify(ProgressEvent::End {
        output: output.clone(),
      });
    }
    Err(err) => {
      error!(execution_id = %execution_id, error = %err, "workflow_failed");
      workflow.notify(ProgressEvent::Error {
        message: err.to_string(),
      });
    }
  }

  let checkpoint = workflow.checkpoint();
  if let Err(err) = checkpoint.wait_for_pending_updates().await {
    warn!(execution_id = %execution_id, error = %err, "final_checkpoint_not_persisted");
  }

  let output = result?;
  Ok(WorkflowRun {
    execution_id: workflow.execution_id().unwrap_or(execution_id),
    output,
    checkpoint: checkpoint.snapshot(),
    receipt: checkpoint.receipt(),
  })
}

/// Record a labelled event on the current node and report it as progress.
///
/// Outside a run this only logs.
pub fn emit_event(label: &str, data: Value) -> Result<(), EngineError> {
  let ctx = ExecutionContext::current();
  let Some(workflow) = ctx.as_ref().and_then(|ctx| ctx.get(&WORKFLOW)) else {
    warn!(label = %label, "event_outside_run");
    return Ok(());
  };
  if let Some(node_id) = ctx.as_ref().and_then(ExecutionContext::current_node) {
    workflow.checkpoint().push_event(&node_id, label, data.clone())?;
  }
  workflow.notify(ProgressEvent::Event {
    label: label.to_string(),
    data,
  });
  Ok(())
}

/// The id of the checkpoint node currently executing, if any.
pub fn current_node_id() -> Option<String> {
  ExecutionContext::current().and_then(|ctx| ctx.current_node())
}
