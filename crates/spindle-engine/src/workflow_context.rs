//! Per-run state shared by every component of a run.

use std::fmt;
use std::sync::Arc;

use spindle_checkpoint::{CheckpointConfig, CheckpointManager, MemorySink};
use spindle_context::{ContextKey, ExecutionContext};

use crate::events::{NoopNotifier, ProgressEvent, ProgressNotifier};
use crate::suspend::SuspendHandler;

/// Context key under which the run's [`WorkflowExecutionContext`] is stored.
pub static WORKFLOW: ContextKey<WorkflowExecutionContext> = ContextKey::new("spindle.workflow");

/// Identifiers used to build resumption URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunIdentity {
  pub api_base: Option<String>,
  pub org: Option<String>,
  pub execution_id: Option<String>,
  pub code_verifier: Option<String>,
}

/// One per top-level run: the checkpoint manager, the progress notifier, the
/// optional suspend handler and the run's identifiers.
#[derive(Clone)]
pub struct WorkflowExecutionContext {
  checkpoint: CheckpointManager,
  notifier: Arc<dyn ProgressNotifier>,
  suspend: Option<Arc<dyn SuspendHandler>>,
  identity: RunIdentity,
}

impl WorkflowExecutionContext {
  pub fn new(checkpoint: CheckpointManager) -> Self {
    Self {
      checkpoint,
      notifier: Arc::new(NoopNotifier),
      suspend: None,
      identity: RunIdentity::default(),
    }
  }

  /// A run context for a component invoked outside any run, recording into
  /// an in-memory checkpoint.
  pub fn standalone(workflow_name: impl Into<String>) -> Self {
    let config = CheckpointConfig::new(workflow_name).with_sink(Arc::new(MemorySink::new()));
    Self::new(CheckpointManager::new(config))
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ProgressNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn with_suspend_handler(mut self, handler: Option<Arc<dyn SuspendHandler>>) -> Self {
    self.suspend = handler;
    self
  }

  pub fn with_identity(mut self, identity: RunIdentity) -> Self {
    self.identity = identity;
    self
  }

  /// The run context installed in the current task, if any.
  pub fn current() -> Option<Self> {
    ExecutionContext::current().and_then(|ctx| ctx.get(&WORKFLOW))
  }

  pub fn checkpoint(&self) -> &CheckpointManager {
    &self.checkpoint
  }

  pub fn suspend_handler(&self) -> Option<&Arc<dyn SuspendHandler>> {
    self.suspend.as_ref()
  }

  pub fn identity(&self) -> &RunIdentity {
    &self.identity
  }

  /// The run's execution id: the configured one, else the one storage
  /// assigned.
  pub fn execution_id(&self) -> Option<String> {
    self
      .identity
      .execution_id
      .clone()
      .or_else(|| self.checkpoint.execution_id())
  }

  pub fn notify(&self, event: ProgressEvent) {
    self.notifier.notify(event);
  }
}

impl fmt::Debug for WorkflowExecutionContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkflowExecutionContext")
      .field("workflow_name", &self.checkpoint.workflow_name())
      .field("identity", &self.identity)
      .field("suspendable", &self.suspend.is_some())
      .finish()
  }
}
