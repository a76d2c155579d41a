//! Drives executions through `queued -> starting -> running -> completed |
//! failed` and routes external input to their suspended nodes.

use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use spindle_checkpoint::{CheckpointReceipt, WireCheckpoint};
use spindle_engine::{RunIdentity, RunOptions, validate_schema};
use spindle_store::{
  ExecutionRecord, ExecutionStatus, StatusUpdate, Store, StoredCheckpoint, StoredMessage,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::broker::{ExecutionInputs, FulfillOutcome, InputBroker};
use crate::error::{ServerError, ServerResult};
use crate::log::{ExecutionLog, LogCommand, LogNotifier, status_message};
use crate::registry::{RegisteredWorkflow, WorkflowRegistry};
use crate::sink::StoreCheckpointSink;

const LIVE_BUFFER: usize = 256;

/// Identifiers used to build callback URLs for suspended nodes.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
  pub api_base: Option<String>,
  pub org: Option<String>,
}

/// A started execution.
///
/// `fragments` carries the root's output as it is produced, ending with an
/// `Err(message)` if the run failed. Dropping it does not affect the run.
pub struct ExecutionHandle {
  pub execution_id: String,
  pub fragments: mpsc::UnboundedReceiver<Result<String, String>>,
  outcome: oneshot::Receiver<ExecutionRecord>,
}

impl ExecutionHandle {
  /// Wait for the execution to reach a terminal status.
  pub async fn wait(self) -> ServerResult<ExecutionRecord> {
    self
      .outcome
      .await
      .map_err(|_| ServerError::Internal("execution task ended without a result".to_string()))
  }
}

struct Inner {
  store: Arc<dyn Store>,
  registry: WorkflowRegistry,
  broker: Arc<InputBroker>,
  live: DashMap<String, broadcast::Sender<StoredMessage>>,
  config: OrchestratorConfig,
  cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Orchestrator {
  inner: Arc<Inner>,
}

impl Orchestrator {
  pub fn new(store: Arc<dyn Store>, registry: WorkflowRegistry, config: OrchestratorConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        registry,
        broker: Arc::new(InputBroker::new()),
        live: DashMap::new(),
        config,
        cancel: CancellationToken::new(),
      }),
    }
  }

  pub fn registry(&self) -> &WorkflowRegistry {
    &self.inner.registry
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.inner.store
  }

  /// Validate `input`, record a queued execution and run it in the
  /// background.
  #[instrument(skip(self, input))]
  pub async fn start(&self, workflow_name: &str, input: Value) -> ServerResult<ExecutionHandle> {
    let registered = self
      .inner
      .registry
      .get(workflow_name)
      .ok_or_else(|| ServerError::WorkflowNotFound(workflow_name.to_string()))?;
    if !input.is_object() {
      return Err(ServerError::InvalidRequest(
        "workflow input must be a JSON object".to_string(),
      ));
    }
    if let Some(schema) = &registered.input_schema {
      validate_schema(schema, &input)?;
    }

    let execution_id = Uuid::new_v4().to_string();
    let store = self.inner.store.clone();
    store
      .create_execution(&ExecutionRecord::queued(
        &execution_id,
        workflow_name,
        input.clone(),
      ))
      .await?;

    let (live, _) = broadcast::channel(LIVE_BUFFER);
    self.inner.live.insert(execution_id.clone(), live.clone());
    let (log, writer) = ExecutionLog::spawn(execution_id.clone(), store, live);
    let _ = log.send(LogCommand::Append(status_message(
      &execution_id,
      ExecutionStatus::Queued,
      None,
    )));
    info!(execution_id = %execution_id, workflow_name = %workflow_name, "execution_queued");

    let (fragment_tx, fragments) = mpsc::unbounded_channel();
    let (outcome_tx, outcome) = oneshot::channel();
    let run = Run {
      orchestrator: self.clone(),
      registered,
      execution_id: execution_id.clone(),
      log,
    };
    tokio::spawn(async move {
      let record = run.drive(input, writer, fragment_tx).await;
      if let Some(record) = record {
        let _ = outcome_tx.send(record);
      }
    });

    Ok(ExecutionHandle {
      execution_id,
      fragments,
      outcome,
    })
  }

  pub async fn execution(&self, execution_id: &str) -> ServerResult<ExecutionRecord> {
    Ok(self.inner.store.get_execution(execution_id).await?)
  }

  pub async fn executions(&self, workflow_name: Option<&str>) -> ServerResult<Vec<ExecutionRecord>> {
    Ok(self.inner.store.list_executions(workflow_name).await?)
  }

  /// Nodes of the execution currently waiting for input.
  pub fn waiting_nodes(&self, execution_id: &str) -> Vec<String> {
    self.inner.broker.waiting(execution_id)
  }

  /// The execution's message log: everything recorded so far, then live
  /// messages until the execution finishes.
  pub async fn progress(&self, execution_id: &str) -> ServerResult<BoxStream<'static, StoredMessage>> {
    self.inner.store.get_execution(execution_id).await?;

    // Subscribe before reading the backlog so nothing falls in between.
    let live = self
      .inner
      .live
      .get(execution_id)
      .map(|sender| sender.subscribe());
    let backlog = self.inner.store.list_messages(execution_id, 0).await?;
    let last_seq = backlog.last().map(|message| message.seq).unwrap_or(0);
    let backlog = stream::iter(backlog);

    Ok(match live {
      None => backlog.boxed(),
      Some(receiver) => {
        let live_id = execution_id.to_string();
        let live = BroadcastStream::new(receiver).filter_map(move |item| {
          let message = match item {
            Ok(message) if message.seq > last_seq => Some(message),
            Ok(_) => None,
            Err(err) => {
              warn!(execution_id = %live_id, error = %err, "progress_subscriber_lagged");
              None
            }
          };
          futures::future::ready(message)
        });
        backlog.chain(live).boxed()
      }
    })
  }

  /// Deliver input to a node of a running execution.
  ///
  /// Input for a finished execution is ignored.
  pub async fn fulfill(
    &self,
    execution_id: &str,
    node_id: &str,
    payload: Option<Value>,
  ) -> ServerResult<FulfillOutcome> {
    let record = self.inner.store.get_execution(execution_id).await?;
    if record.status.is_terminal() {
      return Ok(FulfillOutcome::Ignored);
    }
    let outcome = self.inner.broker.fulfill(execution_id, node_id, payload)?;
    info!(
      execution_id = %execution_id,
      node_id = %node_id,
      outcome = ?outcome,
      "input_received"
    );
    Ok(outcome)
  }

  pub async fn checkpoint(&self, execution_id: &str) -> ServerResult<Option<Value>> {
    Ok(
      self
        .inner
        .store
        .get_checkpoint(execution_id)
        .await?
        .map(|checkpoint| checkpoint.tree.0),
    )
  }

  /// Store a checkpoint sent by a remote run over the wire protocol.
  pub async fn ingest_checkpoint(
    &self,
    wire: WireCheckpoint,
    execution_id: Option<String>,
  ) -> ServerResult<CheckpointReceipt> {
    let tree = wire.tree()?;
    let execution_id = execution_id
      .or(wire.execution_id.clone())
      .unwrap_or_else(|| Uuid::new_v4().to_string());
    let tree = serde_json::to_value(&tree)
      .map_err(|err| ServerError::InvalidRequest(format!("unencodable checkpoint: {}", err)))?;
    self
      .inner
      .store
      .save_checkpoint(&StoredCheckpoint::new(
        &execution_id,
        &wire.workflow_name,
        tree,
      ))
      .await?;

    Ok(CheckpointReceipt {
      execution_id,
      trace_id: Uuid::new_v4().to_string(),
      workflow_name: wire.workflow_name,
    })
  }

  /// Fail every running execution and stop accepting input.
  pub fn shutdown(&self) {
    info!("orchestrator_shutting_down");
    self.inner.cancel.cancel();
  }
}

struct Run {
  orchestrator: Orchestrator,
  registered: RegisteredWorkflow,
  execution_id: String,
  log: mpsc::UnboundedSender<LogCommand>,
}

impl Run {
  async fn drive(
    self,
    input: Value,
    writer: tokio::task::JoinHandle<()>,
    fragments: mpsc::UnboundedSender<Result<String, String>>,
  ) -> Option<ExecutionRecord> {
    let inner = &self.orchestrator.inner;
    let execution_id = &self.execution_id;
    self.status(ExecutionStatus::Starting, StatusUpdate::default());

    let options = RunOptions::new()
      .with_execution_id(execution_id.clone())
      .with_sink(Arc::new(StoreCheckpointSink::new(inner.store.clone())))
      .with_notifier(Arc::new(LogNotifier::new(self.log.clone())))
      .with_suspend_handler(Arc::new(ExecutionInputs::new(
        inner.broker.clone(),
        execution_id.clone(),
      )))
      .with_identity(RunIdentity {
        api_base: inner.config.api_base.clone(),
        org: inner.config.org.clone(),
        execution_id: Some(execution_id.clone()),
        code_verifier: None,
      });

    let mut stream = self.registered.workflow.run_stream(input, options).await;
    let interrupted = loop {
      tokio::select! {
        _ = inner.cancel.cancelled() => break true,
        fragment = stream.next() => match fragment {
          Some(fragment) => {
            let _ = fragments.send(fragment);
          }
          None => break false,
        },
      }
    };
    drop(fragments);

    let result = if interrupted {
      Err("server shut down before the execution finished".to_string())
    } else {
      stream.finish().await.map_err(|err| err.to_string())
    };
    let (status, update) = match result {
      Ok(run) => match &self.registered.output_schema {
        Some(schema) => match validate_schema(schema, &run.output) {
          Ok(()) => (ExecutionStatus::Completed, StatusUpdate::output(run.output)),
          Err(err) => (
            ExecutionStatus::Failed,
            StatusUpdate::error(format!("output does not match schema: {}", err)),
          ),
        },
        None => (ExecutionStatus::Completed, StatusUpdate::output(run.output)),
      },
      Err(message) => (ExecutionStatus::Failed, StatusUpdate::error(message)),
    };
    self.status(status, update);
    let _ = self.log.send(LogCommand::Close);

    if let Err(err) = writer.await {
      error!(execution_id = %execution_id, error = %err, "log_writer_panicked");
    }
    inner.live.remove(execution_id);
    inner.broker.release(execution_id);

    match inner.store.get_execution(execution_id).await {
      Ok(record) => {
        info!(
          execution_id = %execution_id,
          status = %record.status,
          "execution_finished"
        );
        Some(record)
      }
      Err(err) => {
        error!(execution_id = %execution_id, error = %err, "execution_record_missing");
        None
      }
    }
  }

  fn status(&self, status: ExecutionStatus, update: StatusUpdate) {
    let _ = self.log.send(LogCommand::Status { status, update });
  }
}
