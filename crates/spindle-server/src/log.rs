//! The per-execution message log.
//!
//! A single writer task owns each execution's log so status changes and
//! progress messages are stored and broadcast in the order they happened.

use std::sync::Arc;

use serde_json::{Value, json};
use spindle_engine::{ProgressEvent, ProgressNotifier};
use spindle_store::{ExecutionStatus, StatusUpdate, Store, StoredMessage};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

pub(crate) enum LogCommand {
  /// Append a message as is.
  Append(Value),
  Progress(ProgressEvent),
  Status {
    status: ExecutionStatus,
    update: StatusUpdate,
  },
  Close,
}

/// Forwards engine progress into an execution's log.
pub(crate) struct LogNotifier {
  sender: mpsc::UnboundedSender<LogCommand>,
}

impl LogNotifier {
  pub fn new(sender: mpsc::UnboundedSender<LogCommand>) -> Self {
    Self { sender }
  }
}

impl ProgressNotifier for LogNotifier {
  fn notify(&self, event: ProgressEvent) {
    // The writer is gone once the run has been finalized.
    let _ = self.sender.send(LogCommand::Progress(event));
  }
}

/// `{"type":"status","executionId":..,"status":..,"error"?:..}`
pub fn status_message(execution_id: &str, status: ExecutionStatus, error: Option<&str>) -> Value {
  let mut message = json!({
    "type": "status",
    "executionId": execution_id,
    "status": status.as_str(),
  });
  if let Some(error) = error {
    message["error"] = Value::String(error.to_string());
  }
  message
}

pub(crate) struct ExecutionLog {
  execution_id: String,
  store: Arc<dyn Store>,
  live: broadcast::Sender<StoredMessage>,
}

impl ExecutionLog {
  pub fn spawn(
    execution_id: String,
    store: Arc<dyn Store>,
    live: broadcast::Sender<StoredMessage>,
  ) -> (mpsc::UnboundedSender<LogCommand>, JoinHandle<()>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let log = Self {
      execution_id,
      store,
      live,
    };
    (sender, tokio::spawn(log.run(receiver)))
  }

  async fn run(self, mut receiver: mpsc::UnboundedReceiver<LogCommand>) {
    while let Some(command) = receiver.recv().await {
      match command {
        LogCommand::Append(message) => self.append(message).await,
        LogCommand::Progress(event) => {
          if matches!(event, ProgressEvent::Start { .. }) {
            self
              .transition(ExecutionStatus::Running, StatusUpdate::default())
              .await;
          }
          match serde_json::to_value(&event) {
            Ok(message) => self.append(message).await,
            Err(err) => warn!(execution_id = %self.execution_id, error = %err, "unserializable_event"),
          }
        }
        LogCommand::Status { status, update } => self.transition(status, update).await,
        LogCommand::Close => break,
      }
    }
  }

  async fn transition(&self, status: ExecutionStatus, update: StatusUpdate) {
    let error = update.error.clone();
    match self
      .store
      .update_status(&self.execution_id, status, update)
      .await
    {
      Ok(_) => {
        self
          .append(status_message(&self.execution_id, status, error.as_deref()))
          .await
      }
      Err(err) => warn!(
        execution_id = %self.execution_id,
        status = %status,
        error = %err,
        "status_update_failed"
      ),
    }
  }

  async fn append(&self, message: Value) {
    match self.store.append_message(&self.execution_id, &message).await {
      Ok(stored) => {
        // No subscribers is fine.
        let _ = self.live.send(stored);
      }
      Err(err) => warn!(execution_id = %self.execution_id, error = %err, "message_append_failed"),
    }
  }
}
