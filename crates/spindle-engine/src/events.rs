//! Progress events and notifiers.
//!
//! Events are emitted while a workflow runs so consumers can observe progress,
//! persist a message log, stream to clients, etc.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Events emitted during a workflow run.
///
/// Serialized with a kebab-case `type` tag and camelCase fields, e.g.
/// `{"type":"component-start","nodeId":"..","componentName":".."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ProgressEvent {
  /// The run has started.
  Start {
    workflow_name: String,
    execution_id: String,
  },

  /// A component node was added and its body is starting.
  ComponentStart {
    node_id: String,
    component_name: String,
  },

  /// A component node finished, successfully or not.
  ComponentEnd {
    node_id: String,
    component_name: String,
  },

  /// A fragment of the run's streamed output.
  Data { content: String },

  /// A labelled event emitted by a component body.
  Event { label: String, data: Value },

  /// A node suspended waiting for external input.
  InputRequest {
    node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_at: Option<DateTime<Utc>>,
  },

  /// The run finished with `output`.
  End { output: Value },

  /// The run failed.
  Error { message: String },
}

/// Receives progress events.
///
/// The engine calls `notify` for each event; implementations decide what to
/// do with them.
pub trait ProgressNotifier: Send + Sync {
  fn notify(&self, event: ProgressEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ProgressNotifier for NoopNotifier {
  fn notify(&self, _event: ProgressEvent) {}
}

/// Sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never blocks a component body.
  sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ProgressEvent>) -> Self {
    Self { sender }
  }

  /// A notifier and the receiving end of its channel.
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self::new(sender), receiver)
  }
}

impl ProgressNotifier for ChannelNotifier {
  fn notify(&self, event: ProgressEvent) {
    // Receiver may have been dropped.
    let _ = self.sender.send(event);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_event_wire_shape() {
    let event = ProgressEvent::ComponentStart {
      node_id: "Child:1".to_string(),
      component_name: "Child".to_string(),
    };
    assert_eq!(
      serde_json::to_value(&event).unwrap(),
      json!({ "type": "component-start", "nodeId": "Child:1", "componentName": "Child" })
    );

    let start = ProgressEvent::Start {
      workflow_name: "wf".to_string(),
      execution_id: "e1".to_string(),
    };
    assert_eq!(
      serde_json::to_value(&start).unwrap(),
      json!({ "type": "start", "workflowName": "wf", "executionId": "e1" })
    );
  }

  #[test]
  fn test_input_request_omits_unknown_fields() {
    let event = ProgressEvent::InputRequest {
      node_id: "RequestInput:1".to_string(),
      callback_url: None,
      schema: None,
      timeout_at: None,
    };
    assert_eq!(
      serde_json::to_value(&event).unwrap(),
      json!({ "type": "input-request", "nodeId": "RequestInput:1" })
    );
  }

  #[tokio::test]
  async fn test_channel_notifier_delivers() {
    let (notifier, mut rx) = ChannelNotifier::channel();
    notifier.notify(ProgressEvent::Data {
      content: "a".to_string(),
    });
    assert_eq!(
      rx.recv().await,
      Some(ProgressEvent::Data {
        content: "a".to_string()
      })
    );
  }
}
