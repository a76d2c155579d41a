//! Pairs external input with suspended nodes.
//!
//! Each `(executionId, nodeId)` has at most one slot. Whichever side arrives
//! first creates it: an ask leaves a waiter, a fulfillment leaves a buffered
//! payload. The second side completes the pairing and settles the slot.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde_json::Value;
use spindle_engine::{BoxError, InputRequest, SuspendHandler, validate_schema};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ServerError;

/// What a fulfillment did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FulfillOutcome {
  /// A waiting node received the payload.
  Resolved,
  /// No node was waiting yet; the payload is kept for the ask.
  Buffered,
  /// The node was already settled or already has a payload.
  Ignored,
}

enum Slot {
  Waiting {
    sender: oneshot::Sender<Option<Value>>,
    schema: Option<Value>,
  },
  Buffered(Option<Value>),
  Settled,
}

type SlotKey = (String, String);

#[derive(Default)]
pub struct InputBroker {
  slots: DashMap<SlotKey, Slot>,
}

impl InputBroker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Deliver `payload` to the node, or keep it until the node asks.
  ///
  /// A payload for a waiting node whose schema is known is validated first;
  /// on failure the node keeps waiting.
  pub fn fulfill(
    &self,
    execution_id: &str,
    node_id: &str,
    payload: Option<Value>,
  ) -> Result<FulfillOutcome, ServerError> {
    match self
      .slots
      .entry((execution_id.to_string(), node_id.to_string()))
    {
      Entry::Vacant(slot) => {
        slot.insert(Slot::Buffered(payload));
        debug!(execution_id = %execution_id, node_id = %node_id, "input_buffered");
        Ok(FulfillOutcome::Buffered)
      }
      Entry::Occupied(mut slot) => {
        if let Slot::Waiting {
          schema: Some(schema),
          ..
        } = slot.get()
        {
          validate_schema(schema, payload.as_ref().unwrap_or(&Value::Null))?;
        }
        match std::mem::replace(slot.get_mut(), Slot::Settled) {
          Slot::Waiting { sender, .. } => {
            if sender.send(payload).is_err() {
              return Ok(FulfillOutcome::Ignored);
            }
            debug!(execution_id = %execution_id, node_id = %node_id, "input_resolved");
            Ok(FulfillOutcome::Resolved)
          }
          other => {
            *slot.get_mut() = other;
            Ok(FulfillOutcome::Ignored)
          }
        }
      }
    }
  }

  /// Wait for the node's payload, taking a buffered one if present.
  pub async fn wait(
    &self,
    execution_id: &str,
    node_id: &str,
    schema: Option<Value>,
  ) -> Result<Option<Value>, BoxError> {
    let (sender, receiver) = oneshot::channel();
    let waiting = Slot::Waiting { sender, schema };
    match self
      .slots
      .entry((execution_id.to_string(), node_id.to_string()))
    {
      Entry::Vacant(slot) => {
        slot.insert(waiting);
      }
      Entry::Occupied(mut slot) => match std::mem::replace(slot.get_mut(), waiting) {
        Slot::Buffered(payload) => {
          *slot.get_mut() = Slot::Settled;
          return Ok(payload);
        }
        Slot::Waiting { .. } | Slot::Settled => {}
      },
    }

    receiver
      .await
      .map_err(|_| format!("input for node '{}' was abandoned", node_id).into())
  }

  /// Node ids of the execution currently waiting for input.
  pub fn waiting(&self, execution_id: &str) -> Vec<String> {
    let mut nodes: Vec<String> = self
      .slots
      .iter()
      .filter(|entry| entry.key().0 == execution_id && matches!(entry.value(), Slot::Waiting { .. }))
      .map(|entry| entry.key().1.clone())
      .collect();
    nodes.sort();
    nodes
  }

  /// Drop every slot of a finished execution.
  pub fn release(&self, execution_id: &str) {
    self.slots.retain(|(id, _), _| id != execution_id);
  }
}

/// The [`SuspendHandler`] of one execution.
pub struct ExecutionInputs {
  broker: Arc<InputBroker>,
  execution_id: String,
}

impl ExecutionInputs {
  pub fn new(broker: Arc<InputBroker>, execution_id: impl Into<String>) -> Self {
    Self {
      broker,
      execution_id: execution_id.into(),
    }
  }
}

#[async_trait]
impl SuspendHandler for ExecutionInputs {
  async fn on_request_input(&self, request: InputRequest) -> Result<Option<Value>, BoxError> {
    self
      .broker
      .wait(&self.execution_id, &request.node_id, request.schema)
      .await
  }

  async fn on_wait_for_input(&self, request: InputRequest) -> Result<Option<Value>, BoxError> {
    self
      .broker
      .wait(&self.execution_id, &request.node_id, None)
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_ask_then_fulfill() {
    let broker = Arc::new(InputBroker::new());
    let waiter = broker.clone();
    let handle = tokio::spawn(async move { waiter.wait("e1", "n1", None).await.unwrap() });

    // Let the ask register before fulfilling.
    while broker.waiting("e1").is_empty() {
      tokio::task::yield_now().await;
    }
    assert_eq!(
      broker.fulfill("e1", "n1", Some(json!({ "message": "hello" }))).unwrap(),
      FulfillOutcome::Resolved
    );
    assert_eq!(handle.await.unwrap(), Some(json!({ "message": "hello" })));
  }

  #[tokio::test]
  async fn test_fulfill_then_ask() {
    let broker = InputBroker::new();
    assert_eq!(
      broker.fulfill("e1", "n1", Some(json!(1))).unwrap(),
      FulfillOutcome::Buffered
    );
    assert_eq!(broker.wait("e1", "n1", None).await.unwrap(), Some(json!(1)));
    assert_eq!(
      broker.fulfill("e1", "n1", Some(json!(2))).unwrap(),
      FulfillOutcome::Ignored
    );
  }

  #[tokio::test]
  async fn test_invalid_payload_keeps_waiting() {
    let broker = Arc::new(InputBroker::new());
    let schema = json!({
      "type": "object",
      "properties": { "message": { "type": "string" } },
      "required": ["message"],
    });
    let waiter = broker.clone();
    let handle =
      tokio::spawn(async move { waiter.wait("e1", "n1", Some(schema)).await.unwrap() });
    while broker.waiting("e1").is_empty() {
      tokio::task::yield_now().await;
    }

    let err = broker.fulfill("e1", "n1", Some(json!({ "message": 5 }))).unwrap_err();
    assert!(matches!(err, ServerError::InvalidRequest(_)));
    assert_eq!(broker.waiting("e1"), vec!["n1"]);

    broker
      .fulfill("e1", "n1", Some(json!({ "message": "ok" })))
      .unwrap();
    assert_eq!(handle.await.unwrap(), Some(json!({ "message": "ok" })));
  }

  #[test]
  fn test_release_forgets_execution() {
    let broker = InputBroker::new();
    broker.fulfill("e1", "n1", None).unwrap();
    broker.fulfill("e2", "n1", None).unwrap();
    broker.release("e1");
    assert_eq!(broker.fulfill("e1", "n1", None).unwrap(), FulfillOutcome::Buffered);
    assert_eq!(broker.fulfill("e2", "n1", None).unwrap(), FulfillOutcome::Ignored);
  }
}
