//! The checkpoint manager.
//!
//! One manager owns the checkpoint tree of one run. Mutations apply to an
//! in-memory tree immediately; transmission to the sink happens on a
//! background task that coalesces bursts of updates into a single send of the
//! whole tree.
//!
//! ```text
//!   add_node / update_node / ...      background task
//!   ────────────────────────────      ─────────────────────────────────
//!   mutate tree under lock            wake ──► drain queued wakes
//!   scheduled += 1                             snapshot tree
//!   wake ─────────────────────────►            sink.persist(batch)
//!                                              acked = version | failure
//!   wait_for_pending_updates ◄──────── status (watch channel)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::CheckpointError;
use crate::identity::node_id;
use crate::node::{ExecutionNode, OUTPUT_MASKED_KEY};
use crate::redact::{mask_secrets, redact_props};
use crate::sink::{CheckpointBatch, CheckpointSink, NoopSink};
use crate::wire::CheckpointReceipt;

/// What to do when a node matches a completed node of the prior run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplayMode {
  /// Splice the prior subtree in and skip the component body.
  #[default]
  Memoize,
  /// Record the node fresh with `priorCompleted: true` and run the body again.
  TraceOnly,
}

/// Configuration for one run's checkpoint tree.
#[derive(Clone)]
pub struct CheckpointConfig {
  pub workflow_name: String,
  /// Known execution id; when `None` the sink assigns one on first send.
  pub execution_id: Option<String>,
  pub sink: Arc<dyn CheckpointSink>,
  /// Checkpoint tree of an earlier run of the same execution.
  pub prior: Option<ExecutionNode>,
  pub replay: ReplayMode,
}

impl CheckpointConfig {
  pub fn new(workflow_name: impl Into<String>) -> Self {
    Self {
      workflow_name: workflow_name.into(),
      execution_id: None,
      sink: Arc::new(NoopSink),
      prior: None,
      replay: ReplayMode::default(),
    }
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
}

impl fmt::Debug for CheckpointConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CheckpointConfig")
      .field("workflow_name", &self.workflow_name)
      .field("execution_id", &self.execution_id)
      .field("has_prior", &self.prior.is_some())
      .field("replay", &self.replay)
      .finish()
  }
}

/// A node to add to the tree.
#[derive(Debug, Clone)]
pub struct NewNode {
  pub component_name: String,
  pub props: Value,
  pub parent_id: Option<String>,
  pub metadata: Map<String, Value>,
  /// Prop keys whose values must not be recorded.
  pub secret_keys: Vec<String>,
}

impl NewNode {
  pub fn new(component_name: impl Into<String>, props: Value) -> Self {
    Self {
      component_name: component_name.into(),
      props,
      parent_id: None,
      metadata: Map::new(),
      secret_keys: Vec::new(),
    }
  }

  pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
    self.parent_id = parent_id;
    self
  }

  pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
    self.metadata = metadata;
    self
  }

  pub fn with_secret_keys(mut self, secret_keys: Vec<String>) -> Self {
    self.secret_keys = secret_keys;
    self
  }
}

/// Result of [`CheckpointManager::add_node`].
#[derive(Debug, Clone, PartialEq)]
pub struct AddedNode {
  pub id: String,
  /// Output of the prior run's node when its subtree was spliced in.
  pub cached: Option<Value>,
}

#[derive(Debug, Clone)]
struct NodeRecord {
  node: ExecutionNode,
  children: Vec<String>,
}

#[derive(Debug, Default)]
struct TreeState {
  nodes: HashMap<String, NodeRecord>,
  root: Option<String>,
  occurrences: HashMap<String, usize>,
  secrets: Vec<String>,
}

impl TreeState {
  fn record_mut(&mut self, id: &str) -> Result<&mut NodeRecord, CheckpointError> {
    self
      .nodes
      .get_mut(id)
      .ok_or_else(|| CheckpointError::NodeNotFound {
        node_id: id.to_string(),
      })
  }

  /// The subtree at `id` as it may leave the process, with secrets masked.
  fn build(&self, id: &str) -> Option<ExecutionNode> {
    let record = self.nodes.get(id)?;
    let mut node = self.masked(&record.node);
    node.children = record
      .children
      .iter()
      .filter_map(|child| self.build(child))
      .collect();
    Some(node)
  }

  fn masked(&self, node: &ExecutionNode) -> ExecutionNode {
    let mut node = node.clone();
    if self.secrets.is_empty() {
      return node;
    }
    for value in node.metadata.values_mut() {
      *value = mask_secrets(value, &self.secrets);
    }
    node.error = node.error.map(|error| mask_secrets(&error, &self.secrets));
    if let Some(output) = node.output.take() {
      let masked = mask_secrets(&output, &self.secrets);
      if masked != output {
        node
          .metadata
          .insert(OUTPUT_MASKED_KEY.to_string(), Value::Bool(true));
      }
      node.output = Some(masked);
    }
    node
  }

  fn insert_subtree(&mut self, mut node: ExecutionNode) -> String {
    let children = std::mem::take(&mut node.children);
    let id = node.id.clone();
    let child_ids = children
      .into_iter()
      .map(|child| self.insert_subtree(child))
      .collect();
    self.nodes.insert(
      id.clone(),
      NodeRecord {
        node,
        children: child_ids,
      },
    );
    id
  }

  /// Suffix repeated `(name, props, parent)` triples with their occurrence
  /// index so every node keeps a distinct id.
  fn disambiguate(&mut self, base: String) -> String {
    let seen = self.occurrences.entry(base.clone()).or_insert(0);
    let id = match *seen {
      0 => base,
      n => format!("{base}-{n}"),
    };
    *seen += 1;
    id
  }
}

#[derive(Debug, Clone, Default)]
struct FlushStatus {
  /// Highest update version the sink has acknowledged.
  acked: u64,
  /// Transmission attempts made so far.
  attempts: u64,
  failure: Option<FlushFailure>,
}

#[derive(Debug, Clone)]
struct FlushFailure {
  attempt: u64,
  version: u64,
  message: String,
}

struct Shared {
  workflow_name: String,
  configured_id: Option<String>,
  sink: Arc<dyn CheckpointSink>,
  prior: Option<ExecutionNode>,
  replay: ReplayMode,
  state: Mutex<TreeState>,
  receipt: Mutex<Option<CheckpointReceipt>>,
  scheduled: AtomicU64,
  status: watch::Sender<FlushStatus>,
}

impl Shared {
  fn execution_id(&self) -> Option<String> {
    self.configured_id.clone().or_else(|| {
      self
        .receipt
        .lock()
        .as_ref()
        .map(|receipt| receipt.execution_id.clone())
    })
  }

  fn snapshot(&self) -> Option<ExecutionNode> {
    let state = self.state.lock();
    state.root.as_deref().and_then(|root| state.build(root))
  }

  async fn transmit(&self) {
    // Read the version before the snapshot so the snapshot covers it.
    let version = self.scheduled.load(Ordering::SeqCst);
    if version <= self.status.borrow().acked {
      return;
    }
    let Some(tree) = self.snapshot() else {
      self.status.send_modify(|status| status.acked = version);
      return;
    };
    let batch = CheckpointBatch {
      workflow_name: self.workflow_name.clone(),
      execution_id: self.execution_id(),
      tree,
    };

    match self.sink.persist(&batch).await {
      Ok(receipt) => {
        debug!(
          execution_id = %receipt.execution_id,
          version,
          "checkpoint_persisted"
        );
        *self.receipt.lock() = Some(receipt);
        self.status.send_modify(|status| {
          status.attempts += 1;
          status.acked = status.acked.max(version);
          status.failure = None;
        });
      }
      Err(err) => {
        warn!(
          workflow_name = %self.workflow_name,
          version,
          error = %err,
          "checkpoint_transmission_failed"
        );
        self.status.send_modify(|status| {
          status.attempts += 1;
          status.failure = Some(FlushFailure {
            attempt: status.attempts,
            version,
            message: err.to_string(),
          });
        });
      }
    }
  }
}

async fn transmit_loop(shared: Arc<Shared>, mut wake: mpsc::UnboundedReceiver<()>) {
  while wake.recv().await.is_some() {
    while wake.try_recv().is_ok() {}
    shared.transmit().await;
  }
}

/// Owns the checkpoint tree of one run and streams it to a sink.
///
/// Cloning shares the same tree. The background task keeps running until
/// every clone is dropped and all updates scheduled before then have been
/// sent once.
#[derive(Clone)]
pub struct CheckpointManager {
  shared: Arc<Shared>,
  wake: mpsc::UnboundedSender<()>,
}

impl CheckpointManager {
  /// Create a manager and start its transmission task.
  ///
  /// Must be called from within a tokio runtime.
  pub fn new(config: CheckpointConfig) -> Self {
    let (status, _) = watch::channel(FlushStatus::default());
    let shared = Arc::new(Shared {
      workflow_name: config.workflow_name,
      configured_id: config.execution_id,
      sink: config.sink,
      prior: config.prior,
      replay: config.replay,
      state: Mutex::new(TreeState::default()),
      receipt: Mutex::new(None),
      scheduled: AtomicU64::new(0),
      status,
    });
    let (wake, rx) = mpsc::unbounded_channel();
    tokio::spawn(transmit_loop(shared.clone(), rx));
    Self { shared, wake }
  }

  pub fn workflow_name(&self) -> &str {
    &self.shared.workflow_name
  }

  /// The run's execution id, once known.
  pub fn execution_id(&self) -> Option<String> {
    self.shared.execution_id()
  }

  /// The most recent receipt returned by the sink.
  pub fn receipt(&self) -> Option<CheckpointReceipt> {
    self.shared.receipt.lock().clone()
  }

  pub fn replay_mode(&self) -> ReplayMode {
    self.shared.replay
  }

  /// Add a node under `new.parent_id`, or as the root when it has none.
  ///
  /// The id hashes the props as given; only the redacted props are recorded.
  ///
  /// If the computed id names a completed, error-free node of the prior run
  /// and the manager memoizes, the prior subtree is spliced in and its output
  /// returned in [`AddedNode::cached`]. A prior node whose output was masked
  /// is run again instead.
  pub fn add_node(&self, new: NewNode) -> Result<AddedNode, CheckpointError> {
    let (props, secrets) = redact_props(&new.props, &new.secret_keys);
    let added = {
      let mut state = self.shared.state.lock();
      match new.parent_id.as_deref() {
        Some(parent) if !state.nodes.contains_key(parent) => {
          return Err(CheckpointError::ParentNotFound {
            parent_id: parent.to_string(),
          });
        }
        None => {
          if let Some(root) = &state.root {
            return Err(CheckpointError::RootExists {
              root_id: root.clone(),
            });
          }
        }
        _ => {}
      }

      let base = node_id(&new.component_name, &new.props, new.parent_id.as_deref());
      let id = state.disambiguate(base);
      state.secrets.extend(secrets);

      let prior = self
        .shared
        .prior
        .as_ref()
        .and_then(|prior| prior.find(&id))
        .filter(|node| node.is_successful());

      let cached = match (prior, self.shared.replay) {
        (Some(prior), ReplayMode::Memoize) if !prior.output_masked() => {
          let output = prior.output.clone().unwrap_or(Value::Null);
          let mut spliced = prior.clone();
          spliced.parent_id = new.parent_id.clone();
          state.insert_subtree(spliced);
          Some(output)
        }
        (prior, _) => {
          let mut metadata = new.metadata;
          if prior.is_some() {
            metadata.insert("priorCompleted".to_string(), Value::Bool(true));
          }
          let node = ExecutionNode {
            id: id.clone(),
            component_name: new.component_name.clone(),
            parent_id: new.parent_id.clone(),
            start_time: Utc::now(),
            end_time: None,
            props,
            output: None,
            children: Vec::new(),
            metadata,
            error: None,
          };
          state.nodes.insert(
            id.clone(),
            NodeRecord {
              node,
              children: Vec::new(),
            },
          );
          None
        }
      };

      match new.parent_id.as_deref() {
        Some(parent) => state.record_mut(parent)?.children.push(id.clone()),
        None => state.root = Some(id.clone()),
      }
      AddedNode { id, cached }
    };

    debug!(
      node_id = %added.id,
      component = %new.component_name,
      cached = added.cached.is_some(),
      "checkpoint_node_added"
    );
    self.schedule();
    Ok(added)
  }

  /// Mark a node finished with its final output.
  pub fn complete_node(&self, id: &str, output: Value) -> Result<(), CheckpointError> {
    self.mutate(id, |node| {
      node.output = Some(output);
      node.end_time = Some(Utc::now());
    })
  }

  /// Replace a node's (partial) output without finishing it.
  pub fn update_node(&self, id: &str, output: Value) -> Result<(), CheckpointError> {
    self.mutate(id, |node| node.output = Some(output))
  }

  /// Merge entries into a node's metadata.
  pub fn add_metadata(&self, id: &str, metadata: Map<String, Value>) -> Result<(), CheckpointError> {
    self.mutate(id, |node| node.metadata.extend(metadata))
  }

  /// Attach a serialized error to a node.
  pub fn set_error(&self, id: &str, error: Value) -> Result<(), CheckpointError> {
    self.mutate(id, |node| node.error = Some(error))
  }

  /// Append a labelled event to the node's `metadata.events` list.
  pub fn push_event(&self, id: &str, label: &str, data: Value) -> Result<(), CheckpointError> {
    self.mutate(id, |node| {
      let event = json!({
        "label": label,
        "data": data,
        "timestamp": Utc::now().to_rfc3339(),
      });
      match node.metadata.get_mut("events") {
        Some(Value::Array(events)) => events.push(event),
        _ => {
          node
            .metadata
            .insert("events".to_string(), Value::Array(vec![event]));
        }
      }
    })
  }

  /// A copy of the whole tree, or `None` before the root is added.
  ///
  /// Secret values are masked in outputs, errors and metadata.
  pub fn snapshot(&self) -> Option<ExecutionNode> {
    self.shared.snapshot()
  }

  /// A copy of one node's subtree.
  pub fn node(&self, id: &str) -> Option<ExecutionNode> {
    self.shared.state.lock().build(id)
  }

  /// Whether `id` has finished in this run, or finished without error in the
  /// prior run.
  pub fn is_completed(&self, id: &str) -> bool {
    let current = self
      .shared
      .state
      .lock()
      .nodes
      .get(id)
      .is_some_and(|record| record.node.is_completed());
    current || self.prior_completed(id)
  }

  /// Whether the prior run finished `id` without error.
  pub fn prior_completed(&self, id: &str) -> bool {
    self
      .shared
      .prior
      .as_ref()
      .and_then(|prior| prior.find(id))
      .is_some_and(ExecutionNode::is_successful)
  }

  /// Wait until every update made before this call has been acknowledged by
  /// the sink.
  ///
  /// Returns the transport error if an attempt covering those updates fails.
  /// The updates stay pending and are retried by the next update or barrier.
  pub async fn wait_for_pending_updates(&self) -> Result<(), CheckpointError> {
    let target = self.shared.scheduled.load(Ordering::SeqCst);
    let mut status = self.shared.status.subscribe();
    let baseline = {
      let current = status.borrow_and_update();
      if current.acked >= target {
        return Ok(());
      }
      current.attempts
    };
    let _ = self.wake.send(());

    loop {
      {
        let current = status.borrow_and_update();
        if current.acked >= target {
          return Ok(());
        }
        if let Some(failure) = &current.failure {
          if failure.attempt > baseline && failure.version >= target {
            return Err(CheckpointError::Transport {
              message: failure.message.clone(),
            });
          }
        }
      }
      if status.changed().await.is_err() {
        return Err(CheckpointError::transport("checkpoint worker stopped"));
      }
    }
  }

  fn mutate(&self, id: &str, apply: impl FnOnce(&mut ExecutionNode)) -> Result<(), CheckpointError> {
    apply(&mut self.shared.state.lock().record_mut(id)?.node);
    self.schedule();
    Ok(())
  }

  fn schedule(&self) {
    self.shared.scheduled.fetch_add(1, Ordering::SeqCst);
    let _ = self.wake.send(());
  }
}

impl fmt::Debug for CheckpointManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CheckpointManager")
      .field("workflow_name", &self.shared.workflow_name)
      .field("execution_id", &self.execution_id())
      .field("scheduled", &self.shared.scheduled.load(Ordering::SeqCst))
      .finish()
  }
}
