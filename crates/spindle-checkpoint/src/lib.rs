//! Spindle Checkpoint
//!
//! Records every component invocation of a run as a node in a checkpoint
//! tree and streams the tree to durable storage.
//!
//! ```text
//!                 ┌──────────────────────┐
//!   engine ──────►│  CheckpointManager   │  add_node / complete_node / ...
//!                 │  (in-memory tree)    │
//!                 └──────────┬───────────┘
//!                            │ coalesced, background
//!                            ▼
//!                 ┌──────────────────────┐
//!                 │   CheckpointSink     │  NoopSink | MemorySink | HttpCheckpointSink
//!                 └──────────────────────┘
//! ```
//!
//! Node ids are deterministic (see [`node_id`]), so a run given the tree of an
//! earlier run can recognize the work that already finished and splice it in
//! instead of repeating it.

mod error;
mod http;
mod identity;
mod manager;
mod node;
mod redact;
mod sink;
mod wire;

pub use error::CheckpointError;
pub use http::{HttpCheckpointSink, HttpSinkConfig};
pub use identity::{canonical_json, node_id};
pub use manager::{AddedNode, CheckpointConfig, CheckpointManager, NewNode, ReplayMode};
pub use node::{ExecutionNode, OUTPUT_MASKED_KEY};
pub use redact::{SECRET_PLACEHOLDER, mask_secrets, redact_props};
pub use sink::{CheckpointBatch, CheckpointSink, MemorySink, NoopSink};
pub use wire::{
  CheckpointReceipt, WireCheckpoint, decode_execution, encode_execution, gunzip, gzip,
};
