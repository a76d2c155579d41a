//! Spindle Engine
//!
//! Executes trees of components. A component body may return nested
//! invocations, futures, collections and streams; the engine resolves them,
//! records every invocation as a checkpoint node under its caller, and lets
//! any node suspend until external input arrives.
//!
//! ```text
//!   Workflow::run(props)
//!     └─ WorkflowExecutionContext (checkpoint, notifier, suspend handler)
//!          └─ Root ─┬─ Child ── Leaf
//!                   ├─ Stream ──► fragments (partial output checkpointed)
//!                   └─ RequestInput ──► SuspendHandler ──► payload
//! ```
//!
//! The context of the running branch travels in tokio task-local storage
//! (see `spindle-context`), so nested components find their parent node and
//! the run's state without parameters being threaded through.
//!
//! # Example
//!
//! ```ignore
//! let child = component("Child", |props: Value| async move {
//!   Ok::<_, BoxError>(json!(format!("processed: {}", props["input"].as_str().unwrap_or_default())))
//! });
//! let parent = component("Parent", move |props: Value| {
//!   let child = child.clone();
//!   async move { Ok::<_, BoxError>(Invocation::new(child, props)) }
//! });
//!
//! let run = Workflow::new("example", parent)
//!   .run(json!({ "input": "test-value" }), RunOptions::default())
//!   .await?;
//! assert_eq!(run.output, json!("processed: test-value"));
//! ```

mod component;
mod error;
mod events;
mod invoke;
mod resolve;
mod suspend;
mod value;
mod workflow;
mod workflow_context;

pub use component::{
  Component, ComponentOptions, FnComponent, FnStreamComponent, Invocation, StreamComponent,
  StreamMode, component, stream_component,
};
pub use error::{BoxError, EngineError, serialize_error};
pub use events::{ChannelNotifier, NoopNotifier, ProgressEvent, ProgressNotifier};
pub use invoke::{IN_PROGRESS, invoke, invoke_buffered, stream};
pub use resolve::{ResolveOptions, resolve, resolve_with};
pub use suspend::{
  InputKind, InputRequest, REQUEST_INPUT, SuspendHandler, SuspendOptions, Trigger, WAIT_FOR_INPUT,
  callback_url, request_input, validate_schema, wait_for_input,
};
pub use value::{Aggregator, ComponentStream, Output, Resolvable, StreamingResult};
pub use workflow::{
  RunOptions, Workflow, WorkflowRun, WorkflowStream, current_node_id, emit_event,
};
pub use workflow_context::{RunIdentity, WORKFLOW, WorkflowExecutionContext};

pub use spindle_checkpoint::ReplayMode;
pub use spindle_context::{ContextKey, ExecutionContext, Scope, provide};
