//! Spindle Server
//!
//! A long-lived process that runs registered workflows on request. Each
//! execution moves through `queued -> starting -> running -> completed |
//! failed`; every status change and progress message is appended to the
//! execution's message log and broadcast to live subscribers. External input
//! reaches suspended nodes through the [`InputBroker`], keyed by execution id
//! and node id, whichever of ask and fulfillment comes first.

mod broker;
mod error;
mod log;
mod orchestrator;
mod registry;
mod routes;
mod server;
mod sink;
mod state;

pub use broker::{ExecutionInputs, FulfillOutcome, InputBroker};
pub use error::{ServerError, ServerResult};
pub use log::status_message;
pub use orchestrator::{ExecutionHandle, Orchestrator, OrchestratorConfig};
pub use registry::{RegisteredWorkflow, WorkflowRegistry};
pub use routes::{EXECUTION_ID_HEADER, NDJSON, router};
pub use server::{Server, ServerConfig};
pub use sink::StoreCheckpointSink;
pub use state::AppState;
