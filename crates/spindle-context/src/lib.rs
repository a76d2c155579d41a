//! Spindle Context
//!
//! Ambient, branch-local state for component trees. An [`ExecutionContext`]
//! is an immutable, parent-linked map keyed by typed [`ContextKey`]s. It is
//! installed in tokio task-local storage for the duration of a future, so
//! nested code can read it with [`ExecutionContext::current`] instead of
//! threading it through every call.
//!
//! # Usage
//!
//! ```ignore
//! static STORAGE: ContextKey<Arc<BlobClient>> = ContextKey::new("app.storage");
//!
//! provide(Scope::new().with(&STORAGE, client), async {
//!   let client = ExecutionContext::current()
//!     .and_then(|ctx| ctx.get(&STORAGE))
//!     .expect("storage provided");
//!   // ...
//! })
//! .await;
//! ```

mod context;
mod key;

pub use context::{CURRENT_NODE, ExecutionContext, Scope, provide, spawn};
pub use key::ContextKey;
