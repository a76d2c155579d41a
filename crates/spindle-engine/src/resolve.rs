//! The value resolver.
//!
//! Turns a [`Resolvable`] into plain JSON:
//!
//! ```text
//!   Value         -> itself
//!   Future        -> await, resolve the result
//!   Invoke        -> run the invocation protocol, resolve the result
//!   List / Map    -> resolve every element concurrently, keep order / keys
//!   Stream        -> live at the top level, folded by its aggregator otherwise
//! ```
//!
//! Collection elements that need work are spawned before any of them is
//! awaited. The first failure is returned; siblings already running are left
//! to finish on their own.

use futures::future::{BoxFuture, try_join_all};
use serde_json::Value;

use crate::error::EngineError;
use crate::invoke;
use crate::value::{Output, Resolvable};

/// Options for [`resolve_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
  /// Fold a top-level stream into its aggregate instead of returning it.
  pub materialize_streams: bool,
}

/// Resolve a value completely, materializing any stream.
pub async fn resolve(value: impl Into<Resolvable>) -> Result<Value, EngineError> {
  resolve_value(value.into()).await
}

/// Resolve a value, returning a top-level stream live unless
/// `materialize_streams` is set.
pub async fn resolve_with(
  value: impl Into<Resolvable>,
  options: ResolveOptions,
) -> Result<Output, EngineError> {
  let mut current = value.into();
  loop {
    current = match current {
      Resolvable::Stream(stream) if !options.materialize_streams => {
        return Ok(Output::Stream(stream));
      }
      Resolvable::Future(fut) => fut.await.map_err(EngineError::from_resolve)?,
      Resolvable::Invoke(invocation) => invoke::execute(invocation).await?,
      other => return resolve_value(other).await.map(Output::Value),
    };
  }
}

fn resolve_value(value: Resolvable) -> BoxFuture<'static, Result<Value, EngineError>> {
  Box::pin(async move {
    match value {
      Resolvable::Value(value) => Ok(value),
      Resolvable::Future(fut) => {
        let next = fut.await.map_err(EngineError::from_resolve)?;
        resolve_value(next).await
      }
      Resolvable::Invoke(invocation) => {
        let next = invoke::execute(invocation).await?;
        resolve_value(next).await
      }
      Resolvable::Stream(stream) => stream.collect().await.map_err(EngineError::from_resolve),
      Resolvable::List(items) => resolve_all(items).await.map(Value::Array),
      Resolvable::Map(entries) => {
        let (keys, values): (Vec<String>, Vec<Resolvable>) = entries.into_iter().unzip();
        let values = resolve_all(values).await?;
        Ok(Value::Object(keys.into_iter().zip(values).collect()))
      }
    }
  })
}

enum Pending {
  Ready(Value),
  Spawned(tokio::task::JoinHandle<Result<Value, EngineError>>),
}

async fn resolve_all(items: Vec<Resolvable>) -> Result<Vec<Value>, EngineError> {
  // Start everything first, then wait.
  let pending: Vec<Pending> = items
    .into_iter()
    .map(|item| match item {
      Resolvable::Value(value) => Pending::Ready(value),
      other => Pending::Spawned(spindle_context::spawn(resolve_value(other))),
    })
    .collect();

  try_join_all(pending.into_iter().map(|item| async move {
    match item {
      Pending::Ready(value) => Ok(value),
      Pending::Spawned(handle) => handle.await.map_err(|err| EngineError::Task {
        message: err.to_string(),
      })?,
    }
  }))
  .await
}
