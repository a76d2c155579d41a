//! Values that component bodies return before resolution.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::component::Invocation;
use crate::error::BoxError;

/// A boxed stream of string fragments.
pub type ComponentStream = Pin<Box<dyn Stream<Item = Result<String, BoxError>> + Send>>;

/// Folds every fragment seen so far into one value.
pub type Aggregator = Arc<dyn Fn(&[String]) -> Value + Send + Sync>;

/// A lazy, single-pass sequence of string fragments plus the aggregator that
/// produces its final value.
///
/// The default aggregator concatenates fragments in emission order.
pub struct StreamingResult {
  stream: ComponentStream,
  aggregator: Aggregator,
}

impl StreamingResult {
  pub fn new<S>(stream: S) -> Self
  where
    S: Stream<Item = Result<String, BoxError>> + Send + 'static,
  {
    Self {
      stream: Box::pin(stream),
      aggregator: Arc::new(concat),
    }
  }

  /// A stream over already-known fragments.
  pub fn from_fragments<I, T>(fragments: I) -> Self
  where
    I: IntoIterator<Item = T>,
    T: Into<String>,
  {
    let fragments: Vec<Result<String, BoxError>> =
      fragments.into_iter().map(|f| Ok(f.into())).collect();
    Self::new(futures::stream::iter(fragments))
  }

  /// A single-fragment stream whose aggregate is exactly `value`.
  ///
  /// Used when a streaming node is restored from an earlier run.
  pub fn replay(value: Value) -> Self {
    let fragment = match &value {
      Value::String(s) => s.clone(),
      Value::Null => String::new(),
      other => other.to_string(),
    };
    Self::from_fragments([fragment]).with_aggregator(move |_| value.clone())
  }

  pub fn with_aggregator<F>(mut self, aggregator: F) -> Self
  where
    F: Fn(&[String]) -> Value + Send + Sync + 'static,
  {
    self.aggregator = Arc::new(aggregator);
    self
  }

  /// Fold `fragments` with this stream's aggregator.
  pub fn aggregate(&self, fragments: &[String]) -> Value {
    (self.aggregator)(fragments)
  }

  pub fn into_parts(self) -> (ComponentStream, Aggregator) {
    (self.stream, self.aggregator)
  }

  pub fn from_parts(stream: ComponentStream, aggregator: Aggregator) -> Self {
    Self { stream, aggregator }
  }

  /// Drain the stream and return the aggregate.
  pub async fn collect(mut self) -> Result<Value, BoxError> {
    let mut fragments = Vec::new();
    while let Some(fragment) = self.stream.next().await {
      fragments.push(fragment?);
    }
    Ok((self.aggregator)(&fragments))
  }
}

fn concat(fragments: &[String]) -> Value {
  Value::String(fragments.concat())
}

impl Stream for StreamingResult {
  type Item = Result<String, BoxError>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.stream.as_mut().poll_next(cx)
  }
}

impl fmt::Debug for StreamingResult {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StreamingResult").finish_non_exhaustive()
  }
}

/// An unresolved value.
///
/// Component bodies return a `Resolvable`; the resolver turns it into plain
/// JSON by awaiting futures, running nested invocations and resolving
/// collection elements concurrently.
pub enum Resolvable {
  Value(Value),
  List(Vec<Resolvable>),
  /// Keyed collection; key order is preserved.
  Map(Vec<(String, Resolvable)>),
  Future(BoxFuture<'static, Result<Resolvable, BoxError>>),
  Invoke(Invocation),
  Stream(StreamingResult),
}

impl Resolvable {
  /// Wrap a future producing anything convertible into a `Resolvable`.
  pub fn future<F, T>(fut: F) -> Self
  where
    F: Future<Output = Result<T, BoxError>> + Send + 'static,
    T: Into<Resolvable>,
  {
    Self::Future(Box::pin(async move { fut.await.map(Into::into) }))
  }

  pub fn list<I, T>(items: I) -> Self
  where
    I: IntoIterator<Item = T>,
    T: Into<Resolvable>,
  {
    Self::List(items.into_iter().map(Into::into).collect())
  }

  pub fn map<I, K, T>(entries: I) -> Self
  where
    I: IntoIterator<Item = (K, T)>,
    K: Into<String>,
    T: Into<Resolvable>,
  {
    Self::Map(
      entries
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect(),
    )
  }

  /// Whether the value needs no further resolution.
  pub fn is_plain(&self) -> bool {
    matches!(self, Self::Value(_))
  }
}

impl fmt::Debug for Resolvable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
      Self::List(items) => f.debug_tuple("List").field(items).finish(),
      Self::Map(entries) => f.debug_tuple("Map").field(entries).finish(),
      Self::Future(_) => f.write_str("Future"),
      Self::Invoke(invocation) => f.debug_tuple("Invoke").field(invocation).finish(),
      Self::Stream(_) => f.write_str("Stream"),
    }
  }
}

impl From<Value> for Resolvable {
  fn from(value: Value) -> Self {
    Self::Value(value)
  }
}

impl From<&str> for Resolvable {
  fn from(value: &str) -> Self {
    Self::Value(Value::String(value.to_string()))
  }
}

impl From<String> for Resolvable {
  fn from(value: String) -> Self {
    Self::Value(Value::String(value))
  }
}

impl From<Vec<Resolvable>> for Resolvable {
  fn from(items: Vec<Resolvable>) -> Self {
    Self::List(items)
  }
}

impl From<Invocation> for Resolvable {
  fn from(invocation: Invocation) -> Self {
    Self::Invoke(invocation)
  }
}

impl From<StreamingResult> for Resolvable {
  fn from(stream: StreamingResult) -> Self {
    Self::Stream(stream)
  }
}

/// A resolved value.
///
/// A top-level stream is returned live unless the caller asked for
/// materialization.
#[derive(Debug)]
pub enum Output {
  Value(Value),
  Stream(StreamingResult),
}

impl Output {
  /// The plain value, draining a stream if necessary.
  pub async fn into_value(self) -> Result<Value, BoxError> {
    match self {
      Self::Value(value) => Ok(value),
      Self::Stream(stream) => stream.collect().await,
    }
  }

  pub fn as_value(&self) -> Option<&Value> {
    match self {
      Self::Value(value) => Some(value),
      Self::Stream(_) => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_default_aggregation_concatenates() {
    let stream = StreamingResult::from_fragments(["a", "b", "c"]);
    assert_eq!(stream.collect().await.unwrap(), json!("abc"));
  }

  #[tokio::test]
  async fn test_custom_aggregator() {
    let stream = StreamingResult::from_fragments(["1", "2", "3"]).with_aggregator(|fragments| {
      json!(fragments.iter().filter_map(|f| f.parse::<i64>().ok()).sum::<i64>())
    });
    assert_eq!(stream.collect().await.unwrap(), json!(6));
  }

  #[tokio::test]
  async fn test_replay_yields_prior_value() {
    let stream = StreamingResult::replay(json!({ "n": 1 }));
    assert_eq!(stream.collect().await.unwrap(), json!({ "n": 1 }));
  }

  #[tokio::test]
  async fn test_stream_error_surfaces() {
    let stream = StreamingResult::new(futures::stream::iter(vec![
      Ok("a".to_string()),
      Err::<String, BoxError>("broken".into()),
    ]));
    let err = stream.collect().await.unwrap_err();
    assert_eq!(err.to_string(), "broken");
  }
}
