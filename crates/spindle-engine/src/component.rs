//! Components and invocations.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{BoxError, EngineError};
use crate::invoke;
use crate::resolve::{ResolveOptions, resolve_with};
use crate::value::{Output, Resolvable, StreamingResult};

/// Per-component options, merged with call-site options on invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentOptions {
  /// Name to record instead of the component's declared name.
  pub name: Option<String>,
  pub metadata: Map<String, Value>,
  /// Prop keys whose values are redacted in the checkpoint.
  pub secret_props: Vec<String>,
}

impl ComponentOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn with_secret(mut self, key: impl Into<String>) -> Self {
    self.secret_props.push(key.into());
    self
  }

  pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
    self.metadata.insert(key.into(), value);
    self
  }

  /// Overlay call-site options on these defaults.
  ///
  /// The call-site name and metadata entries win; secret keys are unioned.
  pub fn merge(&self, call_site: &ComponentOptions) -> ComponentOptions {
    let mut metadata = self.metadata.clone();
    metadata.extend(call_site.metadata.clone());

    let mut secret_props = self.secret_props.clone();
    for key in &call_site.secret_props {
      if !secret_props.contains(key) {
        secret_props.push(key.clone());
      }
    }

    ComponentOptions {
      name: call_site.name.clone().or_else(|| self.name.clone()),
      metadata,
      secret_props,
    }
  }
}

/// A named asynchronous unit of work.
///
/// Components are stateless and may run many times concurrently. The body
/// returns a [`Resolvable`], which may itself contain nested invocations.
#[async_trait]
pub trait Component: Send + Sync {
  fn name(&self) -> &str;

  fn options(&self) -> ComponentOptions {
    ComponentOptions::default()
  }

  async fn run(&self, props: Value) -> Result<Resolvable, BoxError>;
}

/// A component whose result is a stream of string fragments.
#[async_trait]
pub trait StreamComponent: Send + Sync {
  fn name(&self) -> &str;

  fn options(&self) -> ComponentOptions {
    ComponentOptions::default()
  }

  async fn run(&self, props: Value) -> Result<StreamingResult, BoxError>;
}

/// A [`Component`] backed by a closure.
pub struct FnComponent<F> {
  name: String,
  options: ComponentOptions,
  body: F,
}

impl<F> FnComponent<F> {
  pub fn new(name: impl Into<String>, body: F) -> Self {
    Self {
      name: name.into(),
      options: ComponentOptions::default(),
      body,
    }
  }

  pub fn with_options(mut self, options: ComponentOptions) -> Self {
    self.options = options;
    self
  }
}

#[async_trait]
impl<F, Fut, R> Component for FnComponent<F>
where
  F: Fn(Value) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
  R: Into<Resolvable> + 'static,
{
  fn name(&self) -> &str {
    &self.name
  }

  fn options(&self) -> ComponentOptions {
    self.options.clone()
  }

  async fn run(&self, props: Value) -> Result<Resolvable, BoxError> {
    (self.body)(props).await.map(Into::into)
  }
}

/// A [`StreamComponent`] backed by a closure.
pub struct FnStreamComponent<F> {
  name: String,
  options: ComponentOptions,
  body: F,
}

impl<F> FnStreamComponent<F> {
  pub fn new(name: impl Into<String>, body: F) -> Self {
    Self {
      name: name.into(),
      options: ComponentOptions::default(),
      body,
    }
  }

  pub fn with_options(mut self, options: ComponentOptions) -> Self {
    self.options = options;
    self
  }
}

#[async_trait]
impl<F, Fut> StreamComponent for FnStreamComponent<F>
where
  F: Fn(Value) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<StreamingResult, BoxError>> + Send + 'static,
{
  fn name(&self) -> &str {
    &self.name
  }

  fn options(&self) -> ComponentOptions {
    self.options.clone()
  }

  async fn run(&self, props: Value) -> Result<StreamingResult, BoxError> {
    (self.body)(props).await
  }
}

/// Build a component from a closure.
pub fn component<F, Fut, R>(name: impl Into<String>, body: F) -> Arc<dyn Component>
where
  F: Fn(Value) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
  R: Into<Resolvable> + 'static,
{
  Arc::new(FnComponent::new(name, body))
}

/// Build a streaming component from a closure.
pub fn stream_component<F, Fut>(name: impl Into<String>, body: F) -> Arc<dyn StreamComponent>
where
  F: Fn(Value) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<StreamingResult, BoxError>> + Send + 'static,
{
  Arc::new(FnStreamComponent::new(name, body))
}

/// How a streaming component's output is consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamMode {
  /// Forward fragments live, checkpointing partial output as they arrive.
  #[default]
  Stream,
  /// Drain the stream inside the engine and record only the aggregate.
  Buffer,
}

#[derive(Clone)]
pub(crate) enum Target {
  Component(Arc<dyn Component>),
  Stream(Arc<dyn StreamComponent>, StreamMode),
}

impl Target {
  pub(crate) fn name(&self) -> &str {
    match self {
      Self::Component(component) => component.name(),
      Self::Stream(component, _) => component.name(),
    }
  }

  pub(crate) fn options(&self) -> ComponentOptions {
    match self {
      Self::Component(component) => component.options(),
      Self::Stream(component, _) => component.options(),
    }
  }
}

/// A pending call of a component with props and call-site options.
///
/// An invocation does nothing until it is run or resolved; returning one from
/// a component body nests the callee under the caller in the checkpoint
/// tree.
#[derive(Clone)]
pub struct Invocation {
  pub(crate) target: Target,
  pub(crate) props: Value,
  pub(crate) options: ComponentOptions,
}

impl Invocation {
  pub fn new(component: Arc<dyn Component>, props: Value) -> Self {
    Self {
      target: Target::Component(component),
      props,
      options: ComponentOptions::default(),
    }
  }

  pub fn stream(component: Arc<dyn StreamComponent>, props: Value) -> Self {
    Self {
      target: Target::Stream(component, StreamMode::Stream),
      props,
      options: ComponentOptions::default(),
    }
  }

  /// Consume a streaming component in buffer mode.
  pub fn buffered(mut self) -> Self {
    if let Target::Stream(_, mode) = &mut self.target {
      *mode = StreamMode::Buffer;
    }
    self
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.options.name = Some(name.into());
    self
  }

  pub fn with_secret(mut self, key: impl Into<String>) -> Self {
    self.options.secret_props.push(key.into());
    self
  }

  pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
    self.options.metadata.insert(key.into(), value);
    self
  }

  pub fn with_options(mut self, options: ComponentOptions) -> Self {
    self.options = options;
    self
  }

  /// The name this invocation records in the checkpoint tree.
  pub fn name(&self) -> String {
    self
      .target
      .options()
      .merge(&self.options)
      .name
      .unwrap_or_else(|| self.target.name().to_string())
  }

  /// Run the invocation; a streaming result is returned live.
  pub async fn run(self) -> Result<Output, EngineError> {
    let result = invoke::execute(self).await?;
    resolve_with(result, ResolveOptions::default()).await
  }

  /// Run the invocation and resolve its result to plain JSON.
  pub async fn value(self) -> Result<Value, EngineError> {
    let result = invoke::execute(self).await?;
    crate::resolve::resolve(result).await
  }
}

impl fmt::Debug for Invocation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Invocation")
      .field("component", &self.name())
      .field("props", &self.props)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_merge_prefers_call_site_and_unions_secrets() {
    let defaults = ComponentOptions::new()
      .with_name("Default")
      .with_secret("apiKey")
      .with_metadata("tier", json!("free"));
    let call_site = ComponentOptions::new()
      .with_name("Override")
      .with_secret("token")
      .with_secret("apiKey")
      .with_metadata("tier", json!("pro"));

    let merged = defaults.merge(&call_site);
    assert_eq!(merged.name.as_deref(), Some("Override"));
    assert_eq!(merged.secret_props, vec!["apiKey", "token"]);
    assert_eq!(merged.metadata["tier"], "pro");
  }

  #[test]
  fn test_invocation_name_falls_back_to_component() {
    let echo = component("Echo", |props: Value| async move { Ok::<_, BoxError>(props) });
    assert_eq!(Invocation::new(echo.clone(), json!({})).name(), "Echo");
    assert_eq!(
      Invocation::new(echo, json!({})).with_name("Loud").name(),
      "Loud"
    );
  }
}
