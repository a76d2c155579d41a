//! Parent-linked immutable execution context.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::key::{ContextKey, KeyId};

tokio::task_local! {
  static CURRENT: ExecutionContext;
}

/// The id of the checkpoint node that is currently executing.
///
/// Set by the invocation protocol when it enters a component body, read when
/// a nested component needs to know its parent. A new run sets it to `None`
/// so its root does not attach to the node that started it.
pub static CURRENT_NODE: ContextKey<Option<String>> = ContextKey::new("spindle.current_node");

type Entry = Arc<dyn Any + Send + Sync>;
type Teardown = Box<dyn FnOnce() + Send>;

/// A set of entries to overlay when deriving a context.
#[derive(Clone, Default)]
pub struct Scope {
  entries: HashMap<KeyId, Entry>,
}

impl Scope {
  /// Create an empty scope.
  pub fn new() -> Self {
    Self::default()
  }

  /// Add an entry, replacing any earlier entry for the same key.
  pub fn with<T: Send + Sync + 'static>(mut self, key: &ContextKey<T>, value: T) -> Self {
    self.insert(key, value);
    self
  }

  /// Add an entry in place.
  pub fn insert<T: Send + Sync + 'static>(&mut self, key: &ContextKey<T>, value: T) {
    self.entries.insert(key.id(), Arc::new(value));
  }

  /// Overlay `other` on top of this scope.
  pub fn merge(mut self, other: Scope) -> Self {
    self.entries.extend(other.entries);
    self
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

impl fmt::Debug for Scope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_set()
      .entries(self.entries.keys().map(|k| k.name))
      .finish()
  }
}

/// An immutable snapshot of ambient values for one branch of a call tree.
///
/// A context holds only the entries it introduced plus a pointer to its
/// parent; lookups walk the parent chain. Contexts are never mutated, so
/// sibling branches that derive from the same parent can run concurrently
/// without observing each other's entries.
///
/// The context is carried in tokio task-local storage. Code running inside
/// [`ExecutionContext::scope`] can call [`ExecutionContext::current`] without
/// the context being passed explicitly. There is no process-wide fallback:
/// outside a scope `current()` returns `None`.
#[derive(Clone)]
pub struct ExecutionContext {
  inner: Arc<Inner>,
}

struct Inner {
  entries: HashMap<KeyId, Entry>,
  parent: Option<ExecutionContext>,
  teardown: Mutex<Vec<Teardown>>,
}

impl Drop for Inner {
  fn drop(&mut self) {
    // Every clone of this context and every context derived from it is gone,
    // so all work scoped under it has settled.
    for callback in self.teardown.get_mut().drain(..) {
      callback();
    }
  }
}

impl ExecutionContext {
  /// Create a root context with no entries.
  pub fn root() -> Self {
    Self::root_with(Scope::new())
  }

  /// Create a root context holding the given entries.
  pub fn root_with(scope: Scope) -> Self {
    Self {
      inner: Arc::new(Inner {
        entries: scope.entries,
        parent: None,
        teardown: Mutex::new(Vec::new()),
      }),
    }
  }

  /// The context of the current task, if one is installed.
  pub fn current() -> Option<Self> {
    CURRENT.try_with(|ctx| ctx.clone()).ok()
  }

  /// Derive a child context that overlays `scope` on this one.
  pub fn derive(&self, scope: Scope) -> Self {
    Self {
      inner: Arc::new(Inner {
        entries: scope.entries,
        parent: Some(self.clone()),
        teardown: Mutex::new(Vec::new()),
      }),
    }
  }

  /// Derive a child context and register `on_complete` to run once the child
  /// and everything derived from it has been dropped.
  pub fn derive_with_teardown<F>(&self, scope: Scope, on_complete: F) -> Self
  where
    F: FnOnce() + Send + 'static,
  {
    let ctx = self.derive(scope);
    ctx.inner.teardown.lock().push(Box::new(on_complete));
    ctx
  }

  /// Look up a value, walking parent contexts until it is found.
  pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &ContextKey<T>) -> Option<T> {
    self.get_arc(key).map(|value| (*value).clone())
  }

  /// Look up a value without cloning it.
  pub fn get_arc<T: Send + Sync + 'static>(&self, key: &ContextKey<T>) -> Option<Arc<T>> {
    let id = key.id();
    let mut ctx = Some(self);
    while let Some(current) = ctx {
      if let Some(entry) = current.inner.entries.get(&id) {
        return entry.clone().downcast::<T>().ok();
      }
      ctx = current.inner.parent.as_ref();
    }
    None
  }

  /// Look up a value, falling back to `default`.
  pub fn get_or<T: Clone + Send + Sync + 'static>(&self, key: &ContextKey<T>, default: T) -> T {
    self.get(key).unwrap_or(default)
  }

  pub fn contains<T: Send + Sync + 'static>(&self, key: &ContextKey<T>) -> bool {
    self.get_arc(key).is_some()
  }

  /// The context this one was derived from.
  pub fn parent(&self) -> Option<&ExecutionContext> {
    self.inner.parent.as_ref()
  }

  /// The id of the checkpoint node currently executing in this branch.
  pub fn current_node(&self) -> Option<String> {
    self.get(&CURRENT_NODE).flatten()
  }

  /// Run `fut` with this context installed as the task-local context.
  pub fn scope<F: Future>(self, fut: F) -> impl Future<Output = F::Output> {
    CURRENT.scope(self, fut)
  }

  /// Run a synchronous closure with this context installed.
  pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
    CURRENT.sync_scope(self, f)
  }

  /// Run `fut` in a child context whose current node is `node_id`.
  pub fn with_current_node<F: Future>(
    &self,
    node_id: impl Into<String>,
    fut: F,
  ) -> impl Future<Output = F::Output> {
    self
      .derive(Scope::new().with(&CURRENT_NODE, Some(node_id.into())))
      .scope(fut)
  }

  fn depth(&self) -> usize {
    let mut depth = 0;
    let mut ctx = self.parent();
    while let Some(parent) = ctx {
      depth += 1;
      ctx = parent.parent();
    }
    depth
  }
}

impl fmt::Debug for ExecutionContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut keys: Vec<&str> = self.inner.entries.keys().map(|k| k.name).collect();
    keys.sort_unstable();
    f.debug_struct("ExecutionContext")
      .field("depth", &self.depth())
      .field("keys", &keys)
      .finish()
  }
}

/// Run `fut` in a context derived from the current one (or a fresh root)
/// with `scope` overlaid.
///
/// This is how ambient values such as storage clients are injected into a
/// sub-tree.
pub async fn provide<F: Future>(scope: Scope, fut: F) -> F::Output {
  let ctx = match ExecutionContext::current() {
    Some(ctx) => ctx.derive(scope),
    None => ExecutionContext::root_with(scope),
  };
  ctx.scope(fut).await
}

/// Spawn a tokio task that inherits the current context.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
  F: Future + Send + 'static,
  F::Output: Send + 'static,
{
  match ExecutionContext::current() {
    Some(ctx) => tokio::spawn(ctx.scope(fut)),
    None => tokio::spawn(fut),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

  static LEFT: ContextKey<u32> = ContextKey::new("test.left");
  static RIGHT: ContextKey<u32> = ContextKey::new("test.right");
  static LABEL: ContextKey<String> = ContextKey::new("test.label");

  #[test]
  fn test_lookup_walks_parents() {
    let root = ExecutionContext::root_with(Scope::new().with(&LABEL, "root".to_string()));
    let child = root.derive(Scope::new().with(&LEFT, 1));
    let grandchild = child.derive(Scope::new());

    assert_eq!(grandchild.get(&LABEL), Some("root".to_string()));
    assert_eq!(grandchild.get(&LEFT), Some(1));
    assert_eq!(root.get(&LEFT), None);
  }

  #[test]
  fn test_derived_entry_shadows_parent() {
    let root = ExecutionContext::root_with(Scope::new().with(&LABEL, "outer".to_string()));
    let child = root.derive(Scope::new().with(&LABEL, "inner".to_string()));

    assert_eq!(child.get(&LABEL).as_deref(), Some("inner"));
    assert_eq!(root.get(&LABEL).as_deref(), Some("outer"));
  }

  #[test]
  fn test_get_or_default() {
    let root = ExecutionContext::root();
    assert_eq!(root.get_or(&LEFT, 7), 7);
  }

  #[test]
  fn test_current_is_none_outside_scope() {
    assert!(ExecutionContext::current().is_none());
  }

  #[test]
  fn test_sync_scope_installs_context() {
    let ctx = ExecutionContext::root_with(Scope::new().with(&LEFT, 3));
    let seen = ctx.sync_scope(|| ExecutionContext::current().and_then(|c| c.get(&LEFT)));
    assert_eq!(seen, Some(3));
  }

  #[tokio::test]
  async fn test_sibling_branches_are_isolated() {
    let parent = ExecutionContext::root();

    let left = parent.clone().scope(async {
      let ctx = ExecutionContext::current().unwrap().derive(Scope::new().with(&LEFT, 1));
      ctx
        .scope(async {
          tokio::task::yield_now().await;
          let ctx = ExecutionContext::current().unwrap();
          (ctx.get(&LEFT), ctx.get(&RIGHT))
        })
        .await
    });

    let right = parent.clone().scope(async {
      let ctx = ExecutionContext::current().unwrap().derive(Scope::new().with(&RIGHT, 2));
      ctx
        .scope(async {
          tokio::task::yield_now().await;
          let ctx = ExecutionContext::current().unwrap();
          (ctx.get(&LEFT), ctx.get(&RIGHT))
        })
        .await
    });

    let (left_seen, right_seen) = futures::join!(left, right);

    assert_eq!(left_seen, (Some(1), None));
    assert_eq!(right_seen, (None, Some(2)));
    assert!(!parent.contains(&LEFT));
    assert!(!parent.contains(&RIGHT));
  }

  #[tokio::test]
  async fn test_with_current_node() {
    let root = ExecutionContext::root();
    let node = root
      .with_current_node("node-1", async {
        ExecutionContext::current().and_then(|c| c.current_node())
      })
      .await;

    assert_eq!(node.as_deref(), Some("node-1"));
    assert_eq!(root.current_node(), None);
  }

  #[tokio::test]
  async fn test_cleared_current_node_keeps_other_entries() {
    let root = ExecutionContext::root_with(Scope::new().with(&LABEL, "outer".to_string()));
    let seen = root
      .with_current_node("node-1", async {
        let ctx = ExecutionContext::current().unwrap();
        let cleared = ctx.derive(Scope::new().with(&CURRENT_NODE, None));
        (cleared.current_node(), cleared.get(&LABEL))
      })
      .await;

    assert_eq!(seen, (None, Some("outer".to_string())));
  }

  #[test]
  fn test_teardown_runs_after_all_descendants_drop() {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();

    let root = ExecutionContext::root();
    let scoped = root.derive_with_teardown(Scope::new(), move || flag.store(true, Ordering::SeqCst));
    let child = scoped.derive(Scope::new().with(&LEFT, 1));

    drop(scoped);
    assert!(!fired.load(Ordering::SeqCst));

    drop(child);
    assert!(fired.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn test_teardown_waits_for_spawned_branches() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let scoped =
      ExecutionContext::root().derive_with_teardown(Scope::new(), move || {
        counter.fetch_add(1, Ordering::SeqCst);
      });

    let handles = scoped
      .clone()
      .scope(async {
        (0..3)
          .map(|i| {
            spawn(async move {
              tokio::time::sleep(std::time::Duration::from_millis(5 * i)).await;
              ExecutionContext::current().is_some()
            })
          })
          .collect::<Vec<_>>()
      })
      .await;

    drop(scoped);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    for handle in handles {
      assert!(handle.await.unwrap());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_provide_derives_from_current() {
    let root = ExecutionContext::root_with(Scope::new().with(&LEFT, 1));
    let seen = root
      .scope(provide(Scope::new().with(&RIGHT, 2), async {
        let ctx = ExecutionContext::current().unwrap();
        (ctx.get(&LEFT), ctx.get(&RIGHT))
      }))
      .await;

    assert_eq!(seen, (Some(1), Some(2)));
  }
}
