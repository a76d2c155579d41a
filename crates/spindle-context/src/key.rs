//! Typed context keys.

use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;

/// A typed token identifying one entry in an [`ExecutionContext`](crate::ExecutionContext).
///
/// Keys are usually declared as statics next to the code that owns the value:
///
/// ```ignore
/// static STORAGE: ContextKey<Arc<BlobClient>> = ContextKey::new("app.storage");
/// ```
///
/// Two keys are the same entry only when both the name and the value type
/// match, so a lookup can never observe a value of the wrong type.
pub struct ContextKey<T> {
  name: &'static str,
  _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> ContextKey<T> {
  /// Create a new key.
  pub const fn new(name: &'static str) -> Self {
    Self {
      name,
      _marker: PhantomData,
    }
  }

  /// The symbolic name of the key.
  pub fn name(&self) -> &'static str {
    self.name
  }

  pub(crate) fn id(&self) -> KeyId {
    KeyId {
      name: self.name,
      type_id: TypeId::of::<T>(),
    }
  }
}

impl<T> fmt::Debug for ContextKey<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("ContextKey").field(&self.name).finish()
  }
}

/// Runtime identity of a key: its name plus its value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct KeyId {
  pub(crate) name: &'static str,
  type_id: TypeId,
}

#[cfg(test)]
mod tests {
  use super::*;

  static NAME: ContextKey<String> = ContextKey::new("test.name");
  static NAME_AS_NUMBER: ContextKey<u64> = ContextKey::new("test.name");

  #[test]
  fn test_same_name_different_type_is_different_key() {
    assert_eq!(NAME.name(), NAME_AS_NUMBER.name());
    assert_ne!(NAME.id(), NAME_AS_NUMBER.id());
  }

  #[test]
  fn test_key_identity_is_stable() {
    assert_eq!(NAME.id(), NAME.id());
  }
}
