//! Deterministic node identity.
//!
//! A node id is a hash of `(component name, canonical props, parent id)`. The
//! same triple always yields the same id, which lets a new run recognize a node
//! completed by an earlier run.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Length of the hex digest suffix kept in node ids.
const DIGEST_CHARS: usize = 16;

/// Compute the id of a node.
///
/// Object key order in `props` does not affect the id; array element order
/// does.
pub fn node_id(component_name: &str, props: &Value, parent_id: Option<&str>) -> String {
  let mut hasher = Sha256::new();
  hasher.update(component_name.as_bytes());
  hasher.update([0u8]);
  hasher.update(canonical_json(props).as_bytes());
  hasher.update([0u8]);
  hasher.update(parent_id.unwrap_or_default().as_bytes());
  let digest = format!("{:x}", hasher.finalize());
  format!("{}:{}", component_name, &digest[..DIGEST_CHARS])
}

/// Serialize a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
  let mut out = String::new();
  write_canonical(value, &mut out);
  out
}

fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      out.push('{');
      for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        if let Some(item) = map.get(key) {
          write_canonical(item, out);
        }
      }
      out.push('}');
    }
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    other => out.push_str(&other.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_same_triple_same_id() {
    let props = json!({ "input": "x", "n": 1 });
    assert_eq!(
      node_id("Child", &props, Some("Parent:1")),
      node_id("Child", &props, Some("Parent:1"))
    );
  }

  #[test]
  fn test_each_input_changes_id() {
    let props = json!({ "input": "x" });
    let base = node_id("Child", &props, Some("p"));

    assert_ne!(base, node_id("Other", &props, Some("p")));
    assert_ne!(base, node_id("Child", &json!({ "input": "y" }), Some("p")));
    assert_ne!(base, node_id("Child", &props, Some("q")));
    assert_ne!(base, node_id("Child", &props, None));
  }

  #[test]
  fn test_key_order_is_irrelevant() {
    let a: Value = serde_json::from_str(r#"{"a":1,"b":{"y":2,"x":1}}"#).unwrap();
    let b: Value = serde_json::from_str(r#"{"b":{"x":1,"y":2},"a":1}"#).unwrap();
    assert_eq!(node_id("C", &a, None), node_id("C", &b, None));
  }

  #[test]
  fn test_array_order_matters() {
    assert_ne!(
      node_id("C", &json!({ "items": [1, 2] }), None),
      node_id("C", &json!({ "items": [2, 1] }), None)
    );
  }

  #[test]
  fn test_canonical_json_sorts_nested_keys() {
    let value = json!({ "b": [{ "d": 1, "c": 2 }], "a": null });
    assert_eq!(canonical_json(&value), r#"{"a":null,"b":[{"c":2,"d":1}]}"#);
  }

  #[test]
  fn test_id_is_prefixed_with_component_name() {
    let id = node_id("Summarize", &json!({}), None);
    assert!(id.starts_with("Summarize:"));
    assert_eq!(id.len(), "Summarize:".len() + DIGEST_CHARS);
  }
}
