//! The checkpoint tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata flag set on nodes whose recorded output had secrets masked.
pub const OUTPUT_MASKED_KEY: &str = "outputMasked";

/// One recorded component invocation.
///
/// Serialized in camelCase; this is the shape that is compressed and sent to
/// durable storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionNode {
  pub id: String,
  pub component_name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parent_id: Option<String>,
  pub start_time: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub end_time: Option<DateTime<Utc>>,
  /// Props with secret values redacted.
  pub props: Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub output: Option<Value>,
  #[serde(default)]
  pub children: Vec<ExecutionNode>,
  #[serde(default)]
  pub metadata: Map<String, Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<Value>,
}

impl ExecutionNode {
  /// Whether the node has an end time.
  pub fn is_completed(&self) -> bool {
    self.end_time.is_some()
  }

  /// Whether the node completed without an error attached.
  pub fn is_successful(&self) -> bool {
    self.is_completed() && self.error.is_none()
  }

  /// Whether secret masking rewrote the recorded output, so it no longer
  /// holds the value the component returned.
  pub fn output_masked(&self) -> bool {
    self.metadata.get(OUTPUT_MASKED_KEY) == Some(&Value::Bool(true))
  }

  /// Find a node in this subtree by id.
  pub fn find(&self, id: &str) -> Option<&ExecutionNode> {
    if self.id == id {
      return Some(self);
    }
    self.children.iter().find_map(|child| child.find(id))
  }

  /// All nodes of this subtree in depth-first pre-order.
  pub fn nodes(&self) -> Vec<&ExecutionNode> {
    let mut out = Vec::new();
    self.collect(&mut out);
    out
  }

  /// Number of nodes in this subtree.
  pub fn node_count(&self) -> usize {
    1 + self.children.iter().map(ExecutionNode::node_count).sum::<usize>()
  }

  fn collect<'a>(&'a self, out: &mut Vec<&'a ExecutionNode>) {
    out.push(self);
    for child in &self.children {
      child.collect(out);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn leaf(id: &str, parent: &str) -> ExecutionNode {
    ExecutionNode {
      id: id.to_string(),
      component_name: "Leaf".to_string(),
      parent_id: Some(parent.to_string()),
      start_time: Utc::now(),
      end_time: Some(Utc::now()),
      props: json!({}),
      output: Some(json!("ok")),
      children: vec![],
      metadata: Map::new(),
      error: None,
    }
  }

  #[test]
  fn test_find_and_count() {
    let mut root = leaf("root", "none");
    root.parent_id = None;
    root.children = vec![leaf("a", "root"), leaf("b", "root")];

    assert_eq!(root.node_count(), 3);
    assert_eq!(root.find("b").map(|n| n.id.as_str()), Some("b"));
    assert!(root.find("missing").is_none());
    let ids: Vec<&str> = root.nodes().iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["root", "a", "b"]);
  }

  #[test]
  fn test_serializes_camel_case() {
    let node = leaf("a", "root");
    let value = serde_json::to_value(&node).unwrap();

    assert_eq!(value["componentName"], "Leaf");
    assert_eq!(value["parentId"], "root");
    assert!(value.get("startTime").is_some());
    assert!(value.get("error").is_none());
  }

  #[test]
  fn test_successful_requires_no_error() {
    let mut node = leaf("a", "root");
    assert!(node.is_successful());

    node.error = Some(json!({ "message": "boom" }));
    assert!(node.is_completed());
    assert!(!node.is_successful());
  }
}
