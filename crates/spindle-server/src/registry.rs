//! Workflows the server can run.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Value, json};
use spindle_engine::Workflow;

use crate::error::ServerError;

/// A workflow with the schemas its input and output are checked against.
#[derive(Clone)]
pub struct RegisteredWorkflow {
  pub workflow: Workflow,
  pub description: Option<String>,
  pub input_schema: Option<Value>,
  pub output_schema: Option<Value>,
}

impl RegisteredWorkflow {
  pub fn new(workflow: Workflow) -> Self {
    Self {
      workflow,
      description: None,
      input_schema: None,
      output_schema: None,
    }
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = Some(description.into());
    self
  }

  pub fn with_input_schema(mut self, schema: Value) -> Self {
    self.input_schema = Some(schema);
    self
  }

  pub fn with_output_schema(mut self, schema: Value) -> Self {
    self.output_schema = Some(schema);
    self
  }

  pub fn name(&self) -> &str {
    self.workflow.name()
  }

  pub fn describe(&self) -> Value {
    json!({
      "name": self.name(),
      "description": self.description,
      "streaming": self.workflow.is_streaming(),
      "inputSchema": self.input_schema,
      "outputSchema": self.output_schema,
    })
  }
}

/// Name-indexed set of runnable workflows.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
  workflows: Arc<RwLock<BTreeMap<String, RegisteredWorkflow>>>,
}

impl WorkflowRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, workflow: RegisteredWorkflow) -> Result<(), ServerError> {
    let mut workflows = self.workflows.write();
    let name = workflow.name().to_string();
    if workflows.contains_key(&name) {
      return Err(ServerError::AlreadyRegistered(name));
    }
    workflows.insert(name, workflow);
    Ok(())
  }

  pub fn get(&self, name: &str) -> Option<RegisteredWorkflow> {
    self.workflows.read().get(name).cloned()
  }

  /// All workflows, ordered by name.
  pub fn list(&self) -> Vec<RegisteredWorkflow> {
    self.workflows.read().values().cloned().collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use spindle_engine::{BoxError, component};

  fn echo(name: &str) -> RegisteredWorkflow {
    let root = component("Echo", |props: Value| async move { Ok::<_, BoxError>(props) });
    RegisteredWorkflow::new(Workflow::new(name, root))
  }

  #[test]
  fn test_duplicate_names_are_rejected() {
    let registry = WorkflowRegistry::new();
    registry.register(echo("b")).unwrap();
    registry.register(echo("a")).unwrap();
    assert!(matches!(
      registry.register(echo("a")),
      Err(ServerError::AlreadyRegistered(_))
    ));

    let names: Vec<String> = registry.list().iter().map(|w| w.name().to_string()).collect();
    assert_eq!(names, vec!["a", "b"]);
  }
}
