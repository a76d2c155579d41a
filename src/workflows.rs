//! Workflows built into the binary.

use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use spindle_engine::{
  BoxError, Invocation, Resolvable, StreamingResult, SuspendOptions, Workflow, component,
  emit_event, request_input, stream_component,
};
use spindle_server::{RegisteredWorkflow, ServerError, WorkflowRegistry};

fn name_of(props: &Value) -> String {
  props["name"].as_str().unwrap_or("world").to_string()
}

/// `greet {name}`: a parent delegating to a child.
fn greet() -> RegisteredWorkflow {
  let format = component("FormatGreeting", |props: Value| async move {
    Ok::<_, BoxError>(json!(format!("hello {}", name_of(&props))))
  });
  let greet = component("Greet", move |props: Value| {
    let format = format.clone();
    async move { Ok::<_, BoxError>(Invocation::new(format, props)) }
  });

  RegisteredWorkflow::new(Workflow::new("greet", greet))
    .with_description("Greets `name` through a nested component")
    .with_input_schema(json!({
      "type": "object",
      "properties": { "name": { "type": "string" } },
    }))
    .with_output_schema(json!({ "type": "string" }))
}

/// `roll-call {names}`: one child per name, resolved concurrently.
fn roll_call() -> RegisteredWorkflow {
  let answer = component("Answer", |props: Value| async move {
    let delay = props["delayMs"].as_u64().unwrap_or_default();
    tokio::time::sleep(Duration::from_millis(delay)).await;
    Ok::<_, BoxError>(json!(format!("{} here", name_of(&props))))
  });
  let roll_call = component("RollCall", move |props: Value| {
    let answer = answer.clone();
    async move {
      let names: Vec<String> = props["names"]
        .as_array()
        .map(|names| {
          names
            .iter()
            .filter_map(|name| name.as_str().map(str::to_string))
            .collect()
        })
        .unwrap_or_default();
      let count = names.len() as u64;
      emit_event("roll_call_started", json!({ "count": count }))?;
      // Later names answer first; the result keeps input order.
      let calls = names.into_iter().enumerate().map(|(i, name)| {
        Invocation::new(
          answer.clone(),
          json!({ "name": name, "delayMs": (count - i as u64) * 20 }),
        )
      });
      Ok::<_, BoxError>(Resolvable::list(calls))
    }
  });

  RegisteredWorkflow::new(Workflow::new("roll-call", roll_call))
    .with_description("Invokes one child per entry of `names` concurrently")
    .with_input_schema(json!({
      "type": "object",
      "properties": { "names": { "type": "array", "items": { "type": "string" } } },
      "required": ["names"],
    }))
}

/// `spell {text}`: streams `text` one character at a time.
fn spell() -> RegisteredWorkflow {
  let spell = stream_component("Spell", |props: Value| async move {
    let text = props["text"].as_str().unwrap_or("spindle").to_string();
    let letters: Vec<String> = text.chars().map(String::from).collect();
    let stream = futures::stream::iter(letters).then(|letter| async move {
      tokio::time::sleep(Duration::from_millis(25)).await;
      Ok::<_, BoxError>(letter)
    });
    Ok::<_, BoxError>(StreamingResult::new(stream))
  });

  RegisteredWorkflow::new(Workflow::streaming("spell", spell))
    .with_description("Streams `text` one character at a time")
}

/// `approval {subject}`: suspends until someone approves or rejects.
fn approval() -> RegisteredWorkflow {
  let approval = component("Approval", |props: Value| async move {
    let subject = props["subject"].as_str().unwrap_or("request").to_string();
    let decision = request_input(
      json!({
        "type": "object",
        "properties": {
          "approved": { "type": "boolean" },
          "comment": { "type": "string" },
        },
        "required": ["approved"],
      }),
      SuspendOptions::new()
        .with_label(format!("approve {}", subject))
        .with_timeout_ms(24 * 60 * 60 * 1000),
    )
    .await?;

    Ok::<_, BoxError>(match decision {
      Some(decision) => json!({ "subject": subject, "decision": decision }),
      None => json!({ "subject": subject, "decision": null }),
    })
  });

  RegisteredWorkflow::new(Workflow::new("approval", approval))
    .with_description("Waits for an approval decision posted to its callback URL")
}

/// Every built-in workflow.
pub fn builtin() -> Result<WorkflowRegistry, ServerError> {
  let registry = WorkflowRegistry::new();
  for workflow in [greet(), roll_call(), spell(), approval()] {
    registry.register(workflow)?;
  }
  Ok(registry)
}

#[cfg(test)]
mod tests {
  use super::*;
  use spindle_engine::RunOptions;

  fn workflow(name: &str) -> Workflow {
    builtin().unwrap().get(name).unwrap().workflow
  }

  #[test]
  fn test_builtin_names() {
    let registry = builtin().unwrap();
    let names: Vec<String> = registry.list().iter().map(|w| w.name().to_string()).collect();
    assert_eq!(names, vec!["approval", "greet", "roll-call", "spell"]);
  }

  #[tokio::test]
  async fn test_greet() {
    let run = workflow("greet")
      .run(json!({ "name": "ada" }), RunOptions::default())
      .await
      .unwrap();
    assert_eq!(run.output, json!("hello ada"));
    assert_eq!(run.checkpoint.unwrap().node_count(), 2);
  }

  #[tokio::test]
  async fn test_roll_call_keeps_input_order() {
    let run = workflow("roll-call")
      .run(json!({ "names": ["a", "b", "c"] }), RunOptions::default())
      .await
      .unwrap();
    assert_eq!(run.output, json!(["a here", "b here", "c here"]));
  }

  #[tokio::test]
  async fn test_spell_streams_letters() {
    let run = workflow("spell")
      .run(json!({ "text": "hey" }), RunOptions::default())
      .await
      .unwrap();
    assert_eq!(run.output, json!("hey"));
  }

  #[tokio::test]
  async fn test_approval_without_handler_has_no_decision() {
    let run = workflow("approval")
      .run(json!({ "subject": "deploy" }), RunOptions::default())
      .await
      .unwrap();
    assert_eq!(run.output, json!({ "subject": "deploy", "decision": null }));
  }
}
