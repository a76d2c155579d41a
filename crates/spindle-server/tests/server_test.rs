//! Router tests driven through `tower::ServiceExt::oneshot`, plus a checkpoint
//! round trip over a real socket.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use spindle_checkpoint::{HttpCheckpointSink, HttpSinkConfig, node_id};
use spindle_engine::{
  BoxError, Invocation, RunOptions, StreamingResult, SuspendOptions, Workflow, component,
  request_input, stream_component,
};
use spindle_server::{
  EXECUTION_ID_HEADER, NDJSON, RegisteredWorkflow, Server, ServerConfig, WorkflowRegistry,
};
use spindle_store::MemoryStore;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn message_schema() -> Value {
  json!({
    "type": "object",
    "properties": { "message": { "type": "string" } },
    "required": ["message"],
  })
}

fn registry() -> WorkflowRegistry {
  let registry = WorkflowRegistry::new();

  let format = component("Format", |props: Value| async move {
    let name = props["name"].as_str().unwrap_or("world").to_string();
    Ok::<_, BoxError>(json!(format!("hello {}", name)))
  });
  let greet = component("Greet", move |props: Value| {
    let format = format.clone();
    async move { Ok::<_, BoxError>(Invocation::new(format, props)) }
  });
  registry
    .register(
      RegisteredWorkflow::new(Workflow::new("greet", greet)).with_input_schema(json!({
        "type": "object",
        "properties": { "name": { "type": "string" } },
        "required": ["name"],
      })),
    )
    .unwrap();

  let approval = component("Approval", |props: Value| async move {
    let delay = props["delayMs"].as_u64().unwrap_or_default();
    tokio::time::sleep(Duration::from_millis(delay)).await;
    let payload = request_input(message_schema(), SuspendOptions::new()).await?;
    Ok::<_, BoxError>(payload.unwrap_or(Value::Null))
  });
  registry
    .register(RegisteredWorkflow::new(Workflow::new("approval", approval)))
    .unwrap();

  let letters = stream_component("Letters", |_props: Value| async move {
    Ok::<_, BoxError>(StreamingResult::from_fragments(["a", "b", "c"]))
  });
  registry
    .register(RegisteredWorkflow::new(Workflow::streaming("letters", letters)))
    .unwrap();

  let failing = component("Failing", |_props: Value| async move {
    Err::<Value, BoxError>("boom".into())
  });
  registry
    .register(RegisteredWorkflow::new(Workflow::new("failing", failing)))
    .unwrap();

  registry
}

fn app() -> Router {
  Server::new(
    ServerConfig::default(),
    Arc::new(MemoryStore::new()),
    registry(),
  )
  .router()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
  let response = app.clone().oneshot(request).await.unwrap();
  let status = response.status();
  let headers = response.headers().clone();
  let body = response.into_body().collect().await.unwrap().to_bytes();
  (status, headers, body)
}

fn post(uri: &str, body: Value) -> Request<Body> {
  Request::post(uri)
    .header(header::CONTENT_TYPE, "application/json")
    .body(Body::from(body.to_string()))
    .unwrap()
}

fn get(uri: &str) -> Request<Body> {
  Request::get(uri).body(Body::empty()).unwrap()
}

fn json_body(body: &Bytes) -> Value {
  serde_json::from_slice(body).unwrap()
}

fn ndjson_lines(body: &Bytes) -> Vec<Value> {
  std::str::from_utf8(body)
    .unwrap()
    .lines()
    .map(|line| serde_json::from_str(line).unwrap())
    .collect()
}

/// Poll the execution until `done` accepts it.
async fn wait_for(app: &Router, id: &str, done: impl Fn(&Value) -> bool) -> Value {
  for _ in 0..200 {
    let (status, _, body) = send(app, get(&format!("/workflowExecutions/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    let execution = json_body(&body);
    if done(&execution) {
      return execution;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("execution {} did not reach the expected state", id);
}

#[tokio::test]
async fn test_health() {
  let (status, _, body) = send(&app(), get("/health")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(json_body(&body)["status"], "ok");
}

#[tokio::test]
async fn test_list_and_describe_workflows() {
  let app = app();
  let (_, _, body) = send(&app, get("/workflows")).await;
  let names: Vec<String> = json_body(&body)["workflows"]
    .as_array()
    .unwrap()
    .iter()
    .map(|w| w["name"].as_str().unwrap().to_string())
    .collect();
  assert_eq!(names, vec!["approval", "failing", "greet", "letters"]);

  let (status, _, body) = send(&app, get("/workflows/letters")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(json_body(&body)["streaming"], true);

  let (status, _, body) = send(&app, get("/workflows/missing")).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
  assert_eq!(json_body(&body)["error"]["code"], "WORKFLOW_NOT_FOUND");
}

#[tokio::test]
async fn test_run_and_wait() {
  let app = app();
  let (status, headers, body) = send(&app, post("/workflows/greet", json!({ "name": "Ada" }))).await;
  assert_eq!(status, StatusCode::OK);

  let result = json_body(&body);
  assert_eq!(result["executionStatus"], "completed");
  assert_eq!(result["output"], "hello Ada");
  let id = result["executionId"].as_str().unwrap().to_string();
  assert_eq!(headers[EXECUTION_ID_HEADER], id.as_str());

  let (_, _, body) = send(&app, get(&format!("/workflowExecutions/{}/progress", id))).await;
  let lines = ndjson_lines(&body);
  let statuses: Vec<&str> = lines
    .iter()
    .filter(|line| line["type"] == "status")
    .map(|line| line["status"].as_str().unwrap())
    .collect();
  assert_eq!(statuses, vec!["queued", "starting", "running", "completed"]);
  assert_eq!(lines.last().unwrap()["status"], "completed");
  assert!(lines.iter().any(|line| line["type"] == "start"));
  assert!(
    lines
      .iter()
      .any(|line| line["type"] == "end" && line["output"] == "hello Ada")
  );

  let (status, _, body) = send(&app, get(&format!("/workflowExecutions/{}/checkpoint", id))).await;
  assert_eq!(status, StatusCode::OK);
  let tree = json_body(&body);
  assert_eq!(tree["componentName"], "Greet");
  assert_eq!(tree["children"][0]["componentName"], "Format");
}

#[tokio::test]
async fn test_run_rejects_input_failing_schema() {
  let app = app();
  let (status, _, body) = send(&app, post("/workflows/greet", json!({ "name": 7 }))).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert_eq!(json_body(&body)["error"]["code"], "INVALID_REQUEST");

  let (status, _, _) = send(&app, post("/workflows/missing", json!({}))).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_failed_run_reports_error() {
  let app = app();
  let (status, _, body) = send(&app, post("/workflows/failing", json!({}))).await;
  assert_eq!(status, StatusCode::OK);
  let result = json_body(&body);
  assert_eq!(result["executionStatus"], "failed");
  assert!(result["error"].as_str().unwrap().contains("boom"));
}

#[tokio::test]
async fn test_ndjson_run_streams_until_the_end() {
  let app = app();
  let request = Request::post("/workflows/greet")
    .header(header::ACCEPT, NDJSON)
    .body(Body::from(json!({ "name": "Grace" }).to_string()))
    .unwrap();
  let (status, headers, body) = send(&app, request).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(headers[header::CONTENT_TYPE], NDJSON);

  let lines = ndjson_lines(&body);
  assert_eq!(lines.first().unwrap()["status"], "queued");
  assert_eq!(lines.last().unwrap()["status"], "completed");
}

#[tokio::test]
async fn test_text_run_streams_fragments() {
  let app = app();
  let request = Request::post("/workflows/letters")
    .header(header::ACCEPT, "text/plain")
    .body(Body::empty())
    .unwrap();
  let (status, headers, body) = send(&app, request).await;
  assert_eq!(status, StatusCode::OK);
  assert!(headers.contains_key(EXECUTION_ID_HEADER));
  assert_eq!(&body[..], b"abc");
}

#[tokio::test]
async fn test_start_then_fulfill() {
  let app = app();
  let (status, headers, body) = send(&app, post("/workflows/approval/start", json!({}))).await;
  assert_eq!(status, StatusCode::ACCEPTED);
  let id = json_body(&body)["executionId"].as_str().unwrap().to_string();
  assert_eq!(headers[EXECUTION_ID_HEADER], id.as_str());

  let waiting = wait_for(&app, &id, |e| {
    e["waitingNodes"].is_array() && e["executionStatus"] == "running"
  })
  .await;
  let node = waiting["waitingNodes"][0].as_str().unwrap().to_string();

  let fulfill_uri = format!("/workflowExecutions/{}/fulfill/{}", id, node);
  let (status, _, _) = send(&app, post(&fulfill_uri, json!({ "message": 42 }))).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);

  let (status, _, body) = send(&app, post(&fulfill_uri, json!({ "message": "hello" }))).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(json_body(&body)["outcome"], "resolved");

  let done = wait_for(&app, &id, |e| e["executionStatus"] == "completed").await;
  assert_eq!(done["output"], json!({ "message": "hello" }));

  let (_, _, body) = send(&app, post(&fulfill_uri, json!({ "message": "again" }))).await;
  assert_eq!(json_body(&body)["outcome"], "ignored");
}

#[tokio::test]
async fn test_fulfill_before_ask_under_org_path() {
  let app = app();
  let input = json!({ "delayMs": 200 });
  let (_, _, body) = send(&app, post("/workflows/approval/start", input.clone())).await;
  let id = json_body(&body)["executionId"].as_str().unwrap().to_string();

  let root = node_id("Approval", &input, None);
  let ask = node_id("RequestInput", &json!({ "schema": message_schema() }), Some(&root));
  let (status, _, body) = send(
    &app,
    post(
      &format!("/org/local/workflowExecutions/{}/fulfill/{}", id, ask),
      json!({ "message": "early" }),
    ),
  )
  .await;
  assert_eq!(status, StatusCode::OK);
  let outcome = json_body(&body)["outcome"].as_str().unwrap().to_string();
  assert!(outcome == "buffered" || outcome == "resolved");

  let done = wait_for(&app, &id, |e| e["executionStatus"] == "completed").await;
  assert_eq!(done["output"], json!({ "message": "early" }));
}

#[tokio::test]
async fn test_unknown_execution() {
  let app = app();
  let (status, _, body) = send(&app, get("/workflowExecutions/nope")).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
  assert_eq!(json_body(&body)["error"]["code"], "EXECUTION_NOT_FOUND");

  let (status, _, _) = send(&app, post("/workflowExecutions/nope/resume/n1", json!({}))).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_http_checkpoint_sink_round_trip() {
  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let cancel = CancellationToken::new();
  let server = Server::new(
    ServerConfig {
      bind: addr,
      ..Default::default()
    },
    Arc::new(MemoryStore::new()),
    WorkflowRegistry::new(),
  );
  let serving = tokio::spawn(server.serve_on(listener, cancel.clone()));

  let api_base = format!("http://{}", addr);
  let sink = HttpCheckpointSink::new(HttpSinkConfig {
    api_base: api_base.clone(),
    org: "acme".to_string(),
    ..Default::default()
  })
  .unwrap();

  let leaf = component("Leaf", |_props: Value| async move { Ok::<_, BoxError>(json!("leaf")) });
  let root = component("Root", move |_props: Value| {
    let leaf = leaf.clone();
    async move { Ok::<_, BoxError>(Invocation::new(leaf, json!({}))) }
  });
  let run = Workflow::new("remote", root)
    .run(json!({}), RunOptions::new().with_sink(Arc::new(sink)))
    .await
    .unwrap();
  assert_eq!(run.output, json!("leaf"));
  let receipt = run.receipt.unwrap();
  assert_eq!(receipt.execution_id, run.execution_id);
  assert_eq!(receipt.workflow_name, "remote");

  let tree: Value = reqwest::get(format!(
    "{}/workflowExecutions/{}/checkpoint",
    api_base, run.execution_id
  ))
  .await
  .unwrap()
  .json()
  .await
  .unwrap();
  assert_eq!(tree["componentName"], "Root");
  assert_eq!(tree["output"], "leaf");
  assert_eq!(tree["children"][0]["componentName"], "Leaf");

  cancel.cancel();
  serving.await.unwrap().unwrap();
}
