//! HTTP checkpoint sink.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use tracing::debug;
use url::Url;

use crate::error::CheckpointError;
use crate::sink::{CheckpointBatch, CheckpointSink};
use crate::wire::{CheckpointReceipt, WireCheckpoint};

/// Where and how to send checkpoints.
#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
  pub api_base: String,
  pub org: String,
  pub api_key: Option<String>,
  pub timeout: Duration,
}

impl Default for HttpSinkConfig {
  fn default() -> Self {
    Self {
      api_base: "http://127.0.0.1:8787".to_string(),
      org: "local".to_string(),
      api_key: None,
      timeout: Duration::from_secs(30),
    }
  }
}

/// Sends checkpoints to `{api_base}/org/{org}/workflowExecutions`.
///
/// The first batch of a run (no execution id yet) is POSTed; later batches are
/// PUT to `.../workflowExecutions/{executionId}`.
pub struct HttpCheckpointSink {
  client: reqwest::Client,
  config: HttpSinkConfig,
}

impl HttpCheckpointSink {
  pub fn new(config: HttpSinkConfig) -> Result<Self, CheckpointError> {
    Url::parse(&config.api_base).map_err(CheckpointError::transport)?;
    let client = reqwest::Client::builder()
      .timeout(config.timeout)
      .build()
      .map_err(CheckpointError::transport)?;
    Ok(Self { client, config })
  }

  fn endpoint(&self, execution_id: Option<&str>) -> Result<Url, CheckpointError> {
    let mut url = Url::parse(&self.config.api_base).map_err(CheckpointError::transport)?;
    {
      let mut segments = url
        .path_segments_mut()
        .map_err(|_| CheckpointError::transport("api base cannot carry a path"))?;
      segments
        .pop_if_empty()
        .extend(["org", self.config.org.as_str(), "workflowExecutions"]);
      if let Some(id) = execution_id {
        segments.push(id);
      }
    }
    Ok(url)
  }
}

#[async_trait]
impl CheckpointSink for HttpCheckpointSink {
  async fn persist(&self, batch: &CheckpointBatch) -> Result<CheckpointReceipt, CheckpointError> {
    let body = WireCheckpoint::from_batch(batch)?.to_body()?;
    let url = self.endpoint(batch.execution_id.as_deref())?;
    debug!(url = %url, bytes = body.len(), "sending_checkpoint");

    let request = match batch.execution_id {
      Some(_) => self.client.put(url),
      None => self.client.post(url),
    };
    let mut request = request
      .header(CONTENT_TYPE, "application/json")
      .header(CONTENT_ENCODING, "gzip")
      .body(body);
    if let Some(key) = &self.config.api_key {
      request = request.bearer_auth(key);
    }

    let response = request
      .send()
      .await
      .map_err(CheckpointError::transport)?
      .error_for_status()
      .map_err(CheckpointError::transport)?;
    response
      .json::<CheckpointReceipt>()
      .await
      .map_err(CheckpointError::transport)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sink(api_base: &str) -> HttpCheckpointSink {
    HttpCheckpointSink::new(HttpSinkConfig {
      api_base: api_base.to_string(),
      org: "acme".to_string(),
      ..Default::default()
    })
    .unwrap()
  }

  #[test]
  fn test_endpoint_without_execution_id() {
    let url = sink("http://localhost:9000").endpoint(None).unwrap();
    assert_eq!(url.as_str(), "http://localhost:9000/org/acme/workflowExecutions");
  }

  #[test]
  fn test_endpoint_with_execution_id_and_base_path() {
    let url = sink("http://localhost:9000/api/").endpoint(Some("exec 1")).unwrap();
    assert_eq!(
      url.as_str(),
      "http://localhost:9000/api/org/acme/workflowExecutions/exec%201"
    );
  }

  #[test]
  fn test_rejects_invalid_base() {
    let result = HttpCheckpointSink::new(HttpSinkConfig {
      api_base: "not a url".to_string(),
      ..Default::default()
    });
    assert!(matches!(result, Err(CheckpointError::Transport { .. })));
  }
}
