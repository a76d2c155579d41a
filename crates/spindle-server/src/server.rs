use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use spindle_store::Store;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::registry::WorkflowRegistry;
use crate::routes;
use crate::state::AppState;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
  /// Address to listen on.
  pub bind: SocketAddr,
  /// Public base URL used in callback URLs; `http://{bind}` when unset.
  pub api_base: Option<String>,
  pub org: String,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind: SocketAddr::from(([127, 0, 0, 1], 8787)),
      api_base: None,
      org: "local".to_string(),
    }
  }
}

impl ServerConfig {
  pub fn api_base(&self) -> String {
    self
      .api_base
      .clone()
      .unwrap_or_else(|| format!("http://{}", self.bind))
  }
}

/// The orchestration server: an [`Orchestrator`] behind the HTTP routes.
pub struct Server {
  config: ServerConfig,
  orchestrator: Orchestrator,
}

impl Server {
  pub fn new(config: ServerConfig, store: Arc<dyn Store>, registry: WorkflowRegistry) -> Self {
    let orchestrator = Orchestrator::new(
      store,
      registry,
      OrchestratorConfig {
        api_base: Some(config.api_base()),
        org: Some(config.org.clone()),
      },
    );
    Self {
      config,
      orchestrator,
    }
  }

  pub fn orchestrator(&self) -> &Orchestrator {
    &self.orchestrator
  }

  pub fn router(&self) -> Router {
    let state = Arc::new(AppState {
      orchestrator: self.orchestrator.clone(),
    });
    routes::router(state).layer(TraceLayer::new_for_http())
  }

  /// Bind the configured address and serve until `cancel` fires.
  pub async fn serve(self, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(self.config.bind).await?;
    self.serve_on(listener, cancel).await
  }

  /// Serve on an already bound listener until `cancel` fires.
  ///
  /// Running executions are failed on shutdown.
  pub async fn serve_on(self, listener: TcpListener, cancel: CancellationToken) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, org = %self.config.org, "server_listening");

    let app = self.router();
    let orchestrator = self.orchestrator.clone();
    axum::serve(listener, app)
      .with_graceful_shutdown(async move {
        cancel.cancelled().await;
        orchestrator.shutdown();
      })
      .await?;

    info!("server_stopped");
    Ok(())
  }
}
