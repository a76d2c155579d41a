use crate::orchestrator::Orchestrator;

/// Shared state injected into every handler.
pub struct AppState {
  pub orchestrator: Orchestrator,
}
