use axum::extract::State;

use crate::state::AppState;

/// Prometheus scrape endpoint rendering the process-wide recorder
#[tracing::instrument(skip(state))]
pub async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}
