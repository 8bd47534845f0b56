use axum::extract::DefaultBodyLimit;
use axum::{
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Uploads can carry up to 50k requests; allow large multipart bodies
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

/// Create the main application router with all routes and middleware
#[tracing::instrument(skip(state))]
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        // Prometheus scraping (no auth, like /health)
        .route("/metrics", get(handlers::metrics::metrics_handler))
        // Files API
        .route("/v1/files", post(handlers::files::upload_file))
        .route("/v1/files/:id", delete(handlers::files::delete_file))
        // Batches API
        .route("/v1/batches", post(handlers::batches::create_batch))
        .route("/v1/batches", get(handlers::batches::list_batches))
        .route("/v1/batches/:id", get(handlers::batches::get_batch))
        .route("/v1/batches/:id", delete(handlers::batches::cancel_batch))
        .route(
            "/v1/batches/:id/results",
            get(handlers::batches::get_results),
        )
        // Webhook dead-letter administration
        .route("/admin/dead-letters", get(handlers::admin::list_dead_letters))
        .route(
            "/admin/dead-letters/:id/retry",
            post(handlers::admin::retry_dead_letter),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
