use std::sync::Arc;

use common::config::Settings;
use common::db::DbPool;
use common::gpu::{self, HealthProbe};
use common::intake::IntakeService;
use common::webhook::WebhookDispatcher;
use metrics_exporter_prometheus::PrometheusHandle;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub db_pool: DbPool,
    pub probe: Arc<dyn HealthProbe>,
    pub intake: Arc<IntakeService>,
    pub dispatcher: WebhookDispatcher,
    pub config: Arc<Settings>,
    pub metrics: PrometheusHandle,
}

// Manual Debug implementation for cleaner output
impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("db_pool", &self.db_pool)
            .field("probe", &"<Arc<dyn HealthProbe>>")
            .field("intake", &"<Arc<IntakeService>>")
            .field("dispatcher", &"<WebhookDispatcher>")
            .field("config", &self.config)
            .field("metrics", &"<PrometheusHandle>")
            .finish()
    }
}

impl AppState {
    pub fn new(db_pool: DbPool, config: Settings, metrics: PrometheusHandle) -> Self {
        let probe = gpu::probe_from_config(&config.gpu);
        let intake = Arc::new(IntakeService::new(
            db_pool.clone(),
            probe.clone(),
            config.limits.clone(),
            config.gpu.clone(),
            &config.storage,
        ));
        let dispatcher = WebhookDispatcher::new(db_pool.clone(), config.webhook.clone());

        Self {
            db_pool,
            probe,
            intake,
            dispatcher,
            config: Arc::new(config),
            metrics,
        }
    }
}
