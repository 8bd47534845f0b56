// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub limits: LimitsConfig,
    pub gpu: GpuConfig,
    pub runner: RunnerConfig,
    pub inference: InferenceConfig,
    pub webhook: WebhookConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for batch artifacts; input/ and output/ live below it
    pub data_dir: String,
}

impl StorageConfig {
    pub fn input_dir(&self) -> PathBuf {
        Path::new(&self.data_dir).join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        Path::new(&self.data_dir).join("output")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_requests_per_job: usize,
    pub max_queue_depth: i64,
    pub max_total_queued_requests: i64,
    pub completion_window_default: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuConfig {
    /// Admission gate: reject new jobs at or above this memory percentage
    pub memory_threshold: f64,
    /// Admission gate: reject new jobs at or above this temperature (celsius)
    pub temp_threshold: f64,
    /// Prometheus endpoint exposing GPU metrics; None disables the probe
    pub probe_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub poll_interval_seconds: u64,
    pub chunk_size: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Base URL of the model runner service
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Global HMAC secret; jobs may override with their own
    pub secret: Option<String>,
    pub max_retries: u32,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults -> file -> env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment-specific configuration
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port must be greater than 0".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        if self.storage.data_dir.is_empty() {
            return Err("Storage data_dir cannot be empty".to_string());
        }

        if self.limits.max_requests_per_job == 0 {
            return Err("max_requests_per_job must be greater than 0".to_string());
        }
        if self.limits.max_queue_depth <= 0 {
            return Err("max_queue_depth must be greater than 0".to_string());
        }
        if crate::intake::parse_completion_window(&self.limits.completion_window_default).is_err() {
            return Err(format!(
                "Invalid completion_window_default: {}",
                self.limits.completion_window_default
            ));
        }

        if self.runner.poll_interval_seconds == 0 {
            return Err("Runner poll_interval_seconds must be greater than 0".to_string());
        }
        if self.runner.chunk_size == 0 {
            return Err("Runner chunk_size must be greater than 0".to_string());
        }

        if self.inference.base_url.is_empty() {
            return Err("Inference base_url cannot be empty".to_string());
        }

        if self.webhook.max_retries == 0 {
            return Err("Webhook max_retries must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 4080,
            },
            database: DatabaseConfig {
                url: "postgresql://localhost/llm_batch".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            storage: StorageConfig {
                data_dir: "data/batches".to_string(),
            },
            limits: LimitsConfig {
                max_requests_per_job: 50_000,
                max_queue_depth: 20,
                max_total_queued_requests: 1_000_000,
                completion_window_default: "24h".to_string(),
            },
            gpu: GpuConfig {
                memory_threshold: 95.0,
                temp_threshold: 85.0,
                probe_url: None,
            },
            runner: RunnerConfig {
                poll_interval_seconds: 10,
                chunk_size: 5000,
                temperature: 0.7,
                top_p: 0.9,
                max_tokens: 2048,
            },
            inference: InferenceConfig {
                base_url: "http://localhost:8000".to_string(),
            },
            webhook: WebhookConfig {
                secret: None,
                max_retries: 3,
                timeout_seconds: 30,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}
