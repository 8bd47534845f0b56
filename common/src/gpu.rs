// GPU health probe capability and the policies that depend on it

use crate::config::GpuConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A point-in-time GPU reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpuSnapshot {
    pub memory_percent: f64,
    pub temperature_c: f64,
}

/// Read-only GPU telemetry capability.
///
/// Returns `None` when telemetry is unavailable; callers treat an unknown
/// GPU as healthy so a missing exporter never blocks the queue.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn read(&self) -> Option<GpuSnapshot>;
}

/// Admission gate: a `Some(reason)` means the job must be rejected
pub fn admission_rejection(snapshot: Option<&GpuSnapshot>, config: &GpuConfig) -> Option<String> {
    let snapshot = snapshot?;
    if snapshot.memory_percent >= config.memory_threshold {
        return Some(format!("GPU memory at {:.1}%", snapshot.memory_percent));
    }
    if snapshot.temperature_c >= config.temp_threshold {
        return Some(format!("GPU temperature at {:.0}C", snapshot.temperature_c));
    }
    None
}

/// Shrink the chunk as GPU memory fills up
pub fn safe_chunk_size(configured: usize, snapshot: Option<&GpuSnapshot>) -> usize {
    let ceiling = match snapshot.map(|s| s.memory_percent) {
        None => return configured,
        Some(mem) if mem < 70.0 => 5000,
        Some(mem) if mem < 80.0 => 3000,
        Some(mem) if mem < 90.0 => 1000,
        Some(_) => 500,
    };
    configured.min(ceiling)
}

/// Probe that always reports telemetry as unavailable
pub struct NullProbe;

#[async_trait]
impl HealthProbe for NullProbe {
    async fn read(&self) -> Option<GpuSnapshot> {
        None
    }
}

/// Probe backed by a Prometheus endpoint exposing nvidia_gpu_* metrics
pub struct PrometheusProbe {
    client: reqwest::Client,
    query_url: String,
}

impl PrometheusProbe {
    const MEMORY_QUERY: &'static str =
        "nvidia_gpu_memory_used_bytes / nvidia_gpu_memory_total_bytes * 100";
    const TEMPERATURE_QUERY: &'static str = "nvidia_gpu_temperature_celsius";

    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();

        Self {
            client,
            query_url: format!("{}/api/v1/query", base_url.trim_end_matches('/')),
        }
    }

    async fn instant_query(&self, query: &str) -> Option<f64> {
        let response = self
            .client
            .get(&self.query_url)
            .query(&[("query", query)])
            .send()
            .await
            .ok()?;

        let body: serde_json::Value = response.json().await.ok()?;
        parse_instant_value(&body)
    }
}

/// Extract the first sample from a Prometheus instant-query response
fn parse_instant_value(body: &serde_json::Value) -> Option<f64> {
    if body.get("status")?.as_str()? != "success" {
        return None;
    }
    body.get("data")?
        .get("result")?
        .as_array()?
        .first()?
        .get("value")?
        .as_array()?
        .get(1)?
        .as_str()?
        .parse()
        .ok()
}

#[async_trait]
impl HealthProbe for PrometheusProbe {
    async fn read(&self) -> Option<GpuSnapshot> {
        let memory_percent = self.instant_query(Self::MEMORY_QUERY).await?;
        let temperature_c = self.instant_query(Self::TEMPERATURE_QUERY).await?;

        Some(GpuSnapshot {
            memory_percent,
            temperature_c,
        })
    }
}

/// Build the configured probe, or a null probe when no endpoint is set
pub fn probe_from_config(config: &GpuConfig) -> Arc<dyn HealthProbe> {
    match &config.probe_url {
        Some(url) => Arc::new(PrometheusProbe::new(url)),
        None => Arc::new(NullProbe),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu_config() -> GpuConfig {
        GpuConfig {
            memory_threshold: 95.0,
            temp_threshold: 85.0,
            probe_url: None,
        }
    }

    fn snapshot(memory_percent: f64, temperature_c: f64) -> GpuSnapshot {
        GpuSnapshot {
            memory_percent,
            temperature_c,
        }
    }

    #[test]
    fn test_admission_rejects_high_memory() {
        let reason = admission_rejection(Some(&snapshot(97.0, 60.0)), &gpu_config());
        assert!(reason.unwrap().contains("memory"));
    }

    #[test]
    fn test_admission_rejects_high_temperature() {
        let reason = admission_rejection(Some(&snapshot(50.0, 90.0)), &gpu_config());
        assert!(reason.unwrap().contains("temperature"));
    }

    #[test]
    fn test_admission_accepts_healthy_gpu() {
        assert!(admission_rejection(Some(&snapshot(50.0, 60.0)), &gpu_config()).is_none());
    }

    #[test]
    fn test_admission_accepts_unknown_gpu() {
        assert!(admission_rejection(None, &gpu_config()).is_none());
    }

    #[test]
    fn test_chunk_size_tiers() {
        assert_eq!(safe_chunk_size(5000, Some(&snapshot(50.0, 60.0))), 5000);
        assert_eq!(safe_chunk_size(5000, Some(&snapshot(75.0, 60.0))), 3000);
        assert_eq!(safe_chunk_size(5000, Some(&snapshot(85.0, 60.0))), 1000);
        assert_eq!(safe_chunk_size(5000, Some(&snapshot(95.0, 60.0))), 500);
    }

    #[test]
    fn test_chunk_size_never_grows_past_configured() {
        assert_eq!(safe_chunk_size(200, Some(&snapshot(50.0, 60.0))), 200);
        assert_eq!(safe_chunk_size(200, None), 200);
    }

    #[test]
    fn test_parse_instant_value() {
        let body = serde_json::json!({
            "status": "success",
            "data": { "result": [ { "value": [1700000000.0, "42.5"] } ] }
        });
        assert_eq!(parse_instant_value(&body), Some(42.5));
    }

    #[test]
    fn test_parse_instant_value_empty_result() {
        let body = serde_json::json!({
            "status": "success",
            "data": { "result": [] }
        });
        assert_eq!(parse_instant_value(&body), None);
    }

    #[test]
    fn test_parse_instant_value_error_status() {
        let body = serde_json::json!({ "status": "error" });
        assert_eq!(parse_instant_value(&body), None);
    }
}
