//! Logging and metrics for the orchestrator
//!
//! Logging goes through `tracing`. Metrics are emitted as structured events on the
//! `metrics` target so that any subscriber (or log shipper) can pick them up without
//! the core depending on a metrics backend.

use std::collections::HashMap;
use std::time::Instant;

use crate::error::{Error, Result};

/// Target used for metric events
pub const METRICS_TARGET: &str = "metrics";

/// Configuration for the telemetry system
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Name of the service, attached to the startup event
    pub service_name: String,
    /// Colorize console output
    pub ansi: bool,
    /// Log level or filter directive; `RUST_LOG` takes precedence
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "campaign-orchestrator".to_string(),
            ansi: true,
            log_level: "info".to_string(),
        }
    }
}

/// Install the global `tracing` subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.log_level))
        .map_err(|e| Error::Config(format!("invalid log level '{}': {}", config.log_level, e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(config.ansi)
        .try_init()
        .map_err(|e| Error::Config(format!("failed to initialize telemetry: {}", e)))?;

    tracing::info!(service = %config.service_name, "Telemetry initialized");
    Ok(())
}

/// Record a single metric with tags
pub fn add_metric(name: &str, value: f64, tags: &[(&str, String)]) {
    let tags_str = tags
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");

    tracing::info!(
        target: METRICS_TARGET,
        metric_name = %name,
        metric_value = %value,
        metric_tags = %tags_str,
        "Recorded metric"
    );
}

/// Record several untagged metrics at once
pub fn add_metrics(metrics: HashMap<&'static str, f64>) {
    for (key, value) in metrics.iter() {
        add_metric(key, *value, &[]);
    }
}

/// Guard that logs how long an operation took when dropped
pub fn span_duration(name: &'static str) -> impl Drop {
    struct Guard {
        name: &'static str,
        start: Instant,
    }

    impl Drop for Guard {
        fn drop(&mut self) {
            let duration = self.start.elapsed();
            tracing::info!(
                target: METRICS_TARGET,
                duration_ms = duration.as_millis() as f64,
                operation = self.name,
                "Operation completed"
            );
        }
    }

    Guard {
        name,
        start: Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_subscriber() {
        add_metric("runs_started", 1.0, &[("workflow", "demo".to_string())]);
        let mut batch = HashMap::new();
        batch.insert("runs_succeeded", 2.0);
        add_metrics(batch);
        let guard = span_duration("test_operation");
        drop(guard);
    }

    #[test]
    fn test_invalid_level_rejected() {
        let config = TelemetryConfig {
            log_level: "campaign_orchestrator=[".to_string(),
            ..TelemetryConfig::default()
        };
        // RUST_LOG may be set in the environment, in which case the level is ignored
        if std::env::var("RUST_LOG").is_err() {
            assert!(matches!(init_telemetry(config), Err(Error::Config(_))));
        }
    }
}
