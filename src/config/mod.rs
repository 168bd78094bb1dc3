use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::llm::LlmConfig;
use crate::store::{FileStateStore, InMemoryStateStore, StateStore};
use crate::telemetry::TelemetryConfig;
use crate::workflow::{ExecutorConfig, WorkflowDefinition};

/// Settings for the campaign orchestrator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Executor settings: timeouts, leases, retry policies
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Model settings for LLM-backed activities
    #[serde(default)]
    pub model: LlmConfig,

    /// State store settings
    #[serde(default)]
    pub store: StoreSettings,

    /// Logger settings
    #[serde(default)]
    pub logger: LoggerSettings,

    /// Workflow definitions registered in addition to the built-in ones
    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,
}

impl Settings {
    /// Check the settings without touching the filesystem
    pub fn validate(&self) -> Result<()> {
        self.executor.validate()?;
        if self.store.backend == StoreBackend::File && self.store.path.is_none() {
            return Err(Error::Config("store.path is required for the file backend".to_string()));
        }
        Ok(())
    }
}

/// Which state store backs the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local, lost on exit
    #[default]
    Memory,
    /// One JSON document per run in `path`
    File,
}

/// State store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Backend type
    #[serde(default)]
    pub backend: StoreBackend,

    /// Directory for the file backend
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreSettings {
    /// Open the configured store
    pub async fn open(&self) -> Result<Arc<dyn StateStore>> {
        match self.backend {
            StoreBackend::Memory => Ok(Arc::new(InMemoryStateStore::new())),
            StoreBackend::File => {
                let path = self.path.as_ref().ok_or_else(|| {
                    Error::Config("store.path is required for the file backend".to_string())
                })?;
                Ok(Arc::new(FileStateStore::open(path).await?))
            }
        }
    }
}

/// Logger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerSettings {
    /// Log level or filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Colorize console output
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            ansi: default_ansi(),
        }
    }
}

impl LoggerSettings {
    /// Telemetry configuration for these settings
    pub fn telemetry_config(&self, service_name: &str) -> TelemetryConfig {
        TelemetryConfig {
            service_name: service_name.to_string(),
            ansi: self.ansi,
            log_level: self.level.clone(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ansi() -> bool {
    true
}

/// Load settings from a YAML file
pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let mut file = File::open(path.as_ref())
        .map_err(|e| Error::Config(format!("Failed to open config file: {}", e)))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

    let settings: Settings = serde_yaml::from_str(&contents)
        .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;
    settings.validate()?;

    Ok(settings)
}

/// Get settings, optionally from a specific file
pub fn get_settings(config_path: Option<&str>) -> Result<Settings> {
    match config_path {
        Some(path) => load_settings(path),
        None => {
            let default_paths = [
                "campaign_orchestrator.config.yaml",
                "config/campaign_orchestrator.config.yaml",
                "../campaign_orchestrator.config.yaml",
            ];

            for path in default_paths {
                if Path::new(path).exists() {
                    return load_settings(path);
                }
            }

            Ok(Settings::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.store.backend, StoreBackend::Memory);
        assert_eq!(settings.logger.level, "info");
        assert!(settings.workflows.is_empty());
    }

    #[test]
    fn test_load_full_config() {
        let file = write_config(
            r#"
executor:
  lease_duration_ms: 45000
  llm_timeout_ms: 20000
  retry_policies:
    email:
      max_attempts: 5
model:
  model: llama3
  temperature: 0.2
store:
  backend: file
  path: /var/lib/campaigns
logger:
  level: debug
  ansi: false
workflows:
  - name: nurture
    steps:
      - id: copy
        activity: generate_email_copy
      - id: send
        activity: send_email
        retry_policy: email
"#,
        );

        let settings = load_settings(file.path()).unwrap();
        assert_eq!(settings.executor.lease_duration_ms, 45_000);
        assert_eq!(settings.executor.email_timeout_ms, 10_000);
        assert_eq!(settings.model.model, "llama3");
        assert_eq!(settings.store.backend, StoreBackend::File);
        assert_eq!(settings.store.path, Some(PathBuf::from("/var/lib/campaigns")));
        assert!(!settings.logger.ansi);
        assert_eq!(settings.workflows.len(), 1);
        assert_eq!(settings.workflows[0].steps[1].retry_policy.as_deref(), Some("email"));

        let telemetry = settings.logger.telemetry_config("runner");
        assert_eq!(telemetry.log_level, "debug");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let file = write_config("executor:\n  lease_duration_ms: 100\n");
        assert!(matches!(load_settings(file.path()), Err(Error::Config(_))));

        let file = write_config("store:\n  backend: file\n");
        assert!(matches!(load_settings(file.path()), Err(Error::Config(_))));

        let file = write_config("executor: [\n");
        assert!(matches!(load_settings(file.path()), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            get_settings(Some("/nonexistent/campaign.yaml")),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_open_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let settings = StoreSettings {
            backend: StoreBackend::File,
            path: Some(dir.path().join("runs")),
        };
        let store = settings.open().await.unwrap();
        assert!(store.list_runs().await.unwrap().is_empty());
        assert!(dir.path().join("runs").is_dir());
    }
}
