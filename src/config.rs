//! Client configuration
//!
//! Loaded from `<config_dir>/tether/config.toml` or an explicit path; every
//! field has a default so an empty file (or none at all) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::infra::retry::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Request,
    Initialization,
    Shutdown,
}

impl OperationType {
    pub fn from_method(method: &str) -> Self {
        match method {
            "initialize" => Self::Initialization,
            "shutdown" => Self::Shutdown,
            _ => Self::Request,
        }
    }

    fn base_multiplier(self) -> f64 {
        match self {
            Self::Request => 1.0,
            Self::Initialization => 2.0,
            Self::Shutdown => 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base request timeout, counted from when the request is sent
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "defaults::client_name")]
    pub client_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_uri: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialization_options: Option<Value>,

    /// Documents up to this many bytes are always synced with full text
    #[serde(default = "defaults::full_sync_threshold")]
    pub full_sync_threshold: usize,

    /// Refuse requests for features the server said it lacks
    #[serde(default = "defaults::enforce_capabilities")]
    pub enforce_capabilities: bool,

    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "defaults::initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "defaults::backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            initial_delay_ms: defaults::initial_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            backoff_factor: defaults::backoff_factor(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::timeout_ms(),
            client_name: defaults::client_name(),
            root_uri: None,
            initialization_options: None,
            full_sync_threshold: defaults::full_sync_threshold(),
            enforce_capabilities: defaults::enforce_capabilities(),
            retry: RetrySettings::default(),
        }
    }
}

mod defaults {
    pub fn timeout_ms() -> u64 {
        3000
    }
    pub fn client_name() -> String {
        "tether".to_string()
    }
    pub fn full_sync_threshold() -> usize {
        1024
    }
    pub fn enforce_capabilities() -> bool {
        true
    }

    // Retry
    pub fn max_attempts() -> u32 {
        3
    }
    pub fn initial_delay_ms() -> u64 {
        100
    }
    pub fn max_delay_ms() -> u64 {
        5000
    }
    pub fn backoff_factor() -> f64 {
        2.0
    }
}

impl ClientConfig {
    pub fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn timeout_for(&self, method: &str) -> Duration {
        let multiplier = OperationType::from_method(method).base_multiplier();
        Duration::from_secs_f64(self.base_timeout().as_secs_f64() * multiplier)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::from(&self.retry)
    }

    /// `<config_dir>/tether/config.toml`
    pub fn global_config_path() -> PathBuf {
        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether")
            .join("config.toml")
    }

    /// Load from `path`; a missing file yields the defaults
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load_default() -> Result<Self, ConfigError> {
        Self::load(&Self::global_config_path()).await
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms", "must be greater than zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(invalid("retry.backoff_factor", "must be at least 1.0"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_timeout_calculation() {
        let config = ClientConfig::default();
        assert_eq!(
            config.timeout_for("textDocument/hover"),
            Duration::from_millis(3000)
        );
        assert_eq!(config.timeout_for("initialize"), Duration::from_millis(6000));
        assert_eq!(config.timeout_for("shutdown"), Duration::from_millis(1500));
    }

    #[test]
    fn test_operation_type_parsing() {
        assert_eq!(
            OperationType::from_method("textDocument/formatting"),
            OperationType::Request
        );
        assert_eq!(
            OperationType::from_method("initialize"),
            OperationType::Initialization
        );
        assert_eq!(
            OperationType::from_method("shutdown"),
            OperationType::Shutdown
        );
    }

    #[tokio::test]
    async fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
timeout_ms = 500
root_uri = "file:///project"

[initialization_options]
checkOnSave = false

[retry]
max_attempts = 5
"#
        )
        .unwrap();

        let config = ClientConfig::load(file.path()).await.unwrap();
        assert_eq!(config.timeout_ms, 500);
        assert_eq!(config.root_uri.as_deref(), Some("file:///project"));
        assert_eq!(
            config.initialization_options,
            Some(serde_json::json!({"checkOnSave": false}))
        );
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_ms, 100);
        assert_eq!(config.full_sync_threshold, 1024);
        assert!(config.enforce_capabilities);
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load(&dir.path().join("absent.toml"))
            .await
            .unwrap();
        assert_eq!(config.timeout_ms, 3000);
        assert_eq!(config.client_name, "tether");
    }

    #[tokio::test]
    async fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        tokio::fs::write(&path, "timeout_ms = 0").await.unwrap();
        let err = ClientConfig::load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "timeout_ms"));

        tokio::fs::write(&path, "timeout_ms = [").await.unwrap();
        assert!(matches!(
            ClientConfig::load(&path).await,
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_default_round_trips_through_toml() {
        let text = toml::to_string_pretty(&ClientConfig::default()).unwrap();
        let parsed: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.timeout_ms, 3000);
        assert_eq!(parsed.retry.backoff_factor, 2.0);
    }
}
