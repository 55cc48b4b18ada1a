//! Orchestrator configuration
//!
//! Settings come from defaults, an optional YAML file, and environment
//! overrides applied last.

use crate::driver::docker::engine_url_from_docker_host;
use crate::error::{BerthError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default Docker Engine API endpoint
pub const DEFAULT_ENGINE_URL: &str = "http://localhost:2375";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "berth.yaml";

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Engine API base URL
    pub engine_url: String,
    /// Host written into connection handles
    pub host: String,
    /// Readiness poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Default readiness budget in milliseconds
    pub readiness_timeout_ms: u64,
    /// Budget for create + start, including an image pull
    pub startup_timeout_ms: u64,
    /// Timeout of a single engine request
    pub request_timeout_ms: u64,
    /// Pull an image when the engine reports it missing
    pub pull_missing_images: bool,
    /// Label stamped on every created container
    pub session_label: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            engine_url: DEFAULT_ENGINE_URL.to_string(),
            host: "localhost".to_string(),
            poll_interval_ms: 250,
            readiness_timeout_ms: 60_000,
            startup_timeout_ms: 120_000,
            request_timeout_ms: 30_000,
            pull_missing_images: true,
            session_label: "berth".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BerthError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| BerthError::InvalidConfig(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the default file if present, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.with_env_overrides()
    }

    /// Apply overrides from the process environment
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(docker_host) = lookup("DOCKER_HOST") {
            self.engine_url = engine_url_from_docker_host(&docker_host)?;
        }
        if let Some(url) = lookup("BERTH_ENGINE_URL") {
            self.engine_url = url.trim_end_matches('/').to_string();
        }
        if let Some(host) = lookup("BERTH_HOST") {
            self.host = host;
        }
        if let Some(value) = lookup("BERTH_POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse_millis("BERTH_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup("BERTH_READINESS_TIMEOUT_MS") {
            self.readiness_timeout_ms = parse_millis("BERTH_READINESS_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("BERTH_STARTUP_TIMEOUT_MS") {
            self.startup_timeout_ms = parse_millis("BERTH_STARTUP_TIMEOUT_MS", &value)?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Check the settings are usable
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(BerthError::InvalidConfig(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.readiness_timeout_ms == 0
            || self.startup_timeout_ms == 0
            || self.request_timeout_ms == 0
        {
            return Err(BerthError::InvalidConfig(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_ms > self.readiness_timeout_ms {
            return Err(BerthError::InvalidConfig(format!(
                "poll interval ({}ms) exceeds readiness timeout ({}ms)",
                self.poll_interval_ms, self.readiness_timeout_ms
            )));
        }
        if self.host.trim().is_empty() {
            return Err(BerthError::InvalidConfig("host must not be empty".to_string()));
        }
        Ok(())
    }

    /// Readiness poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Default readiness budget
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    /// Create + start budget
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Single engine request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse_millis(key: &str, value: &str) -> Result<u64> {
    value.trim().parse::<u64>().map_err(|_| {
        BerthError::InvalidConfig(format!("{} must be a number of milliseconds, got {:?}", key, value))
    })
}
