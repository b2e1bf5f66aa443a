// ABOUTME: Runtime configuration parsed from TOML with environment variable overrides.
// ABOUTME: Describes runtime knobs plus the backends to register at startup.

use crate::bootstrap;
use crate::descriptor::BackendProfile;
use crate::orchestrator::OrchestratorConfig;
use crate::selection::{BalancedWeights, RoundRobinScope};
use agentry_agent::{AgentCapabilities, AgentConfig, Capability};
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "AGENTRY_CONFIG";
const LOCAL_CONFIG: &str = "agentry.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default, rename = "backend")]
    pub backends: Vec<BackendEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    #[serde(default = "default_checkout_timeout_ms")]
    pub checkout_timeout_ms: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    #[serde(default)]
    pub round_robin_scope: RoundRobinScope,
    #[serde(default)]
    pub balanced_weights: BalancedWeights,
}

fn default_max_pool_size() -> usize {
    5
}

fn default_checkout_timeout_ms() -> u64 {
    5000
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_health_timeout_ms() -> u64 {
    5000
}

fn default_execution_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> usize {
    1
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_true() -> bool {
    true
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_pool_size: default_max_pool_size(),
            checkout_timeout_ms: default_checkout_timeout_ms(),
            health_interval_secs: default_health_interval_secs(),
            health_timeout_ms: default_health_timeout_ms(),
            execution_timeout_secs: default_execution_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            fallback_enabled: true,
            round_robin_scope: RoundRobinScope::default(),
            balanced_weights: BalancedWeights::default(),
        }
    }
}

impl RuntimeSettings {
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            execution_timeout: Duration::from_secs(self.execution_timeout_secs),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            fallback_enabled: self.fallback_enabled,
            ..OrchestratorConfig::default()
        }
    }
}

/// One `[[backend]]` table
#[derive(Clone, Serialize, Deserialize)]
pub struct BackendEntry {
    pub id: String,
    /// Built-in variant, e.g. "mock" or "command"
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    /// Overrides `runtime.max_pool_size` for this backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,
    /// Instances to build at startup
    #[serde(default)]
    pub warm: usize,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_1k_tokens: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Passed to the backend constructor
    #[serde(default)]
    pub config: AgentConfig,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

// Config values may carry secrets; only keys are shown
impl fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("version", &self.version)
            .field("enabled", &self.enabled)
            .field("priority", &self.priority)
            .field("pool_size", &self.pool_size)
            .field("warm", &self.warm)
            .field("capabilities", &self.capabilities)
            .field("config", &self.config.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl BackendEntry {
    /// Declared capabilities as a capability record
    pub fn declared_capabilities(&self) -> AgentCapabilities {
        let caps = AgentCapabilities::from_set(self.capabilities.iter().copied());
        match self.max_context_length {
            Some(tokens) => caps.with_max_context_length(tokens),
            None => caps,
        }
    }

    pub fn profile(&self) -> BackendProfile {
        let defaults = BackendProfile::default();
        BackendProfile {
            cost_per_1k_tokens: self.cost_per_1k_tokens.unwrap_or(defaults.cost_per_1k_tokens),
            quality: self.quality.unwrap_or(defaults.quality),
            latency_ms: self.latency_ms.unwrap_or(defaults.latency_ms),
        }
    }
}

impl RuntimeConfig {
    /// Find the config file, checking in order:
    /// 1. AGENTRY_CONFIG env var (if set and the file exists)
    /// 2. ./agentry.toml
    /// 3. ~/.config/agentry/config.toml
    pub fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from(LOCAL_CONFIG);
        if local_config.exists() {
            return Some(local_config);
        }

        let user_config = BaseDirs::new()?.config_dir().join("agentry").join("config.toml");
        if user_config.exists() {
            return Some(user_config);
        }

        None
    }

    /// Discover, parse, apply env overrides and validate. With no file the
    /// runtime starts with defaults and no backends.
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => Self::from_file(&path)?,
            None => {
                tracing::info!("No config file found, using environment variables and defaults");
                Self::default()
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load) but from an explicit path, which must exist
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str::<RuntimeConfig>(content)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("AGENTRY_MAX_POOL_SIZE") {
            self.runtime.max_pool_size = val.parse().with_context(|| {
                format!("AGENTRY_MAX_POOL_SIZE must be a positive number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("AGENTRY_CHECKOUT_TIMEOUT_MS") {
            self.runtime.checkout_timeout_ms = val.parse().with_context(|| {
                format!("AGENTRY_CHECKOUT_TIMEOUT_MS must be a number of milliseconds, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("AGENTRY_HEALTH_INTERVAL_SECS") {
            self.runtime.health_interval_secs = val.parse().with_context(|| {
                format!("AGENTRY_HEALTH_INTERVAL_SECS must be a number of seconds, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("AGENTRY_MAX_RETRIES") {
            self.runtime.max_retries = val.parse().with_context(|| {
                format!("AGENTRY_MAX_RETRIES must be a number, got: {}", val)
            })?;
        }
        Ok(())
    }

    /// Check cross-field constraints, reporting every problem at once
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.runtime.max_pool_size == 0 {
            problems.push("runtime.max_pool_size must be at least 1".to_string());
        }
        if self.runtime.health_interval_secs == 0 {
            problems.push("runtime.health_interval_secs must be at least 1".to_string());
        }
        if let Err(e) = self.runtime.balanced_weights.validate() {
            problems.push(format!("runtime.balanced_weights: {}", e));
        }

        let mut seen = HashSet::new();
        for entry in &self.backends {
            if entry.id.trim().is_empty() {
                problems.push("backend id must not be empty".to_string());
                continue;
            }
            if !seen.insert(entry.id.as_str()) {
                problems.push(format!("duplicate backend id '{}'", entry.id));
            }
            if bootstrap::builtin_kind(&entry.kind).is_none() {
                problems.push(format!(
                    "backend '{}' has unknown type '{}' (known: {})",
                    entry.id,
                    entry.kind,
                    bootstrap::builtin_kind_names().join(", ")
                ));
            }
            if entry.pool_size == Some(0) {
                problems.push(format!("backend '{}' pool_size must be at least 1", entry.id));
            }
            if let Some(q) = entry.quality {
                if !(0.0..=1.0).contains(&q) {
                    problems.push(format!("backend '{}' quality must be within 0..=1, got {}", entry.id, q));
                }
            }
            if let Some(c) = entry.cost_per_1k_tokens {
                if !c.is_finite() || c < 0.0 {
                    problems.push(format!("backend '{}' cost_per_1k_tokens must be non-negative, got {}", entry.id, c));
                }
            }
        }

        if !problems.is_empty() {
            anyhow::bail!("Invalid configuration: {}", problems.join("; "));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RuntimeConfig::parse("").unwrap();
        assert_eq!(config.runtime.max_pool_size, 5);
        assert_eq!(config.runtime.checkout_timeout(), Duration::from_secs(5));
        assert_eq!(config.runtime.execution_timeout_secs, 120);
        assert!(config.backends.is_empty());
    }

    #[test]
    fn test_backend_config_table_becomes_json() {
        let config = RuntimeConfig::parse(
            r#"
            [[backend]]
            id = "echo"
            type = "command"
            capabilities = ["streaming"]

            [backend.config]
            binary = "echo"
            args = ["-n"]
            timeout_secs = 3
            "#,
        )
        .unwrap();
        let entry = &config.backends[0];
        assert_eq!(entry.kind, "command");
        assert_eq!(entry.config["binary"], "echo");
        assert_eq!(entry.config["timeout_secs"], 3);
        assert!(entry.declared_capabilities().supports(Capability::Streaming));
    }

    #[test]
    fn test_debug_hides_config_values() {
        let config = RuntimeConfig::parse(
            r#"
            [[backend]]
            id = "x"
            type = "mock"
            [backend.config]
            api_key = "sk-secret"
            "#,
        )
        .unwrap();
        let rendered = format!("{:?}", config.backends[0]);
        assert!(rendered.contains("api_key"));
        assert!(!rendered.contains("sk-secret"));
    }
}
