//! Agent configuration
//!
//! Loaded from a TOML file, validated on load. Secrets never live in the
//! file itself: the enrollment token and an optional direct broker URL are
//! read from the environment variables the file names.

use crate::protocol::validate_agent_id;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main agent configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub control_plane: ControlPlaneSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub duplex: DuplexSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub health: HealthSection,
}

/// Agent identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    /// Stable agent identity, reported as `serverId` (must match [a-zA-Z0-9._-]+)
    pub id: String,
    #[serde(default)]
    pub environment: Environment,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Staging,
    Development,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Control plane endpoint used for the startup authentication exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlPlaneSection {
    pub url: String,
    #[serde(default = "default_auth_path")]
    pub auth_path: String,
    /// Environment variable containing the agent enrollment token
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_auth_timeout")]
    pub timeout_secs: u64,
}

/// Durable queue transport settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSection {
    /// Environment variable that, when set, supplies the broker URL directly
    #[serde(default = "default_queue_url_env")]
    pub url_env: String,
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    #[serde(default = "default_message_ttl_hours")]
    pub message_ttl_hours: u32,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_ttl")]
    pub heartbeat_ttl_secs: u32,
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
    #[serde(default = "default_commands_exchange")]
    pub commands_exchange: String,
    #[serde(default = "default_results_queue")]
    pub results_queue: String,
    #[serde(default = "default_logs_exchange")]
    pub logs_exchange: String,
    #[serde(default = "default_heartbeats_queue")]
    pub heartbeats_queue: String,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            url_env: default_queue_url_env(),
            prefetch: default_prefetch(),
            message_ttl_hours: default_message_ttl_hours(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_ttl_secs: default_heartbeat_ttl(),
            max_redeliveries: default_max_redeliveries(),
            commands_exchange: default_commands_exchange(),
            results_queue: default_results_queue(),
            logs_exchange: default_logs_exchange(),
            heartbeats_queue: default_heartbeats_queue(),
        }
    }
}

/// Fallback duplex socket settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplexSection {
    /// Socket endpoint used when the auth grant does not carry one
    pub url: Option<String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
    #[serde(default = "default_duplex_concurrency")]
    pub max_concurrent_jobs: usize,
}

impl Default for DuplexSection {
    fn default() -> Self {
        Self {
            url: None,
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
            max_concurrent_jobs: default_duplex_concurrency(),
        }
    }
}

/// Exponential backoff shared by both transports (each keeps its own counters)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Give up after this many consecutive failed attempts (0 = never)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialsSection {
    #[serde(default = "default_credential_path")]
    pub path: PathBuf,
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            path: default_credential_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
    /// Interval between transport selection retries while degraded
    #[serde(default = "default_degraded_retry")]
    pub degraded_retry_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_health_port(),
            degraded_retry_secs: default_degraded_retry(),
        }
    }
}

fn default_auth_path() -> String {
    "/api/agents/authenticate".to_string()
}

fn default_token_env() -> String {
    "HOSTLINK_AGENT_TOKEN".to_string()
}

fn default_auth_timeout() -> u64 {
    10
}

fn default_queue_url_env() -> String {
    "HOSTLINK_AMQP_URL".to_string()
}

fn default_prefetch() -> u16 {
    5
}

fn default_message_ttl_hours() -> u32 {
    72 // 3 days
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_ttl() -> u32 {
    60
}

fn default_max_redeliveries() -> u32 {
    3
}

fn default_commands_exchange() -> String {
    "hostlink.commands".to_string()
}

fn default_results_queue() -> String {
    "hostlink.results".to_string()
}

fn default_logs_exchange() -> String {
    "hostlink.logs".to_string()
}

fn default_heartbeats_queue() -> String {
    "hostlink.heartbeats".to_string()
}

fn default_ping_interval() -> u64 {
    25
}

fn default_ping_timeout() -> u64 {
    10
}

fn default_duplex_concurrency() -> usize {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_jitter_ratio() -> f64 {
    0.2
}

fn default_credential_path() -> PathBuf {
    PathBuf::from("/var/lib/hostlink/credential.bin")
}

fn default_true() -> bool {
    true
}

fn default_health_port() -> u16 {
    8080
}

fn default_degraded_retry() -> u64 {
    60
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid agent ID format: {0}")]
    InvalidAgentId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_agent_id(&self.agent.id).map_err(|e| {
            ConfigError::InvalidAgentId(format!("'{}': {e}", self.agent.id))
        })?;

        url::Url::parse(&self.control_plane.url).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "control_plane.url '{}' is not a valid URL: {e}",
                self.control_plane.url
            ))
        })?;

        if let Some(socket_url) = &self.duplex.url {
            let parsed = url::Url::parse(socket_url).map_err(|e| {
                ConfigError::InvalidConfig(format!("duplex.url '{socket_url}' is invalid: {e}"))
            })?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplex.url must use ws:// or wss://, got '{}'",
                    parsed.scheme()
                )));
            }
        }

        if self.queue.prefetch == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue.prefetch must be greater than 0".to_string(),
            ));
        }

        if self.queue.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue.heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.base_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.base_delay_ms must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "reconnect.max_delay_ms ({}) must be >= base_delay_ms ({})",
                self.reconnect.max_delay_ms, self.reconnect.base_delay_ms
            )));
        }

        if !(0.0..=1.0).contains(&self.reconnect.jitter_ratio) {
            return Err(ConfigError::InvalidConfig(format!(
                "reconnect.jitter_ratio must be within 0.0..=1.0, got {}",
                self.reconnect.jitter_ratio
            )));
        }

        if self.duplex.ping_timeout_secs == 0 || self.duplex.ping_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "duplex ping interval and timeout must be greater than 0".to_string(),
            ));
        }

        if self.duplex.max_concurrent_jobs == 0 {
            return Err(ConfigError::InvalidConfig(
                "duplex.max_concurrent_jobs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: &str) -> Option<String> {
        std::env::var(env_var_name)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    /// Broker URL supplied directly through the environment, bypassing the vault
    pub fn queue_url_from_env(&self) -> Option<String> {
        Self::get_env_var_optional(&self.queue.url_env)
    }

    /// Enrollment token presented to the control plane
    pub fn agent_token(&self) -> Result<String, ConfigError> {
        Self::get_env_var_optional(&self.control_plane.token_env)
            .ok_or_else(|| ConfigError::EnvVarNotFound(self.control_plane.token_env.clone()))
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.control_plane.timeout_secs)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[agent]
id = "test-agent"
environment = "development"

[control_plane]
url = "http://127.0.0.1:9"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
