//! Raw TOML configuration data types.
//!
//! These structs mirror the on-disk config file one to one. Durations are
//! plain integers (`*_secs`, `*_ms`) here and only become `Duration`s when
//! [`FileConfig::service_config`] builds the typed
//! [`ServiceConfig`](sage_application::ServiceConfig) consumed by the
//! application layer.

use crate::agent::DEFAULT_AGENT_COMMAND;
use sage_application::ServiceConfig;
use sage_application::config::{
    AgentOptions, BackpressureConfig, CacheConfig, PoolLimits, ProcessorConfig, RetryParams,
    SessionLimits, StreamingConfig,
};
use sage_application::ports::TechnologyEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("agent.answer_timeout_secs cannot be 0")]
    InvalidAnswerTimeout,

    #[error("agent.command cannot be empty")]
    EmptyAgentCommand,

    #[error("technology '{name}' has an empty repo path")]
    EmptyRepoPath { name: String },

    #[error("streaming.buffer_capacity cannot be 0")]
    ZeroBufferCapacity,
}

/// `[agent]`: how the backend agent is launched and bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileAgentConfig {
    /// Agent executable, resolved on PATH.
    pub command: String,
    /// How long to wait for the spawned agent's ready announcement.
    pub ready_timeout_secs: u64,
    /// Upper bound on one question's full answer stream.
    pub answer_timeout_secs: u64,
    /// Model override passed to the backend.
    pub model: Option<String>,
    /// System prompt applied to new sessions.
    pub system_prompt: Option<String>,
}

impl Default for FileAgentConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_AGENT_COMMAND.to_string(),
            ready_timeout_secs: 20,
            answer_timeout_secs: 300,
            model: None,
            system_prompt: None,
        }
    }
}

impl FileAgentConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

/// `[technologies.<name>]`: one registered technology.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileTechnologyConfig {
    /// Local checkout of the technology's repository.
    pub repo: PathBuf,
    /// One-line description shown by `list`.
    pub description: Option<String>,
}

/// `[pool]`: agent instance pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilePoolConfig {
    pub max_per_technology: usize,
    pub max_total: usize,
    pub base_port: u16,
    pub max_queue_size: usize,
    pub queue_timeout_secs: u64,
    pub instance_idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub port_retry_attempts: u32,
}

impl Default for FilePoolConfig {
    fn default() -> Self {
        Self {
            max_per_technology: 3,
            max_total: 10,
            base_port: 49152,
            max_queue_size: 50,
            queue_timeout_secs: 30,
            instance_idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 60,
            port_retry_attempts: 8,
        }
    }
}

/// `[sessions]`: concurrent session limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSessionsConfig {
    pub max_total_sessions: usize,
    pub max_sessions_per_technology: usize,
    pub idle_timeout_secs: u64,
    pub reuse_window_secs: u64,
}

impl Default for FileSessionsConfig {
    fn default() -> Self {
        Self {
            max_total_sessions: 20,
            max_sessions_per_technology: 5,
            idle_timeout_secs: 10 * 60,
            reuse_window_secs: 15 * 60,
        }
    }
}

/// `[streaming]`: stream lifecycle and per-stream processor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStreamingConfig {
    pub stream_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub terminal_retention_secs: u64,
    pub buffer_capacity: usize,
    pub rate_limit_per_sec: u32,
    pub max_concurrent_handlers: usize,
    pub backpressure_threshold: usize,
    pub backpressure_wait_budget_secs: u64,
    pub overflow_drop_batch: usize,
}

impl Default for FileStreamingConfig {
    fn default() -> Self {
        Self {
            stream_timeout_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
            terminal_retention_secs: 60,
            buffer_capacity: 1000,
            rate_limit_per_sec: 100,
            max_concurrent_handlers: 5,
            backpressure_threshold: 800,
            backpressure_wait_budget_secs: 5,
            overflow_drop_batch: 100,
        }
    }
}

/// `[backpressure]`: consumer-side event throttling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileBackpressureConfig {
    pub max_event_rate: u32,
    pub throttle_threshold_pct: u32,
    pub rate_window_secs: u64,
    pub degradation_steps: u8,
    pub check_responsiveness: bool,
}

impl Default for FileBackpressureConfig {
    fn default() -> Self {
        Self {
            max_event_rate: 100,
            throttle_threshold_pct: 80,
            rate_window_secs: 10,
            degradation_steps: 5,
            check_responsiveness: true,
        }
    }
}

/// `[cache]`: answer cache behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileCacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 15 * 60,
        }
    }
}

/// `[retry]`: backoff for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileRetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for FileRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
        }
    }
}

/// `[log]`: optional durable logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLogConfig {
    /// JSONL query log path; unset disables query logging.
    pub query_log: Option<PathBuf>,
}

/// Complete file configuration (raw TOML structure).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub agent: FileAgentConfig,
    pub technologies: BTreeMap<String, FileTechnologyConfig>,
    pub pool: FilePoolConfig,
    pub sessions: FileSessionsConfig,
    pub streaming: FileStreamingConfig,
    pub backpressure: FileBackpressureConfig,
    pub cache: FileCacheConfig,
    pub retry: FileRetryConfig,
    pub log: FileLogConfig,
}

impl FileConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.agent.answer_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidAnswerTimeout);
        }

        if self.agent.command.trim().is_empty() {
            return Err(ConfigValidationError::EmptyAgentCommand);
        }

        if self.streaming.buffer_capacity == 0 {
            return Err(ConfigValidationError::ZeroBufferCapacity);
        }

        for (name, technology) in &self.technologies {
            if technology.repo.as_os_str().is_empty() {
                return Err(ConfigValidationError::EmptyRepoPath { name: name.clone() });
            }
        }

        Ok(())
    }

    /// Builds the typed service configuration from the raw values.
    pub fn service_config(&self) -> ServiceConfig {
        let processor = ProcessorConfig::default()
            .with_buffer_capacity(self.streaming.buffer_capacity)
            .with_rate_limit(self.streaming.rate_limit_per_sec)
            .with_max_concurrent_handlers(self.streaming.max_concurrent_handlers)
            .with_backpressure_threshold(self.streaming.backpressure_threshold)
            .with_backpressure_wait_budget(Duration::from_secs(
                self.streaming.backpressure_wait_budget_secs,
            ))
            .with_overflow_drop_batch(self.streaming.overflow_drop_batch);

        let mut pool = PoolLimits::default()
            .with_max_per_technology(self.pool.max_per_technology)
            .with_max_total(self.pool.max_total)
            .with_base_port(self.pool.base_port)
            .with_max_queue_size(self.pool.max_queue_size)
            .with_queue_timeout(Duration::from_secs(self.pool.queue_timeout_secs))
            .with_instance_idle_timeout(Duration::from_secs(self.pool.instance_idle_timeout_secs))
            .with_sweep_interval(Duration::from_secs(self.pool.sweep_interval_secs));
        pool.port_retry_attempts = self.pool.port_retry_attempts;

        ServiceConfig::default()
            .with_pool(pool)
            .with_sessions(
                SessionLimits::default()
                    .with_max_total_sessions(self.sessions.max_total_sessions)
                    .with_max_sessions_per_technology(self.sessions.max_sessions_per_technology)
                    .with_idle_timeout(Duration::from_secs(self.sessions.idle_timeout_secs))
                    .with_reuse_window(Duration::from_secs(self.sessions.reuse_window_secs)),
            )
            .with_streaming(
                StreamingConfig::default()
                    .with_stream_timeout(Duration::from_secs(self.streaming.stream_timeout_secs))
                    .with_sweep_interval(Duration::from_secs(self.streaming.sweep_interval_secs))
                    .with_terminal_retention(Duration::from_secs(
                        self.streaming.terminal_retention_secs,
                    ))
                    .with_processor(processor),
            )
            .with_backpressure(
                BackpressureConfig::default()
                    .with_max_event_rate(self.backpressure.max_event_rate)
                    .with_throttle_threshold_pct(self.backpressure.throttle_threshold_pct)
                    .with_rate_window(Duration::from_secs(self.backpressure.rate_window_secs))
                    .with_degradation_steps(self.backpressure.degradation_steps)
                    .with_check_responsiveness(self.backpressure.check_responsiveness),
            )
            .with_cache(
                CacheConfig::default()
                    .with_enabled(self.cache.enabled)
                    .with_default_ttl(Duration::from_secs(self.cache.ttl_secs)),
            )
            .with_retry(
                RetryParams::default()
                    .with_max_retries(self.retry.max_retries)
                    .with_base_delay(Duration::from_millis(self.retry.base_delay_ms))
                    .with_max_delay(Duration::from_millis(self.retry.max_delay_ms)),
            )
            .with_agent(AgentOptions {
                model: self.agent.model.clone(),
                system_prompt: self.agent.system_prompt.clone(),
            })
            .with_answer_timeout(Duration::from_secs(self.agent.answer_timeout_secs))
    }

    /// Catalog entries from the `[technologies]` table, sorted by name.
    pub fn technology_entries(&self) -> Vec<TechnologyEntry> {
        self.technologies
            .iter()
            .map(|(name, technology)| TechnologyEntry {
                name: name.clone(),
                repo_path: technology.repo.clone(),
                description: technology.description.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FileConfig::default();
        assert_eq!(config.agent.command, DEFAULT_AGENT_COMMAND);
        assert!(config.technologies.is_empty());
        assert_eq!(config.pool.max_total, 10);
        assert_eq!(config.sessions.max_total_sessions, 20);
        assert!(config.cache.enabled);
        assert!(config.log.query_log.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_full_config() {
        let toml_str = r#"
[agent]
command = "my-agent"
ready_timeout_secs = 5
answer_timeout_secs = 120
model = "sage-large"

[technologies.react]
repo = "/srv/repos/react"
description = "React frontend library"

[technologies.tokio]
repo = "/srv/repos/tokio"

[pool]
max_total = 4
base_port = 50000

[sessions]
max_total_sessions = 8

[streaming]
buffer_capacity = 200
rate_limit_per_sec = 50

[backpressure]
max_event_rate = 40
check_responsiveness = false

[cache]
enabled = false
ttl_secs = 60

[retry]
max_retries = 1
base_delay_ms = 100

[log]
query_log = "/var/log/techsage/queries.jsonl"
"#;

        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.agent.command, "my-agent");
        assert_eq!(config.agent.model.as_deref(), Some("sage-large"));
        assert_eq!(config.technologies.len(), 2);
        assert_eq!(
            config.technologies["react"].repo,
            PathBuf::from("/srv/repos/react")
        );
        assert_eq!(config.pool.max_total, 4);
        assert_eq!(config.pool.max_per_technology, 3); // default survives
        assert_eq!(config.sessions.max_total_sessions, 8);
        assert_eq!(config.streaming.buffer_capacity, 200);
        assert_eq!(config.backpressure.max_event_rate, 40);
        assert!(!config.backpressure.check_responsiveness);
        assert!(!config.cache.enabled);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(
            config.log.query_log,
            Some(PathBuf::from("/var/log/techsage/queries.jsonl"))
        );
    }

    #[test]
    fn test_deserialize_partial_config() {
        let toml_str = r#"
[technologies.vue]
repo = "/srv/repos/vue"
"#;

        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.technologies.len(), 1);
        assert_eq!(config.agent.command, DEFAULT_AGENT_COMMAND);
        assert_eq!(config.pool.base_port, 49152);
        assert_eq!(config.retry.base_delay_ms, 1000);
    }

    #[test]
    fn test_validate_zero_answer_timeout() {
        let toml_str = r#"
[agent]
answer_timeout_secs = 0
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidAnswerTimeout)
        ));
    }

    #[test]
    fn test_validate_empty_repo_path() {
        let toml_str = r#"
[technologies.react]
description = "no repo configured"
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::EmptyRepoPath { name }) if name == "react"
        ));
    }

    #[test]
    fn test_service_config_maps_fields() {
        let toml_str = r#"
[agent]
answer_timeout_secs = 120
model = "sage-large"

[pool]
max_total = 4

[sessions]
reuse_window_secs = 60

[streaming]
buffer_capacity = 200
stream_timeout_secs = 90

[backpressure]
degradation_steps = 2

[cache]
ttl_secs = 30

[retry]
base_delay_ms = 250
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        let service = config.service_config();

        assert_eq!(service.answer_timeout, Duration::from_secs(120));
        assert_eq!(service.agent.model.as_deref(), Some("sage-large"));
        assert_eq!(service.pool.max_total, 4);
        assert_eq!(service.sessions.reuse_window, Duration::from_secs(60));
        assert_eq!(service.streaming.processor.buffer_capacity, 200);
        assert_eq!(service.streaming.stream_timeout, Duration::from_secs(90));
        assert_eq!(service.backpressure.degradation_steps, 2);
        assert_eq!(service.cache.default_ttl, Duration::from_secs(30));
        assert_eq!(service.retry.base_delay, Duration::from_millis(250));
        // Untouched knobs keep their defaults
        assert_eq!(service.pool.base_port, 49152);
        assert_eq!(service.streaming.processor.rate_limit_per_sec, 100);
    }

    #[test]
    fn test_technology_entries_are_sorted_by_name() {
        let toml_str = r#"
[technologies.vue]
repo = "/srv/repos/vue"

[technologies.react]
repo = "/srv/repos/react"
description = "React frontend library"
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        let entries = config.technology_entries();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "react");
        assert_eq!(
            entries[0].description.as_deref(),
            Some("React frontend library")
        );
        assert_eq!(entries[1].name, "vue");
    }
}
