//! Process-spawning implementation of [`AgentGateway`].

use crate::agent::instance::AgentInstance;
use async_trait::async_trait;
use sage_application::ports::{AgentGateway, AgentTransport, GatewayError, InstanceConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Agent executable looked up on PATH when none is configured.
pub const DEFAULT_AGENT_COMMAND: &str = "techsage-agent";

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(20);

/// Gateway that runs one local agent process per instance.
///
/// The resource pool decides when instances are created and which port each
/// one gets; this type only knows how to turn a port plus an
/// [`InstanceConfig`] into a live [`AgentInstance`].
pub struct ProcessAgentGateway {
    command: String,
    ready_timeout: Duration,
}

impl ProcessAgentGateway {
    /// Gateway using [`DEFAULT_AGENT_COMMAND`] from PATH.
    pub fn new() -> Self {
        Self::with_command(DEFAULT_AGENT_COMMAND)
    }

    /// Gateway using a custom agent command.
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    /// Overrides how long spawn waits for the ready announcement.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// The configured agent command.
    pub fn command(&self) -> &str {
        &self.command
    }
}

impl Default for ProcessAgentGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentGateway for ProcessAgentGateway {
    async fn create_instance(
        &self,
        port: u16,
        config: &InstanceConfig,
    ) -> Result<Arc<dyn AgentTransport>, GatewayError> {
        let instance =
            AgentInstance::spawn(&self.command, port, config, self.ready_timeout).await?;

        info!(
            technology = %config.technology,
            port = instance.port(),
            "agent instance started"
        );

        Ok(Arc::new(instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sage_domain::Technology;
    use std::path::PathBuf;

    fn test_config() -> InstanceConfig {
        InstanceConfig {
            technology: Technology::new("react"),
            repo_path: PathBuf::from("/srv/repos/react"),
            model: None,
            system_prompt: None,
        }
    }

    #[tokio::test]
    async fn test_missing_agent_binary_is_a_spawn_failure() {
        let gateway = ProcessAgentGateway::with_command("no-such-agent-on-any-path")
            .with_ready_timeout(Duration::from_secs(1));

        let err = gateway.create_instance(49152, &test_config()).await.unwrap_err();
        match err {
            GatewayError::SpawnFailed(message) => {
                assert!(message.contains("no-such-agent-on-any-path"));
            }
            other => panic!("expected spawn failure, got {other:?}"),
        }
    }

    #[test]
    fn test_default_command() {
        let gateway = ProcessAgentGateway::new();
        assert_eq!(gateway.command(), DEFAULT_AGENT_COMMAND);
    }
}
