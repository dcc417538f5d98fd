//! stdio MCP client for one backend process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parley_agent::ToolBackend;
use parley_core::config::BackendConfig;
use parley_core::{Backend, ToolError, ToolInvocation, ToolOperation, ToolResult};
use rmcp::model::CallToolRequestParam;
use rmcp::service::RunningService;
use rmcp::transport::TokioChildProcess;
use rmcp::{RoleClient, ServiceExt};
use secrecy::ExposeSecret;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::convert::{operation_from_tool, result_from_call};

type Session = Arc<RunningService<RoleClient, ()>>;

/// Spawns the configured command on first use and keeps the session open.
/// A failed call drops the session so the next attempt respawns the process.
pub struct McpBackend {
    backend: Backend,
    config: BackendConfig,
    session: Mutex<Option<Session>>,
}

impl McpBackend {
    pub fn new(backend: Backend, config: BackendConfig) -> Self {
        Self { backend, config, session: Mutex::new(None) }
    }

    /// Command line as configured, without environment values.
    pub fn command_line(&self) -> String {
        std::iter::once(self.config.command.as_str())
            .chain(self.config.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub(crate) fn build_command(&self) -> Command {
        let mut command = Command::new(&self.config.command);
        command.args(&self.config.args);
        for (key, value) in &self.config.env {
            command.env(key, value.expose_secret());
        }
        command.kill_on_drop(true);
        command
    }

    async fn session(&self) -> Result<Session, ToolError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(Arc::clone(session));
        }

        debug!(
            event_name = "mcp.session.spawn",
            backend = %self.backend,
            command = %self.command_line(),
            "spawning backend process"
        );
        let transport = TokioChildProcess::new(self.build_command()).map_err(|error| {
            ToolError::BackendUnavailable {
                backend: self.backend,
                reason: format!("could not start `{}`: {error}", self.config.command),
            }
        })?;
        let service = ().serve(transport).await.map_err(|error| {
            ToolError::BackendUnavailable {
                backend: self.backend,
                reason: format!("handshake failed: {error}"),
            }
        })?;

        let session = Arc::new(service);
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn reset(&self) {
        self.session.lock().await.take();
    }

    /// Closes the child process if a session is open.
    pub async fn shutdown(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        // A session still shared with an in-flight call stops when that call drops it.
        if let Ok(service) = Arc::try_unwrap(session) {
            if let Err(error) = service.cancel().await {
                warn!(
                    event_name = "mcp.session.shutdown_failed",
                    backend = %self.backend,
                    error = %error,
                    "backend process did not stop cleanly"
                );
            }
        }
        info!(event_name = "mcp.session.closed", backend = %self.backend, "backend session closed");
    }
}

#[async_trait]
impl ToolBackend for McpBackend {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.config.discovery_timeout_secs)
    }

    async fn discover(&self) -> Result<Vec<ToolOperation>, ToolError> {
        let session = self.session().await?;
        let tools = match session.peer().list_all_tools().await {
            Ok(tools) => tools,
            Err(error) => {
                self.reset().await;
                return Err(ToolError::BackendUnavailable {
                    backend: self.backend,
                    reason: format!("tools/list failed: {error}"),
                });
            }
        };
        Ok(tools.into_iter().map(|tool| operation_from_tool(self.backend, tool)).collect())
    }

    async fn invoke(&self, invocation: &ToolInvocation) -> Result<ToolResult, ToolError> {
        let session = self.session().await?;
        let request = CallToolRequestParam {
            name: invocation.operation.name.clone().into(),
            arguments: Some(invocation.arguments.clone()),
        };

        match session.peer().call_tool(request).await {
            Ok(result) => Ok(result_from_call(result)),
            Err(error) => {
                self.reset().await;
                Err(ToolError::BackendError {
                    backend: self.backend,
                    message: format!("tools/call `{}` failed: {error}", invocation.operation.name),
                })
            }
        }
    }
}
