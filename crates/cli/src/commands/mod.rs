pub mod auto;
pub mod chat;
pub mod doctor;
pub mod migrate;
pub mod tools;

use parley_core::ConversationId;
use parley_server::bootstrap::BootstrapError;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Multi-threaded so backend child processes and the oracle client can make
/// progress while the command waits on stdin.
pub(crate) fn async_runtime(command: &str) -> Result<tokio::runtime::Runtime, CommandResult> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            3,
        )
    })
}

pub(crate) fn bootstrap_failure(command: &str, error: BootstrapError) -> CommandResult {
    let (error_class, exit_code) = match &error {
        BootstrapError::Config(_) => ("config_validation", 2),
        BootstrapError::DatabaseConnect(_) => ("db_connectivity", 4),
        BootstrapError::Migration(_) => ("migration", 5),
        BootstrapError::Oracle(_) => ("oracle_client", 6),
    };
    CommandResult::failure(command, error_class, error.to_string(), exit_code)
}

/// First eight characters, enough to tell conversations apart on screen.
pub(crate) fn short_id(id: &ConversationId) -> &str {
    id.as_str().get(..8).unwrap_or(id.as_str())
}
