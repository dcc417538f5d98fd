use std::io::{self, Write};

use parley_agent::{AgentRuntime, TurnRequest};
use parley_core::config::LoadOptions;
use parley_core::{ApplicationError, ConversationId};
use parley_server::bootstrap::bootstrap;

use crate::commands::chat::write_reply;
use crate::commands::{async_runtime, bootstrap_failure, short_id, CommandResult};

pub const SCRIPT: &[&str] =
    &["Hello! What can you help me with?", "What tools do you have access to?"];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptReport {
    pub answered: usize,
    pub failed: usize,
}

pub fn run() -> CommandResult {
    let runtime = match async_runtime("auto") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        let app = match bootstrap(LoadOptions::default()).await {
            Ok(app) => app,
            Err(error) => return bootstrap_failure("auto", error),
        };

        let mut output = io::stdout();
        let outcome = run_script(&app.runtime, SCRIPT, &mut output).await;
        app.shutdown().await;

        match outcome {
            Ok(report) if report.failed == 0 => CommandResult::success(
                "auto",
                format!("{} scripted messages answered", report.answered),
            ),
            Ok(report) => CommandResult::failure(
                "auto",
                "turn_failed",
                format!("{} of {} scripted messages failed", report.failed, SCRIPT.len()),
                8,
            ),
            Err(error) => CommandResult::failure("auto", "terminal_io", error.to_string(), 7),
        }
    })
}

/// Sends each message in order on one fresh conversation.
pub async fn run_script<W: Write>(
    runtime: &AgentRuntime,
    script: &[&str],
    output: &mut W,
) -> io::Result<ScriptReport> {
    let conversation_id = ConversationId::generate();
    let mut report = ScriptReport::default();
    writeln!(output, "Automated run on conversation {}...", short_id(&conversation_id))?;

    for (index, message) in script.iter().enumerate() {
        writeln!(output, "Test {}: {message}", index + 1)?;
        writeln!(output, "{}", "-".repeat(60))?;

        let request =
            TurnRequest { conversation_id: conversation_id.clone(), message: message.to_string() };
        match runtime.handle_turn(request).await {
            Ok(response) => {
                report.answered += 1;
                write_reply(output, &response)?;
            }
            Err(error) => {
                report.failed += 1;
                writeln!(output, "Error: {}", ApplicationError::from(error))?;
            }
        }
        writeln!(output)?;
    }

    Ok(report)
}
