use std::io::{self, Write};

use parley_agent::{AgentRuntime, TurnRequest, TurnResponse};
use parley_core::config::LoadOptions;
use parley_core::{ApplicationError, ConversationId};
use parley_server::bootstrap::bootstrap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::commands::{async_runtime, bootstrap_failure, short_id, CommandResult};

const THREAD_PREVIEW: usize = 5;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub messages: usize,
    pub conversations: usize,
}

pub fn run() -> CommandResult {
    let runtime = match async_runtime("chat") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        let app = match bootstrap(LoadOptions::default()).await {
            Ok(app) => app,
            Err(error) => return bootstrap_failure("chat", error),
        };

        let input = BufReader::new(tokio::io::stdin());
        let mut output = io::stdout();
        let outcome = session(&app.runtime, input, &mut output).await;
        app.shutdown().await;

        match outcome {
            Ok(summary) => CommandResult::success(
                "chat",
                format!(
                    "chat ended after {} messages across {} conversations",
                    summary.messages, summary.conversations
                ),
            ),
            Err(error) => CommandResult::failure("chat", "terminal_io", error.to_string(), 7),
        }
    })
}

/// Reads one message per line until `quit`, `exit` or end of input.
/// `new` switches to a fresh conversation and `threads` lists known ones.
pub async fn session<R, W>(
    runtime: &AgentRuntime,
    input: R,
    output: &mut W,
) -> io::Result<SessionSummary>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut lines = input.lines();
    let mut conversation_id = ConversationId::generate();
    let mut summary = SessionSummary { messages: 0, conversations: 1 };

    writeln!(output, "Parley interactive chat")?;
    writeln!(output, "Type a message and press Enter.")?;
    writeln!(output, "  new      start a new conversation")?;
    writeln!(output, "  threads  list conversations")?;
    writeln!(output, "  quit     stop (also: exit)")?;
    writeln!(output, "Started new conversation: {}...", short_id(&conversation_id))?;

    loop {
        write!(output, "You: ")?;
        output.flush()?;

        let Some(line) = lines.next_line().await? else {
            writeln!(output)?;
            break;
        };
        let message = line.trim();
        if message.is_empty() {
            continue;
        }

        match message.to_ascii_lowercase().as_str() {
            "quit" | "exit" => {
                writeln!(output, "Goodbye!")?;
                break;
            }
            "new" => {
                conversation_id = ConversationId::generate();
                summary.conversations += 1;
                writeln!(output, "Started new conversation: {}...", short_id(&conversation_id))?;
                continue;
            }
            "threads" => {
                list_threads(runtime, &conversation_id, output).await?;
                continue;
            }
            _ => {}
        }

        summary.messages += 1;
        match send(runtime, &conversation_id, message).await {
            Ok(response) => write_reply(output, &response)?,
            Err(error) => writeln!(output, "Error: {error}")?,
        }
    }

    Ok(summary)
}

/// Ctrl-C abandons the in-flight turn; the message itself stays recorded.
async fn send(
    runtime: &AgentRuntime,
    conversation_id: &ConversationId,
    message: &str,
) -> Result<TurnResponse, String> {
    let cancel = CancellationToken::new();
    let request =
        TurnRequest { conversation_id: conversation_id.clone(), message: message.to_string() };
    let turn = runtime.handle_turn_with_cancel(request, cancel.clone());
    tokio::pin!(turn);

    let outcome = tokio::select! {
        outcome = &mut turn => outcome,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            turn.await
        }
    };
    outcome.map_err(|error| ApplicationError::from(error).to_string())
}

pub(crate) fn write_reply<W: Write>(output: &mut W, response: &TurnResponse) -> io::Result<()> {
    writeln!(output, "Assistant: {}", response.reply)?;
    if let Some(tool) = &response.used_tool {
        let truncated = if response.truncated { ", truncated" } else { "" };
        writeln!(output, "  [used {}.{}{truncated}]", tool.backend, tool.operation)?;
    }
    Ok(())
}

async fn list_threads<W: Write>(
    runtime: &AgentRuntime,
    current: &ConversationId,
    output: &mut W,
) -> io::Result<()> {
    let conversations = match runtime.store().conversations().await {
        Ok(conversations) => conversations,
        Err(error) => {
            writeln!(output, "Could not list conversations: {error}")?;
            return Ok(());
        }
    };

    writeln!(output, "Total conversations: {}", conversations.len())?;
    for id in conversations.iter().take(THREAD_PREVIEW) {
        let marker = if id == current { " (current)" } else { "" };
        writeln!(output, "  - {}{marker}", id)?;
    }
    if conversations.len() > THREAD_PREVIEW {
        writeln!(output, "  ... and {} more", conversations.len() - THREAD_PREVIEW)?;
    }
    Ok(())
}
