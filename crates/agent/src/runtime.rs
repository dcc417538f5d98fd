use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use parley_core::config::OrchestratorConfig;
use parley_core::turn::TurnEvent;
use parley_core::{
    ApplicationError, ConversationId, DomainError, OutputGuard, ToolCallRef, ToolError,
    ToolInvocation, ToolResult, Turn, TurnMachine, TurnTransitionError,
};
use parley_db::ConversationStore;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::conversation::{
    capability_summary, failure_notice, fallback_reply, raw_appendix, system_context,
    tool_record, truncation_suffix,
};
use crate::guardrails::{wants_raw_output, GuardrailDecision, GuardrailPolicy, RetryPolicy};
use crate::llm::{
    ComposeRequest, ComposedToolResult, Decision, DecisionRequest, Oracle, ToolOutcome,
};
use crate::tools::ToolRegistry;

const DECISION_FAILURE_REPLY: &str =
    "I'm having trouble working out how to handle that right now. Please try again in a moment.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnRequest {
    pub conversation_id: ConversationId,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnResponse {
    pub reply: String,
    pub used_tool: Option<ToolCallRef>,
    pub truncated: bool,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("conversation store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("turn cancelled")]
    Cancelled,
    #[error(transparent)]
    InvalidTransition(#[from] TurnTransitionError),
}

impl From<TurnError> for ApplicationError {
    fn from(value: TurnError) -> Self {
        match value {
            TurnError::EmptyMessage => Self::Domain(DomainError::EmptyMessage),
            TurnError::StoreUnavailable(message) => Self::Persistence(message),
            TurnError::Cancelled => Self::Cancelled,
            TurnError::InvalidTransition(error) => Self::Domain(DomainError::from(error)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeSettings {
    pub reasoning_timeout: Duration,
    /// How long a turn cancelled while queued waits to record its message.
    pub queued_cancel_grace: Duration,
    pub retry: RetryPolicy,
    pub working_directory: PathBuf,
    pub guardrails: GuardrailPolicy,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            reasoning_timeout: Duration::from_secs(60),
            queued_cancel_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            working_directory: PathBuf::from("."),
            guardrails: GuardrailPolicy::default(),
        }
    }
}

impl RuntimeSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            reasoning_timeout: Duration::from_secs(config.reasoning_timeout_secs),
            // Roughly the longest a running turn can hold the conversation lock.
            queued_cancel_grace: Duration::from_secs(
                config
                    .reasoning_timeout_secs
                    .saturating_add(config.tool_timeout_secs)
                    .saturating_mul(2),
            ),
            retry: RetryPolicy { limit: config.tool_retry_limit },
            working_directory: config.working_directory.clone(),
            guardrails: GuardrailPolicy::default(),
        }
    }
}

enum Interrupt {
    Cancelled,
    TimedOut,
}

struct Dispatch {
    result: Result<ToolResult, ToolError>,
    attempts: u32,
}

/// Drives one turn at a time per conversation through the turn state machine.
pub struct AgentRuntime {
    oracle: Arc<dyn Oracle>,
    registry: Arc<ToolRegistry>,
    store: Arc<dyn ConversationStore>,
    guard: OutputGuard,
    settings: RuntimeSettings,
    system_context: String,
    capabilities: String,
    locks: Mutex<HashMap<ConversationId, Arc<AsyncMutex<()>>>>,
}

impl AgentRuntime {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        registry: Arc<ToolRegistry>,
        store: Arc<dyn ConversationStore>,
        guard: OutputGuard,
        settings: RuntimeSettings,
    ) -> Self {
        let system_context = system_context(&settings.working_directory);
        let capabilities = capability_summary(&registry.list_operations());
        Self {
            oracle,
            registry,
            store,
            guard,
            settings,
            system_context,
            capabilities,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnResponse, TurnError> {
        self.handle_turn_with_cancel(request, CancellationToken::new()).await
    }

    /// Processes one user message. Turns on the same conversation are
    /// serialised; a cancelled turn still records the user's message.
    pub async fn handle_turn_with_cancel(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnResponse, TurnError> {
        let message = request.message.trim();
        if message.is_empty() {
            return Err(TurnError::EmptyMessage);
        }
        let conversation_id = request.conversation_id;

        let lock = self.conversation_lock(&conversation_id);
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = Arc::clone(&lock).lock_owned() => Some(guard),
        };
        let outcome = match guard {
            Some(_held) => self.run_turn(&conversation_id, message, &cancel).await,
            None => self.cancel_queued(&lock, &conversation_id, message).await,
        };
        drop(lock);
        self.prune_lock(&conversation_id);
        outcome
    }

    /// Waits (bounded) for the turn ahead to finish so the cancelled message
    /// is still recorded in order.
    async fn cancel_queued(
        &self,
        lock: &Arc<AsyncMutex<()>>,
        conversation_id: &ConversationId,
        message: &str,
    ) -> Result<TurnResponse, TurnError> {
        match tokio::time::timeout(self.settings.queued_cancel_grace, lock.lock()).await {
            Ok(_held) => {
                let mut machine = TurnMachine::new();
                self.cancel_turn(&mut machine, conversation_id, message).await
            }
            Err(_) => {
                warn!(
                    event_name = "agent.turn.cancel_unrecorded",
                    conversation_id = %conversation_id,
                    grace_secs = self.settings.queued_cancel_grace.as_secs(),
                    "conversation stayed busy; cancelled message was not recorded"
                );
                Err(TurnError::Cancelled)
            }
        }
    }

    async fn run_turn(
        &self,
        conversation_id: &ConversationId,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnResponse, TurnError> {
        let mut machine = TurnMachine::new();

        let history = self
            .store
            .history(conversation_id)
            .await
            .map_err(|error| TurnError::StoreUnavailable(error.to_string()))?;

        let mut outcome = ToolOutcome::None;
        let reply = match self.settings.guardrails.evaluate(message, &self.capabilities) {
            GuardrailDecision::AnswerDirectly { reason_code, reply } => {
                info!(
                    event_name = "agent.turn.prefiltered",
                    conversation_id = %conversation_id,
                    reason_code,
                    "answered without consulting tools"
                );
                self.advance(&mut machine, TurnEvent::PreFiltered, conversation_id)?;
                self.advance(&mut machine, TurnEvent::ComposeStarted, conversation_id)?;
                reply
            }
            GuardrailDecision::Allow => {
                self.advance(&mut machine, TurnEvent::ContextAssembled, conversation_id)?;
                let reasoned =
                    self.reason(&mut machine, conversation_id, &history, message, cancel).await;
                match reasoned {
                    Ok((reply, tool_outcome)) => {
                        outcome = tool_outcome;
                        reply
                    }
                    Err(TurnError::Cancelled) => {
                        return self.cancel_turn(&mut machine, conversation_id, message).await;
                    }
                    Err(error) => return Err(error),
                }
            }
        };

        if cancel.is_cancelled() {
            return self.cancel_turn(&mut machine, conversation_id, message).await;
        }

        self.persist(conversation_id, message, &outcome, &reply).await?;
        self.advance(&mut machine, TurnEvent::TurnsAppended, conversation_id)?;
        self.advance(&mut machine, TurnEvent::ReplyReturned, conversation_id)?;

        Ok(TurnResponse {
            reply,
            used_tool: outcome.call().cloned(),
            truncated: outcome.truncated(),
        })
    }

    /// Runs from `Reasoning` up to `ComposingFinalAnswer`, returning the reply.
    async fn reason(
        &self,
        machine: &mut TurnMachine,
        conversation_id: &ConversationId,
        history: &[Turn],
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, ToolOutcome), TurnError> {
        let operations = self.registry.list_operations();
        let decision = within(
            cancel,
            self.settings.reasoning_timeout,
            self.oracle.decide(DecisionRequest {
                system_context: &self.system_context,
                history,
                message,
                operations: &operations,
            }),
        )
        .await;

        let decision = match decision {
            Err(Interrupt::Cancelled) => return Err(TurnError::Cancelled),
            Err(Interrupt::TimedOut) => {
                warn!(
                    event_name = "agent.oracle.decide_failed",
                    conversation_id = %conversation_id,
                    error_class = "timeout",
                    "oracle decision timed out"
                );
                self.advance(machine, TurnEvent::DecisionFailed, conversation_id)?;
                self.advance(machine, TurnEvent::ComposeStarted, conversation_id)?;
                return Ok((DECISION_FAILURE_REPLY.to_string(), ToolOutcome::None));
            }
            Ok(Err(error)) => {
                warn!(
                    event_name = "agent.oracle.decide_failed",
                    conversation_id = %conversation_id,
                    error_class = "oracle_error",
                    error = %error,
                    "oracle decision failed"
                );
                self.advance(machine, TurnEvent::DecisionFailed, conversation_id)?;
                self.advance(machine, TurnEvent::ComposeStarted, conversation_id)?;
                return Ok((DECISION_FAILURE_REPLY.to_string(), ToolOutcome::None));
            }
            Ok(Ok(decision)) => decision,
        };

        let calls = match decision {
            Decision::Direct(text) => {
                self.advance(machine, TurnEvent::NoToolNeeded, conversation_id)?;
                self.advance(machine, TurnEvent::ComposeStarted, conversation_id)?;
                return Ok((text, ToolOutcome::None));
            }
            Decision::ToolCalls(calls) => calls,
        };

        let mut calls = calls.into_iter();
        let Some(first) = calls.next() else {
            self.advance(machine, TurnEvent::ContractViolated, conversation_id)?;
            return self.compose_direct(machine, conversation_id, history, message, cancel).await;
        };
        let ignored = calls.map(|call| call.operation).collect::<Vec<_>>();
        if !ignored.is_empty() {
            warn!(
                event_name = "agent.decision.extra_calls",
                conversation_id = %conversation_id,
                chosen = %first.operation,
                ignored = ?ignored,
                "oracle proposed several operations; only the first runs"
            );
        }

        let invocation = match self.registry.resolve(&first.operation, first.arguments) {
            Ok(invocation) => invocation,
            Err(error) => {
                warn!(
                    event_name = "agent.reasoning.contract_violation",
                    conversation_id = %conversation_id,
                    operation = %first.operation,
                    error = %error,
                    "oracle proposed an unusable call; answering directly"
                );
                self.advance(machine, TurnEvent::ContractViolated, conversation_id)?;
                return self
                    .compose_direct(machine, conversation_id, history, message, cancel)
                    .await;
            }
        };

        self.advance(machine, TurnEvent::ToolChosen, conversation_id)?;
        self.advance(machine, TurnEvent::DispatchStarted, conversation_id)?;
        let call = invocation.call_ref();

        let Dispatch { result, attempts } =
            self.invoke_with_retry(&invocation, conversation_id, cancel).await?;
        let result = match result.and_then(|result| reported_failure(&call, result)) {
            Ok(result) => result,
            Err(error) => {
                warn!(
                    event_name = "agent.tool.failed",
                    conversation_id = %conversation_id,
                    backend = %call.backend,
                    operation = %call.operation,
                    error_class = error.class(),
                    error = %error,
                    attempts,
                    "tool step failed"
                );
                self.advance(machine, TurnEvent::ToolFailed, conversation_id)?;
                let notice = failure_notice(&error, attempts);
                return Ok((notice.clone(), ToolOutcome::Failed { call, notice }));
            }
        };

        let bounded = match self.guard.reduce(call.backend, result) {
            Ok(bounded) => bounded,
            Err(rejected) => {
                info!(
                    event_name = "agent.guard.rejected",
                    conversation_id = %conversation_id,
                    backend = %call.backend,
                    depth = rejected.depth,
                    max_depth = rejected.max_depth,
                    "tool output rejected as too broad"
                );
                self.advance(machine, TurnEvent::ToolFailed, conversation_id)?;
                let guidance = rejected.guidance;
                return Ok((guidance.clone(), ToolOutcome::Rejected { call, guidance }));
            }
        };
        self.advance(machine, TurnEvent::ResultBounded, conversation_id)?;
        self.advance(machine, TurnEvent::ComposeStarted, conversation_id)?;

        let tool_result = ComposedToolResult { call: &call, bounded: &bounded };
        let composed =
            self.compose(conversation_id, history, message, Some(tool_result), cancel).await?;
        let mut reply = composed.unwrap_or_else(|| fallback_reply(Some(tool_result)));

        if let Some(suffix) = truncation_suffix(&bounded) {
            if !reply.contains(&suffix) {
                reply.push_str("\n\n");
                reply.push_str(&suffix);
            }
        }
        if wants_raw_output(message) {
            reply.push_str(&raw_appendix(&bounded));
        }
        Ok((reply, ToolOutcome::Completed { call, bounded }))
    }

    async fn compose_direct(
        &self,
        machine: &mut TurnMachine,
        conversation_id: &ConversationId,
        history: &[Turn],
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, ToolOutcome), TurnError> {
        self.advance(machine, TurnEvent::ComposeStarted, conversation_id)?;
        let reply = self
            .compose(conversation_id, history, message, None, cancel)
            .await?
            .unwrap_or_else(|| fallback_reply(None));
        Ok((reply, ToolOutcome::None))
    }

    /// `Ok(None)` means the compose call failed or timed out.
    async fn compose(
        &self,
        conversation_id: &ConversationId,
        history: &[Turn],
        message: &str,
        tool_result: Option<ComposedToolResult<'_>>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, TurnError> {
        let composed = within(
            cancel,
            self.settings.reasoning_timeout,
            self.oracle.compose(ComposeRequest {
                system_context: &self.system_context,
                history,
                message,
                tool_result,
            }),
        )
        .await;

        match composed {
            Err(Interrupt::Cancelled) => Err(TurnError::Cancelled),
            Ok(Ok(text)) => Ok(Some(text)),
            Err(Interrupt::TimedOut) => {
                warn!(
                    event_name = "agent.oracle.compose_failed",
                    conversation_id = %conversation_id,
                    error_class = "timeout",
                    "compose timed out; using fallback reply"
                );
                Ok(None)
            }
            Ok(Err(error)) => {
                warn!(
                    event_name = "agent.oracle.compose_failed",
                    conversation_id = %conversation_id,
                    error_class = "oracle_error",
                    error = %error,
                    "compose failed; using fallback reply"
                );
                Ok(None)
            }
        }
    }

    /// The error is cancellation; the dispatch carries the final tool result.
    async fn invoke_with_retry(
        &self,
        invocation: &ToolInvocation,
        conversation_id: &ConversationId,
        cancel: &CancellationToken,
    ) -> Result<Dispatch, TurnError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                result = self.registry.invoke(invocation) => result,
            };
            match result {
                Err(error) if self.settings.retry.should_retry(&error, attempts) => {
                    warn!(
                        event_name = "agent.tool.retry",
                        conversation_id = %conversation_id,
                        operation = %invocation.operation.name,
                        attempt = attempts,
                        error_class = error.class(),
                        error = %error,
                        "retrying tool call once"
                    );
                }
                result => return Ok(Dispatch { result, attempts }),
            }
        }
    }

    async fn persist(
        &self,
        conversation_id: &ConversationId,
        message: &str,
        outcome: &ToolOutcome,
        reply: &str,
    ) -> Result<(), TurnError> {
        self.append(conversation_id, Turn::user(message)).await?;
        if let Some(call) = outcome.call() {
            self.append(conversation_id, Turn::tool(call.clone(), tool_record(outcome))).await?;
        }
        self.append(conversation_id, Turn::assistant(reply)).await
    }

    async fn append(&self, conversation_id: &ConversationId, turn: Turn) -> Result<(), TurnError> {
        self.store.append(conversation_id, turn).await.map_err(|error| {
            warn!(
                event_name = "agent.store.append_failed",
                conversation_id = %conversation_id,
                error = %error,
                "could not record turn"
            );
            TurnError::StoreUnavailable(error.to_string())
        })
    }

    async fn cancel_turn(
        &self,
        machine: &mut TurnMachine,
        conversation_id: &ConversationId,
        message: &str,
    ) -> Result<TurnResponse, TurnError> {
        self.advance(machine, TurnEvent::CancelRequested, conversation_id)?;
        self.append(conversation_id, Turn::user(message)).await?;
        Err(TurnError::Cancelled)
    }

    fn advance(
        &self,
        machine: &mut TurnMachine,
        event: TurnEvent,
        conversation_id: &ConversationId,
    ) -> Result<(), TurnError> {
        let outcome = machine.apply(event)?;
        info!(
            event_name = "agent.turn.transition",
            conversation_id = %conversation_id,
            from = outcome.from.as_str(),
            to = outcome.to.as_str(),
            event = outcome.event.as_str(),
            "turn transition"
        );
        Ok(())
    }

    fn conversation_lock(&self, conversation_id: &ConversationId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(conversation_id.clone()).or_default())
    }

    fn prune_lock(&self, conversation_id: &ConversationId) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(conversation_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(conversation_id);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A result the backend flagged as an error is a failure, never data to show.
fn reported_failure(call: &ToolCallRef, result: ToolResult) -> Result<ToolResult, ToolError> {
    if !result.is_error {
        return Ok(result);
    }
    Err(ToolError::BackendError {
        backend: call.backend,
        message: format!(
            "`{}` reported an error result ({} bytes)",
            call.operation,
            result.byte_len()
        ),
    })
}

async fn within<F: Future>(
    cancel: &CancellationToken,
    limit: Duration,
    future: F,
) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        outcome = tokio::time::timeout(limit, future) => outcome.map_err(|_| Interrupt::TimedOut),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parley_core::{ConversationId, OutputGuard, TurnRole};
    use parley_db::{ConversationStore, InMemoryConversationStore};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::{AgentRuntime, RuntimeSettings, TurnError, TurnRequest};
    use crate::testing::ScriptedOracle;
    use crate::tools::ToolRegistry;

    fn runtime(oracle: ScriptedOracle, settings: RuntimeSettings) -> AgentRuntime {
        AgentRuntime::new(
            Arc::new(oracle),
            Arc::new(ToolRegistry::default()),
            Arc::new(InMemoryConversationStore::new()),
            OutputGuard::default(),
            settings,
        )
    }

    fn request(id: &ConversationId, message: &str) -> TurnRequest {
        TurnRequest { conversation_id: id.clone(), message: message.to_string() }
    }

    #[tokio::test]
    async fn blank_message_is_rejected_before_any_work() {
        let runtime = runtime(ScriptedOracle::direct("unused"), RuntimeSettings::default());
        let id = ConversationId::generate();

        let result = runtime.handle_turn(request(&id, "   ")).await;

        assert_eq!(result, Err(TurnError::EmptyMessage));
        assert_eq!(runtime.store().history(&id).await.map(|turns| turns.len()).ok(), Some(0));
    }

    #[tokio::test]
    async fn decide_timeout_degrades_to_notice() {
        let oracle = ScriptedOracle::direct("too late").with_decide_delay(Duration::from_secs(5));
        let settings = RuntimeSettings {
            reasoning_timeout: Duration::from_millis(20),
            ..RuntimeSettings::default()
        };
        let runtime = runtime(oracle, settings);
        let id = ConversationId::generate();

        let response = runtime.handle_turn(request(&id, "Summarise the open deals")).await;

        let reply = response.map(|response| response.reply).unwrap_or_default();
        assert!(reply.contains("having trouble"));
        assert_eq!(runtime.store().history(&id).await.map(|turns| turns.len()).ok(), Some(2));
    }

    #[tokio::test]
    async fn cancellation_keeps_the_user_turn_only() {
        let oracle = ScriptedOracle::direct("never").with_decide_delay(Duration::from_secs(5));
        let runtime = Arc::new(runtime(oracle, RuntimeSettings::default()));
        let id = ConversationId::generate();
        let cancel = CancellationToken::new();

        let task = {
            let runtime = Arc::clone(&runtime);
            let cancel = cancel.clone();
            let request = request(&id, "Find accounts in Berlin");
            tokio::spawn(async move { runtime.handle_turn_with_cancel(request, cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = task.await.ok();
        assert_eq!(result, Some(Err(TurnError::Cancelled)));
        let history = runtime.store().history(&id).await.unwrap_or_default();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, TurnRole::User);
        assert_eq!(runtime.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn contract_violation_answers_directly() {
        let oracle = ScriptedOracle::calling("no_such_operation", json!({}))
            .with_compose(Ok("I can't do that, but here's what I know.".to_string()));
        let runtime = runtime(oracle, RuntimeSettings::default());
        let id = ConversationId::generate();

        let response = runtime.handle_turn(request(&id, "Delete every repository")).await;

        let Ok(response) = response else {
            panic!("contract violation should still answer");
        };
        assert_eq!(response.used_tool, None);
        assert_eq!(response.reply, "I can't do that, but here's what I know.");
    }
}
