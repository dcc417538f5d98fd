//! Scripted collaborators for exercising the runtime without real backends,
//! an LLM endpoint, or a database.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use parley_core::{
    Backend, BoundedResult, ConversationId, ToolError, ToolInvocation, ToolOperation, ToolResult,
    Turn,
};
use parley_db::{ConversationStore, RepositoryError};
use serde_json::Value;

use crate::llm::{ComposeRequest, Decision, DecisionRequest, Oracle, OracleError, ProposedCall};
use crate::tools::ToolBackend;

pub fn operation(backend: Backend, name: &str, argument_schema: Value) -> ToolOperation {
    ToolOperation {
        backend,
        name: name.to_string(),
        description: format!("{name} on {backend}"),
        argument_schema,
    }
}

/// Pops scripted entries in order; the last one repeats forever.
struct Script<T> {
    entries: Mutex<Vec<T>>,
}

impl<T: Clone> Script<T> {
    fn new(entries: Vec<T>) -> Self {
        Self { entries: Mutex::new(entries) }
    }

    fn push(&self, entry: T) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
    }

    fn next(&self) -> Option<T> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() > 1 {
            Some(entries.remove(0))
        } else {
            entries.first().cloned()
        }
    }
}

pub struct ScriptedBackend {
    backend: Backend,
    operations: Vec<ToolOperation>,
    discovery_error: Option<String>,
    results: Script<Result<ToolResult, ToolError>>,
    delay: Option<Duration>,
    discoveries: AtomicUsize,
    invocations: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(backend: Backend, operations: Vec<ToolOperation>) -> Self {
        Self {
            backend,
            operations,
            discovery_error: None,
            results: Script::new(Vec::new()),
            delay: None,
            discoveries: AtomicUsize::new(0),
            invocations: AtomicUsize::new(0),
        }
    }

    pub fn unreachable(backend: Backend, reason: &str) -> Self {
        Self { discovery_error: Some(reason.to_string()), ..Self::new(backend, Vec::new()) }
    }

    /// Queues the next invocation result; the last queued result repeats.
    pub fn with_result(self, result: Result<ToolResult, ToolError>) -> Self {
        self.results.push(result);
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        Self { delay: Some(delay), ..self }
    }

    pub fn discoveries(&self) -> usize {
        self.discoveries.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolBackend for ScriptedBackend {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn discover(&self) -> Result<Vec<ToolOperation>, ToolError> {
        self.discoveries.fetch_add(1, Ordering::SeqCst);
        match &self.discovery_error {
            Some(reason) => {
                Err(ToolError::BackendUnavailable { backend: self.backend, reason: reason.clone() })
            }
            None => Ok(self.operations.clone()),
        }
    }

    async fn invoke(&self, _invocation: &ToolInvocation) -> Result<ToolResult, ToolError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.results.next().unwrap_or_else(|| Ok(ToolResult::text("ok")))
    }
}

pub struct ScriptedOracle {
    decisions: Script<Result<Decision, OracleError>>,
    compositions: Script<Result<String, OracleError>>,
    decide_delay: Option<Duration>,
    compose_delay: Option<Duration>,
    decide_calls: AtomicUsize,
    compose_calls: AtomicUsize,
    last_tool_result: Mutex<Option<BoundedResult>>,
    last_operation_count: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new(decision: Result<Decision, OracleError>) -> Self {
        Self {
            decisions: Script::new(vec![decision]),
            compositions: Script::new(Vec::new()),
            decide_delay: None,
            compose_delay: None,
            decide_calls: AtomicUsize::new(0),
            compose_calls: AtomicUsize::new(0),
            last_tool_result: Mutex::new(None),
            last_operation_count: AtomicUsize::new(0),
        }
    }

    pub fn direct(text: &str) -> Self {
        Self::new(Ok(Decision::Direct(text.to_string())))
    }

    pub fn calling(operation: &str, arguments: Value) -> Self {
        Self::new(Ok(Decision::ToolCalls(vec![ProposedCall {
            operation: operation.to_string(),
            arguments,
        }])))
    }

    /// Queues the next compose result; the last queued result repeats.
    pub fn with_compose(self, result: Result<String, OracleError>) -> Self {
        self.compositions.push(result);
        self
    }

    pub fn with_decide_delay(self, delay: Duration) -> Self {
        Self { decide_delay: Some(delay), ..self }
    }

    pub fn with_compose_delay(self, delay: Duration) -> Self {
        Self { compose_delay: Some(delay), ..self }
    }

    pub fn decide_calls(&self) -> usize {
        self.decide_calls.load(Ordering::SeqCst)
    }

    pub fn compose_calls(&self) -> usize {
        self.compose_calls.load(Ordering::SeqCst)
    }

    /// Operation count offered in the most recent decide call.
    pub fn last_operation_count(&self) -> usize {
        self.last_operation_count.load(Ordering::SeqCst)
    }

    /// Bounded tool content handed to the most recent compose call, if any.
    pub fn last_tool_result(&self) -> Option<BoundedResult> {
        self.last_tool_result.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, OracleError> {
        self.decide_calls.fetch_add(1, Ordering::SeqCst);
        self.last_operation_count.store(request.operations.len(), Ordering::SeqCst);
        if let Some(delay) = self.decide_delay {
            tokio::time::sleep(delay).await;
        }
        self.decisions
            .next()
            .unwrap_or_else(|| Err(OracleError::Malformed("no decision scripted".to_string())))
    }

    async fn compose(&self, request: ComposeRequest<'_>) -> Result<String, OracleError> {
        self.compose_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_tool_result.lock().unwrap_or_else(PoisonError::into_inner) =
            request.tool_result.map(|result| result.bounded.clone());
        if let Some(delay) = self.compose_delay {
            tokio::time::sleep(delay).await;
        }
        self.compositions.next().unwrap_or_else(|| Ok("Here is what I found.".to_string()))
    }
}

/// Store whose writes always fail; reads succeed with empty history.
#[derive(Default)]
pub struct UnavailableStore;

#[async_trait]
impl ConversationStore for UnavailableStore {
    async fn append(&self, _id: &ConversationId, _turn: Turn) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("disk full".to_string()))
    }

    async fn history(&self, _id: &ConversationId) -> Result<Vec<Turn>, RepositoryError> {
        Ok(Vec::new())
    }

    async fn conversations(&self) -> Result<Vec<ConversationId>, RepositoryError> {
        Ok(Vec::new())
    }
}
