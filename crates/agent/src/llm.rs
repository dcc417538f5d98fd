use async_trait::async_trait;
use parley_core::{BoundedResult, ToolCallRef, ToolOperation, Turn};
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OracleError {
    #[error("oracle transport failed: {0}")]
    Transport(String),
    #[error("oracle rejected the request with status {status}: {detail}")]
    Rejected { status: u16, detail: String },
    #[error("oracle returned an unusable response: {0}")]
    Malformed(String),
}

/// One operation the oracle asked to run, before it is checked against the catalog.
#[derive(Clone, Debug, PartialEq)]
pub struct ProposedCall {
    pub operation: String,
    pub arguments: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    Direct(String),
    ToolCalls(Vec<ProposedCall>),
}

#[derive(Clone, Debug)]
pub struct DecisionRequest<'a> {
    pub system_context: &'a str,
    pub history: &'a [Turn],
    pub message: &'a str,
    pub operations: &'a [ToolOperation],
}

/// What happened to the tool step of a turn, as seen by the compose call.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutcome {
    None,
    Completed { call: ToolCallRef, bounded: BoundedResult },
    Rejected { call: ToolCallRef, guidance: String },
    Failed { call: ToolCallRef, notice: String },
}

impl ToolOutcome {
    pub fn call(&self) -> Option<&ToolCallRef> {
        match self {
            Self::None => None,
            Self::Completed { call, .. }
            | Self::Rejected { call, .. }
            | Self::Failed { call, .. } => Some(call),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Completed { .. } => "completed",
            Self::Rejected { .. } => "rejected",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn truncated(&self) -> bool {
        matches!(self, Self::Completed { bounded, .. } if bounded.truncated)
    }
}

/// A tool result that passed the guard. Failed or rejected tool steps are
/// answered with a fixed notice and never reach compose.
#[derive(Clone, Copy, Debug)]
pub struct ComposedToolResult<'a> {
    pub call: &'a ToolCallRef,
    pub bounded: &'a BoundedResult,
}

#[derive(Clone, Debug)]
pub struct ComposeRequest<'a> {
    pub system_context: &'a str,
    pub history: &'a [Turn],
    pub message: &'a str,
    pub tool_result: Option<ComposedToolResult<'a>>,
}

/// The reasoning capability: decides tool use, then phrases the reply.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, OracleError>;
    async fn compose(&self, request: ComposeRequest<'_>) -> Result<String, OracleError>;
}
