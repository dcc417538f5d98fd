use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    Crm,
    RepoHost,
    Filesystem,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Crm, Backend::RepoHost, Backend::Filesystem];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crm => "crm",
            Self::RepoHost => "repo-host",
            Self::Filesystem => "filesystem",
        }
    }

    /// Key used for this backend in config tables and env var names.
    pub fn config_key(&self) -> &'static str {
        match self {
            Self::Crm => "crm",
            Self::RepoHost => "repo_host",
            Self::Filesystem => "filesystem",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "crm" => Some(Self::Crm),
            "repo-host" | "repo_host" => Some(Self::RepoHost),
            "filesystem" => Some(Self::Filesystem),
            _ => None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, schema-described callable action exposed by one backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOperation {
    pub backend: Backend,
    pub name: String,
    pub description: String,
    pub argument_schema: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolInvocation {
    pub operation: ToolOperation,
    pub arguments: Map<String, Value>,
}

impl ToolInvocation {
    pub fn call_ref(&self) -> ToolCallRef {
        ToolCallRef { backend: self.operation.backend, operation: self.operation.name.clone() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolCallRef {
    pub backend: Backend,
    pub operation: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ToolPayload {
    Json(Value),
    Text(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolResult {
    pub payload: ToolPayload,
    pub is_error: bool,
}

impl ToolResult {
    pub fn json(value: Value) -> Self {
        Self { payload: ToolPayload::Json(value), is_error: false }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self { payload: ToolPayload::Text(text.into()), is_error: false }
    }

    /// A result the backend itself flagged as failed.
    pub fn error(text: impl Into<String>) -> Self {
        Self { payload: ToolPayload::Text(text.into()), is_error: true }
    }

    pub fn byte_len(&self) -> usize {
        match &self.payload {
            ToolPayload::Json(value) => value.to_string().len(),
            ToolPayload::Text(text) => text.len(),
        }
    }

    /// Item count when the payload is a bare JSON array.
    pub fn item_count(&self) -> Option<usize> {
        match &self.payload {
            ToolPayload::Json(Value::Array(items)) => Some(items.len()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("backend `{backend}` is unavailable: {reason}")]
    BackendUnavailable { backend: Backend, reason: String },
    #[error("invalid arguments for `{operation}`: {reason}")]
    InvalidArguments { operation: String, reason: String },
    #[error("backend `{backend}` failed: {message}")]
    BackendError { backend: Backend, message: String },
}

impl ToolError {
    /// Only backend failures (including timeouts) are worth an immediate retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendError { .. })
    }

    pub fn class(&self) -> &'static str {
        match self {
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::BackendError { .. } => "backend_error",
        }
    }
}
