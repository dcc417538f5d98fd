use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::tool::ToolCallRef;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accepts any client-supplied id that is non-empty after trimming.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    Tool,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TurnContent {
    Text(String),
    Structured(Value),
}

impl TurnContent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Structured(_) => "structured",
        }
    }

    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Self::Text(text) => Cow::Borrowed(text.as_str()),
            Self::Structured(value) => Cow::Owned(value.to_string()),
        }
    }
}

/// One immutable entry in a conversation's history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: TurnContent,
    pub tool: Option<ToolCallRef>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self::text(TurnRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(TurnRole::Assistant, text)
    }

    pub fn tool(call: ToolCallRef, record: Value) -> Self {
        Self {
            role: TurnRole::Tool,
            content: TurnContent::Structured(record),
            tool: Some(call),
            created_at: Utc::now(),
        }
    }

    fn text(role: TurnRole, text: impl Into<String>) -> Self {
        Self { role, content: TurnContent::Text(text.into()), tool: None, created_at: Utc::now() }
    }

    pub fn is_dialogue(&self) -> bool {
        matches!(self.role, TurnRole::User | TurnRole::Assistant)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ConversationId, Turn, TurnContent, TurnRole};
    use crate::domain::tool::{Backend, ToolCallRef};

    #[test]
    fn conversation_id_parse_rejects_blank_input() {
        assert_eq!(ConversationId::parse("   "), None);
        assert_eq!(
            ConversationId::parse("  thread-7 "),
            Some(ConversationId("thread-7".to_string()))
        );
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(ConversationId::generate(), ConversationId::generate());
    }

    #[test]
    fn tool_turn_records_operation_reference() {
        let turn = Turn::tool(
            ToolCallRef { backend: Backend::Crm, operation: "run_soql_query".to_string() },
            json!({"status": "completed"}),
        );

        assert_eq!(turn.role, TurnRole::Tool);
        assert!(!turn.is_dialogue());
        assert_eq!(turn.content.kind(), "structured");
        assert_eq!(turn.tool.as_ref().map(|call| call.backend), Some(Backend::Crm));
    }

    #[test]
    fn role_strings_are_stable() {
        for role in [TurnRole::User, TurnRole::Assistant, TurnRole::Tool] {
            assert_eq!(TurnRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(TurnContent::Text("hi".to_string()).as_text(), "hi");
    }
}
