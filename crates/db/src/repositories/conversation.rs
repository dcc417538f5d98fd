use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::conversation::{ConversationId, Turn, TurnContent, TurnRole};
use parley_core::domain::tool::{Backend, ToolCallRef};

use super::{ConversationStore, RepositoryError};
use crate::DbPool;

pub struct SqlConversationStore {
    pool: DbPool,
}

impl SqlConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationStore for SqlConversationStore {
    async fn append(&self, id: &ConversationId, turn: Turn) -> Result<(), RepositoryError> {
        let content = match &turn.content {
            TurnContent::Text(text) => text.clone(),
            TurnContent::Structured(value) => value.to_string(),
        };

        // seq is computed in the same statement so concurrent writers cannot
        // reuse a slot; the unique index rejects any collision.
        sqlx::query(
            r#"
            INSERT INTO conversation_turn (
                conversation_id, seq, role, content_kind, content,
                tool_backend, tool_operation, created_at
            )
            SELECT ?, COALESCE(MAX(seq), 0) + 1, ?, ?, ?, ?, ?, ?
            FROM conversation_turn
            WHERE conversation_id = ?
            "#,
        )
        .bind(id.as_str())
        .bind(turn.role.as_str())
        .bind(turn.content.kind())
        .bind(content)
        .bind(turn.tool.as_ref().map(|call| call.backend.as_str()))
        .bind(turn.tool.as_ref().map(|call| call.operation.as_str()))
        .bind(turn.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn history(&self, id: &ConversationId) -> Result<Vec<Turn>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT role, content_kind, content, tool_backend, tool_operation, created_at
            FROM conversation_turn
            WHERE conversation_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(turn_from_row).collect()
    }

    async fn conversations(&self) -> Result<Vec<ConversationId>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT conversation_id, MAX(id) AS last_turn_id
            FROM conversation_turn
            GROUP BY conversation_id
            ORDER BY last_turn_id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ConversationId, RepositoryError> {
                Ok(ConversationId(row.try_get::<String, _>("conversation_id")?))
            })
            .collect()
    }
}

fn turn_from_row(row: &SqliteRow) -> Result<Turn, RepositoryError> {
    let role_raw = row.try_get::<String, _>("role")?;
    let role = TurnRole::parse(&role_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown role `{role_raw}`")))?;

    let kind = row.try_get::<String, _>("content_kind")?;
    let raw = row.try_get::<String, _>("content")?;
    let content = match kind.as_str() {
        "text" => TurnContent::Text(raw),
        "structured" => TurnContent::Structured(serde_json::from_str(&raw).map_err(|error| {
            RepositoryError::Decode(format!("invalid structured content: {error}"))
        })?),
        other => return Err(RepositoryError::Decode(format!("unknown content kind `{other}`"))),
    };

    let backend = row.try_get::<Option<String>, _>("tool_backend")?;
    let operation = row.try_get::<Option<String>, _>("tool_operation")?;
    let tool = match (backend, operation) {
        (Some(backend), Some(operation)) => {
            let backend = Backend::parse(&backend)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown backend `{backend}`")))?;
            Some(ToolCallRef { backend, operation })
        }
        _ => None,
    };

    Ok(Turn {
        role,
        content,
        tool,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}
