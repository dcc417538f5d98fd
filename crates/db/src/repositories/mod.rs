use async_trait::async_trait;
use thiserror::Error;

use parley_core::domain::conversation::{ConversationId, Turn};

pub mod conversation;
pub mod memory;

pub use conversation::SqlConversationStore;
pub use memory::InMemoryConversationStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable, append-only turn history keyed by conversation id.
///
/// Turns are returned in the order they were appended. Unknown ids yield an
/// empty history rather than an error.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append(&self, id: &ConversationId, turn: Turn) -> Result<(), RepositoryError>;

    async fn history(&self, id: &ConversationId) -> Result<Vec<Turn>, RepositoryError>;

    /// Known conversation ids, most recently active first.
    async fn conversations(&self) -> Result<Vec<ConversationId>, RepositoryError>;
}
