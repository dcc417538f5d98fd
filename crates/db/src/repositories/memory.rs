use std::collections::HashMap;

use tokio::sync::RwLock;

use parley_core::domain::conversation::{ConversationId, Turn};

use super::{ConversationStore, RepositoryError};

#[derive(Default)]
struct Conversations {
    turns: HashMap<ConversationId, Vec<Turn>>,
    last_activity: HashMap<ConversationId, u64>,
    clock: u64,
}

/// Process-local store for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryConversationStore {
    inner: RwLock<Conversations>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn append(&self, id: &ConversationId, turn: Turn) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        inner.clock += 1;
        let tick = inner.clock;
        inner.turns.entry(id.clone()).or_default().push(turn);
        inner.last_activity.insert(id.clone(), tick);
        Ok(())
    }

    async fn history(&self, id: &ConversationId) -> Result<Vec<Turn>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner.turns.get(id).cloned().unwrap_or_default())
    }

    async fn conversations(&self) -> Result<Vec<ConversationId>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut ids: Vec<(&ConversationId, u64)> =
            inner.last_activity.iter().map(|(id, tick)| (id, *tick)).collect();
        ids.sort_by(|left, right| right.1.cmp(&left.1));
        Ok(ids.into_iter().map(|(id, _)| id.clone()).collect())
    }
}
