//! JSON chat API used by the browser client.
//!
//! Response bodies keep the `success` envelope the web UI expects: every
//! payload carries `success`, and failures add `error` (or `message` for the
//! unsupported clear endpoint).

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use parley_agent::{AgentRuntime, TurnRequest};
use parley_core::{ApplicationError, ConversationId, InterfaceError, ToolCallRef};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ChatState {
    pub runtime: Arc<AgentRuntime>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub success: bool,
    pub response: String,
    pub thread_id: String,
    pub used_tool: Option<ToolCallRef>,
    pub truncated: bool,
}

#[derive(Debug, Serialize)]
pub struct ThreadSummary {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct ThreadsResponse {
    pub success: bool,
    pub threads: Vec<ThreadSummary>,
}

#[derive(Debug, Serialize)]
pub struct NewThreadResponse {
    pub success: bool,
    pub thread_id: String,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub success: bool,
    pub history: Vec<HistoryEntry>,
    pub thread_id: String,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub success: bool,
    pub message: &'static str,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub fn router(state: ChatState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/threads", get(list_threads))
        .route("/api/new-thread", post(new_thread))
        .route("/api/history/{thread_id}", get(history))
        .route("/api/clear/{thread_id}", delete(clear_thread))
        .with_state(state)
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError { success: false, error: message.into(), correlation_id: None }),
    )
}

fn interface_failure(error: InterfaceError) -> (StatusCode, Json<ApiError>) {
    let status = match &error {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ApiError {
            success: false,
            error: error.user_message().to_string(),
            correlation_id: Some(error.correlation_id().to_string()),
        }),
    )
}

fn persistence_failure(message: String, correlation_id: String) -> (StatusCode, Json<ApiError>) {
    interface_failure(ApplicationError::Persistence(message).into_interface(correlation_id))
}

pub async fn chat(
    State(state): State<ChatState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<ChatResponse> {
    let Json(request) = payload.map_err(|rejection| bad_request(rejection.body_text()))?;

    let message = request.message.trim().to_string();
    if message.is_empty() {
        return Err(bad_request("No message provided"));
    }
    let conversation_id = request
        .thread_id
        .as_deref()
        .and_then(ConversationId::parse)
        .unwrap_or_else(ConversationId::generate);
    let correlation_id = Uuid::new_v4().to_string();

    info!(
        event_name = "http.chat.received",
        correlation_id = %correlation_id,
        conversation_id = %conversation_id,
        message_chars = message.chars().count(),
        "chat message received"
    );

    // The turn runs on its own task so a client disconnect cancels it
    // through the token instead of dropping it mid-persistence.
    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();
    let runtime = Arc::clone(&state.runtime);
    let turn = TurnRequest { conversation_id: conversation_id.clone(), message };
    let joined =
        tokio::spawn(async move { runtime.handle_turn_with_cancel(turn, cancel).await }).await;

    let outcome = match joined {
        Ok(outcome) => outcome,
        Err(join_error) => {
            error!(
                event_name = "http.chat.task_failed",
                correlation_id = %correlation_id,
                conversation_id = %conversation_id,
                error = %join_error,
                "turn task did not complete"
            );
            return Err(interface_failure(InterfaceError::Internal {
                message: join_error.to_string(),
                correlation_id,
            }));
        }
    };

    match outcome {
        Ok(response) => Ok(Json(ChatResponse {
            success: true,
            response: response.reply,
            thread_id: conversation_id.to_string(),
            used_tool: response.used_tool,
            truncated: response.truncated,
        })),
        Err(turn_error) => {
            warn!(
                event_name = "http.chat.failed",
                correlation_id = %correlation_id,
                conversation_id = %conversation_id,
                error = %turn_error,
                "chat turn failed"
            );
            let failure = ApplicationError::from(turn_error);
            Err(interface_failure(failure.into_interface(correlation_id)))
        }
    }
}

pub async fn list_threads(State(state): State<ChatState>) -> ApiResult<ThreadsResponse> {
    let conversations = state.runtime.store().conversations().await.map_err(|error| {
        let correlation_id = Uuid::new_v4().to_string();
        warn!(
            event_name = "http.threads.failed",
            correlation_id = %correlation_id,
            error = %error,
            "could not list conversations"
        );
        persistence_failure(error.to_string(), correlation_id)
    })?;

    Ok(Json(ThreadsResponse {
        success: true,
        threads: conversations.into_iter().map(|id| ThreadSummary { id: id.0 }).collect(),
    }))
}

pub async fn new_thread() -> Json<NewThreadResponse> {
    Json(NewThreadResponse { success: true, thread_id: ConversationId::generate().0 })
}

/// Only user and assistant turns are shown; tool records stay internal.
pub async fn history(
    State(state): State<ChatState>,
    Path(thread_id): Path<String>,
) -> ApiResult<HistoryResponse> {
    let Some(conversation_id) = ConversationId::parse(&thread_id) else {
        return Err(bad_request("thread id must not be empty"));
    };

    let turns = state.runtime.store().history(&conversation_id).await.map_err(|error| {
        let correlation_id = Uuid::new_v4().to_string();
        warn!(
            event_name = "http.history.failed",
            correlation_id = %correlation_id,
            conversation_id = %conversation_id,
            error = %error,
            "could not load conversation history"
        );
        persistence_failure(error.to_string(), correlation_id)
    })?;

    let history = turns
        .iter()
        .filter(|turn| turn.is_dialogue())
        .map(|turn| HistoryEntry {
            role: turn.role.as_str(),
            content: turn.content.as_text().into_owned(),
        })
        .collect();

    Ok(Json(HistoryResponse { success: true, history, thread_id: conversation_id.0 }))
}

pub async fn clear_thread(Path(_thread_id): Path<String>) -> (StatusCode, Json<ClearResponse>) {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(ClearResponse {
            success: false,
            message: "Thread clearing not supported. Create a new thread instead.",
        }),
    )
}
