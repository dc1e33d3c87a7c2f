//! Conversation history endpoints over the configured [`ConversationStore`].

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;
use veil_core::{
    render_turns, save_ui_messages, ConversationStore, StoreError, UiMessage,
};

use crate::AppState;

#[derive(Deserialize)]
pub(crate) struct ListQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
pub(crate) struct SaveBody {
    messages: Vec<UiMessage>,
}

/// Runs a store call on the blocking pool.
async fn blocking<T, F>(store: &Arc<dyn ConversationStore>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn ConversationStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

fn store_failure(e: StoreError) -> Response {
    tracing::error!(target: "veil::history", error = %e, "Conversation store failure");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("Conversation store error: {}", e)).into_response()
}

fn parse_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw)
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid conversation id").into_response())
}

/// GET /api/conversations?limit=N, most recent first.
pub(crate) async fn list_conversations(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(state.config.history_limit);
    match blocking(&state.store, move |s| s.list_recent(Some(limit))).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => store_failure(e),
    }
}

/// GET /api/conversations/:id
pub(crate) async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    match blocking(&state.store, move |s| s.get(id)).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => store_failure(e),
    }
}

/// GET /api/conversations/:id/view with answers tokenized and fully masked.
pub(crate) async fn view_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    match blocking(&state.store, move |s| s.get(id)).await {
        Ok(Some(record)) => Json(serde_json::json!({
            "id": record.id,
            "date": record.date,
            "turns": render_turns(record.turns(), &state.config.mask),
        }))
        .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => store_failure(e),
    }
}

/// PUT /api/conversations/:id replaces the whole record from live UI messages.
pub(crate) async fn save_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SaveBody>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    let messages = body.messages;
    match blocking(&state.store, move |s| save_ui_messages(s, id, &messages)).await {
        Ok(Some(record)) => {
            tracing::info!(
                target: "veil::history",
                conversation_id = %id,
                turns = record.turns().len(),
                "Conversation saved"
            );
            Json(record).into_response()
        }
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => store_failure(e),
    }
}

/// DELETE /api/conversations/:id
pub(crate) async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    match blocking(&state.store, move |s| s.delete(id)).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => store_failure(e),
    }
}
