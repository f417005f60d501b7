//! Follow-up queue endpoints (§4.E, §6): at most one pending prompt per
//! chat, merged on repeat, drained atomically when the active stream
//! completes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use conduit_core::CoreError;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct UpsertQueueBody {
    pub content: String,
    pub model_id: String,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub thinking_mode: Option<String>,
    #[serde(default)]
    pub attachments: Option<Vec<Value>>,
}

#[derive(Serialize)]
pub struct UpsertQueueResponse {
    pub id: Uuid,
    pub created: bool,
    pub merged_content: String,
}

pub async fn upsert_queue(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<Uuid>,
    Json(body): Json<UpsertQueueBody>,
) -> ApiResult<Json<UpsertQueueResponse>> {
    if body.content.trim().is_empty() {
        return Err(CoreError::Validation("content must not be empty".to_string()).into());
    }
    let permission_mode = body.permission_mode.unwrap_or_else(|| "default".to_string());
    let result = state
        .queue
        .upsert(chat_id, &body.content, &body.model_id, &permission_mode, body.thinking_mode.as_deref(), body.attachments)
        .await?;

    Ok(Json(UpsertQueueResponse { id: result.id, created: result.created, merged_content: result.merged_content }))
}

pub async fn get_queue(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<Uuid>,
) -> ApiResult<Json<Option<conduit_bus::QueuedFollowup>>> {
    Ok(Json(state.queue.get(chat_id).await?))
}

#[derive(Deserialize)]
pub struct UpdateQueueBody {
    pub content: String,
}

pub async fn update_queue(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<Uuid>,
    Json(body): Json<UpdateQueueBody>,
) -> ApiResult<Json<Option<conduit_bus::QueuedFollowup>>> {
    Ok(Json(state.queue.update_content(chat_id, &body.content).await?))
}

pub async fn clear_queue(State(state): State<Arc<AppState>>, Path(chat_id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.queue.clear(chat_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
