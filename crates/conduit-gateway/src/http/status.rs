//! GET /chats/{id}/status — active-stream probe (§6): lets a client that
//! just (re)connected ask "is anything running right now" before deciding
//! whether to open an SSE subscription at all.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::{extract_user_id, AppState};

#[derive(Serialize)]
pub struct StreamStatusResponse {
    pub has_active_task: bool,
    pub stream_id: Option<Uuid>,
    pub last_seq: i64,
}

pub async fn stream_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<Uuid>,
) -> ApiResult<Json<StreamStatusResponse>> {
    let user_id = extract_user_id(&headers)?;
    let chat = state.store.get_chat(chat_id)?;
    if chat.user_id != user_id {
        return Err(conduit_core::CoreError::Forbidden("chat belongs to a different user".to_string()).into());
    }

    let has_active_task = state.background.is_active(chat_id);
    let stream_id = state.background.active_stream_id(chat_id);

    Ok(Json(StreamStatusResponse { has_active_task, stream_id, last_seq: chat.last_event_seq }))
}
