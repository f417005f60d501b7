//! DELETE /chats/{id}/stream — request cancel (§6): always 204, whether or
//! not a stream is actually running, per the cancel-liveness contract
//! (§4.F, §8 property 7) — the registry swallows a cancel with nobody
//! listening yet as a pending flag.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::{extract_user_id, AppState};

pub async fn request_cancel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let user_id = extract_user_id(&headers)?;
    let chat = state.store.get_chat(chat_id)?;
    if chat.user_id != user_id {
        return Err(conduit_core::CoreError::Forbidden("chat belongs to a different user".to_string()).into());
    }

    state.cancels.request_cancel(chat_id);
    state.bus.publish_cancel(chat_id).await;

    Ok(StatusCode::NO_CONTENT)
}
