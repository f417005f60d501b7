//! POST /chat — start a new turn (§6): either continues an existing chat
//! or creates one (and, with it, a sandbox) on the caller's behalf.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Form;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conduit_core::collab::AgentSpawnRequest;
use conduit_core::CoreError;
use conduit_runtime::{StreamRequest, StreamRuntime};
use conduit_store::Role;
use conduit_store::StreamStatus;

use crate::error::ApiResult;
use crate::state::{extract_user_id, AppState};

#[derive(Deserialize)]
pub struct ChatForm {
    pub chat_id: Option<Uuid>,
    pub content: String,
    pub model_id: String,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub thinking_mode: Option<String>,
}

#[derive(Serialize)]
pub struct ChatStarted {
    pub chat_id: Uuid,
    pub message_id: Uuid,
    pub last_seq: i64,
}

pub async fn start_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<ChatForm>,
) -> ApiResult<Json<ChatStarted>> {
    let user_id = extract_user_id(&headers)?;

    if form.content.trim().is_empty() {
        return Err(CoreError::Validation("content must not be empty".to_string()).into());
    }

    let chat = match form.chat_id {
        Some(chat_id) => {
            let chat = state.store.get_chat(chat_id)?;
            if chat.user_id != user_id {
                return Err(CoreError::Forbidden("chat belongs to a different user".to_string()).into());
            }
            chat
        }
        None => {
            let chat = state.store.create_chat(&user_id)?;
            let sandbox_id = state.sandbox.create(&user_id).await?;
            state.store.set_sandbox(chat.id, &sandbox_id, None)?;
            state.store.get_chat(chat.id)?
        }
    };

    state.store.create_message(chat.id, Role::User, &form.content, StreamStatus::Completed, None)?;
    let assistant_msg = state.store.create_message(chat.id, Role::Assistant, "", StreamStatus::InProgress, None)?;

    let permission_mode = form.permission_mode.unwrap_or_else(|| "default".to_string());

    let spawn_req = AgentSpawnRequest {
        chat_id: chat.id.to_string(),
        sandbox_id: chat.sandbox_id.clone(),
        session_id: chat.session_id.clone(),
        prompt: form.content,
        model_id: form.model_id.clone(),
        permission_mode: permission_mode.clone(),
        thinking_mode: form.thinking_mode.clone(),
        attachments: None,
    };
    let agent = state.factory.spawn(spawn_req).await?;

    let stream_req = StreamRequest {
        chat_id: chat.id,
        message_id: assistant_msg.id,
        model_id: form.model_id,
        permission_mode,
        thinking_mode: form.thinking_mode,
        attachments: None,
    };
    StreamRuntime::spawn(state.runtime_handles(), stream_req, agent).await?;

    Ok(Json(ChatStarted { chat_id: chat.id, message_id: assistant_msg.id, last_seq: chat.last_event_seq }))
}
