//! Out-of-band permission dialog (§4.D, §6): the tool collaborator asks a
//! question here, blocks on the long-poll response endpoint, and the user
//! answers through the respond endpoint (or the TTL lapses and the
//! collaborator gets a synthetic denial instead of a hang).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use conduit_core::CoreError;
use conduit_runtime::PermissionResponse;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct PermissionRequestBody {
    pub tool_name: String,
    pub tool_input: Value,
}

#[derive(Serialize)]
pub struct PermissionRequestCreated {
    pub request_id: String,
}

/// POST /chats/{id}/permissions/request — called by the tool collaborator,
/// bearer-scoped to the chat (authentication itself is out of scope, §1).
/// Registers the in-process waiter and writes the matching
/// `permission_request` event through the Event Log so late watchers can
/// still render the prompt (§3 Permission request).
pub async fn create_request(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<Uuid>,
    Json(body): Json<PermissionRequestBody>,
) -> ApiResult<Json<PermissionRequestCreated>> {
    let request_id = Uuid::now_v7().to_string();
    state.permissions.create(&request_id, &chat_id.to_string(), &body.tool_name, body.tool_input.clone());

    if let Ok(Some(active)) = state.store.get_active_message(chat_id) {
        let payload = serde_json::json!({
            "request_id": request_id,
            "tool_name": body.tool_name,
            "tool_input": body.tool_input,
        });
        let stream_id = active.active_stream_id.unwrap_or_else(Uuid::now_v7);
        if let Err(e) = state.store.append_with_next_seq(chat_id, active.id, stream_id, "permission_request", payload, None) {
            tracing::warn!(%chat_id, error = %e, "failed to log permission_request event");
        } else {
            state.bus.notify_stream_live(chat_id).await;
        }
    }

    Ok(Json(PermissionRequestCreated { request_id }))
}

#[derive(Deserialize)]
pub struct WaitQuery {
    pub timeout: Option<u64>,
}

const MAX_WAIT_SECS: u64 = 600;

/// GET /chats/{id}/permissions/response/{rid} — long-poll for the decision
/// (§6): bounded by both the caller's `timeout` and the request's own TTL
/// (§4.D, §8 property 8), whichever is shorter.
pub async fn wait_for_response(
    State(state): State<Arc<AppState>>,
    Path((_chat_id, request_id)): Path<(Uuid, String)>,
    Query(query): Query<WaitQuery>,
) -> ApiResult<Json<PermissionResponse>> {
    let timeout = Duration::from_secs(query.timeout.unwrap_or(MAX_WAIT_SECS).min(MAX_WAIT_SECS));
    match state.permissions.wait(&request_id, timeout).await {
        Some(response) => Ok(Json(response)),
        None => Ok(Json(PermissionResponse::expired())),
    }
}

#[derive(Deserialize)]
pub struct RespondBody {
    pub approved: bool,
    #[serde(default)]
    pub alternative_instruction: Option<String>,
    #[serde(default)]
    pub user_answers: Option<Value>,
}

/// POST /chats/{id}/permissions/{rid}/respond — the user's decision.
/// Idempotent; 404 if the request already expired or was already answered.
/// On the registry miss, still publishes the decision on the pub/sub
/// fallback channel (§4.D) so a waiter attached only via pub/sub unblocks.
pub async fn respond(
    State(state): State<Arc<AppState>>,
    Path((_chat_id, request_id)): Path<(Uuid, String)>,
    Json(body): Json<RespondBody>,
) -> ApiResult<StatusCode> {
    let response = PermissionResponse {
        approved: body.approved,
        alternative_instruction: body.alternative_instruction,
        user_answers: body.user_answers,
    };

    let ok = state.permissions.respond(&request_id, response.clone());
    if ok {
        return Ok(StatusCode::NO_CONTENT);
    }

    let decision = serde_json::json!({
        "approved": response.approved,
        "alternative_instruction": response.alternative_instruction.unwrap_or_else(|| "Permission request expired. Please try again.".to_string()),
        "user_answers": response.user_answers,
    });
    state.bus.publish_permission_response(&request_id, &decision).await;
    Err(CoreError::NotFound(format!("permission request {request_id} expired or already answered")).into())
}

#[derive(Serialize)]
pub struct PermissionInfoResponse {
    pub chat_id: String,
    pub tool_name: String,
    pub tool_input: Value,
}

/// GET /chats/{id}/permissions/{rid} — inspect a still-pending request
/// (used by the UI to render the prompt if it missed the SSE envelope).
pub async fn get_request(
    State(state): State<Arc<AppState>>,
    Path((_chat_id, request_id)): Path<(Uuid, String)>,
) -> ApiResult<Json<PermissionInfoResponse>> {
    match state.permissions.get(&request_id) {
        Some(info) => Ok(Json(PermissionInfoResponse { chat_id: info.chat_id, tool_name: info.tool_name, tool_input: info.tool_input })),
        None => Err(CoreError::NotFound(format!("permission request {request_id} not found")).into()),
    }
}
