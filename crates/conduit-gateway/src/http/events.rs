//! GET /messages/{id}/events — read a range of a message's own event log
//! (§6), for a client that wants to re-fetch one message's history without
//! a full chat-wide SSE subscription.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

const HARD_CAP: i64 = 5000;

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub after_seq: i64,
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct EventFrame {
    pub seq: i64,
    pub kind: String,
    pub payload: Value,
    #[serde(rename = "chatId")]
    pub chat_id: Uuid,
    #[serde(rename = "messageId")]
    pub message_id: Uuid,
    #[serde(rename = "streamId")]
    pub stream_id: Uuid,
    pub ts: String,
}

pub async fn list_message_events(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<EventFrame>>> {
    let limit = query.limit.unwrap_or(HARD_CAP).clamp(1, HARD_CAP);
    let rows = state.store.range_by_message(message_id, query.after_seq, limit)?;

    let frames = rows
        .into_iter()
        .map(|e| EventFrame {
            seq: e.seq,
            kind: e.event_type,
            payload: e.render_payload,
            chat_id: e.chat_id,
            message_id: e.message_id,
            stream_id: e.stream_id,
            ts: e.created_at,
        })
        .collect();

    Ok(Json(frames))
}
