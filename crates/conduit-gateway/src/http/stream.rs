//! SSE Resumer (§4.H): per-connection catch-up + tail loop. A client
//! supplies `after_seq` and/or the browser-standard `Last-Event-ID` header
//! (the larger of the two wins) and receives exactly the events with
//! `seq > after_seq`, in order, with no duplicates (§8 property 5) —
//! whether they are watching a brand-new stream or resuming one that has
//! been running for a while.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::StreamExt;
use serde::Deserialize;
use uuid::Uuid;

use conduit_core::CoreError;
use conduit_store::StreamStatus;

use crate::error::ApiResult;
use crate::state::{extract_user_id, AppState};

const PAGE_SIZE: i64 = 500;
const POLL_IDLE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Deserialize)]
pub struct StreamQuery {
    after_seq: Option<i64>,
}

fn last_event_id(headers: &HeaderMap) -> Option<i64> {
    headers.get("last-event-id")?.to_str().ok()?.parse().ok()
}

pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>> {
    let user_id = extract_user_id(&headers)?;
    let chat = state.store.get_chat(chat_id)?;
    if chat.user_id != user_id {
        return Err(CoreError::Forbidden("chat belongs to a different user".to_string()).into());
    }

    let from_query = query.after_seq.unwrap_or(0);
    let from_header = last_event_id(&headers).unwrap_or(0);
    let after_seq = from_query.max(from_header);

    let live = state.bus.subscribe_stream_live(chat_id).await?;
    let store = state.store.clone();
    let heartbeat = Duration::from_millis(state.config.streaming.sse_heartbeat_ms);

    let stream = async_stream::stream! {
        let mut after_seq = after_seq;
        let mut live = live;
        let mut last_message_id: Option<Uuid> = None;

        loop {
            let rows = match store.range_by_chat(chat_id, after_seq, PAGE_SIZE) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::error!(%chat_id, error = %e, "sse range_by_chat failed");
                    break;
                }
            };

            let got_full_page = rows.len() as i64 == PAGE_SIZE;

            for row in &rows {
                after_seq = row.seq;
                last_message_id = Some(row.message_id);
                let envelope = conduit_core::Envelope::new(row.chat_id, row.message_id, row.stream_id, row.seq, &row.event_type, row.render_payload.clone());
                if let Ok(json) = serde_json::to_string(&envelope) {
                    yield Ok(Event::default().id(row.seq.to_string()).data(json));
                }
            }

            if got_full_page {
                continue; // more rows immediately available, keep draining before waiting
            }

            if let Some(message_id) = last_message_id {
                match store.get_message(message_id) {
                    Ok(message) if message.stream_status != StreamStatus::InProgress && message.last_seq <= after_seq => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }

            tokio::select! {
                _ = live.next() => {}
                _ = tokio::time::sleep(POLL_IDLE_TIMEOUT) => {}
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat)))
}
