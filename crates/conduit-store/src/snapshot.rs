//! Snapshot Store (§4.B): per-assistant-message coalesced render state.

use chrono::Utc;
use rusqlite::params;
use tracing::instrument;
use uuid::Uuid;

use crate::error::Result;
use crate::messages::get_message_locked;
use crate::store::Store;
use crate::types::{Message, SnapshotUpdate};

impl Store {
    /// Apply a partial update to a message's snapshot. `last_seq` is always
    /// written as `max(current, new)` to tolerate out-of-order flushes
    /// (§4.B); every other field is left untouched unless `Some`.
    ///
    /// Enforces the terminal transition rule independent of what the caller
    /// passed for `active_stream_id`: once `stream_status` is set to a
    /// terminal value, `active_stream_id` is forced to `NULL`.
    #[instrument(skip(self, update))]
    pub fn update_snapshot(&self, message_id: Uuid, update: SnapshotUpdate) -> Result<Message> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let current = get_message_locked(&db, message_id)?;

        let new_last_seq = current.last_seq.max(update.last_seq);

        let content_text = update.content_text.unwrap_or(current.content_text);
        let content_render = update.content_render.unwrap_or(current.content_render);
        let content_render_json = serde_json::to_string(&content_render)?;

        let stream_status = update.stream_status.unwrap_or(current.stream_status);
        let active_stream_id = if stream_status.is_terminal() {
            None
        } else {
            update.active_stream_id.unwrap_or(current.active_stream_id)
        };
        let total_cost_usd = update.total_cost_usd.or(current.total_cost_usd);
        let checkpoint_id = update.checkpoint_id.or(current.checkpoint_id);

        db.execute(
            "UPDATE messages SET
                content_text = ?1,
                content_render = ?2,
                last_seq = ?3,
                active_stream_id = ?4,
                stream_status = ?5,
                total_cost_usd = ?6,
                checkpoint_id = ?7,
                updated_at = ?8
             WHERE id = ?9",
            params![
                content_text,
                content_render_json,
                new_last_seq,
                active_stream_id.map(|s| s.to_string()),
                stream_status.as_str(),
                total_cost_usd,
                checkpoint_id,
                now,
                message_id.to_string(),
            ],
        )?;

        Ok(Message {
            content_text,
            content_render,
            last_seq: new_last_seq,
            active_stream_id,
            stream_status,
            total_cost_usd,
            checkpoint_id,
            updated_at: now,
            ..current
        })
    }

    #[instrument(skip(self))]
    pub fn get_snapshot(&self, message_id: Uuid) -> Result<Message> {
        self.get_message(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentRender, Role, StreamStatus};

    #[test]
    fn last_seq_only_advances() {
        let s = Store::open_in_memory().unwrap();
        let chat = s.create_chat("u").unwrap();
        let msg = s
            .create_message(chat.id, Role::Assistant, "", StreamStatus::InProgress, None)
            .unwrap();

        s.update_snapshot(msg.id, SnapshotUpdate { last_seq: 5, ..Default::default() }).unwrap();
        let m = s
            .update_snapshot(msg.id, SnapshotUpdate { last_seq: 2, ..Default::default() })
            .unwrap();
        assert_eq!(m.last_seq, 5);
    }

    #[test]
    fn terminal_status_clears_active_stream_id() {
        let s = Store::open_in_memory().unwrap();
        let chat = s.create_chat("u").unwrap();
        let stream_id = Uuid::now_v7();
        let msg = s
            .create_message(chat.id, Role::Assistant, "", StreamStatus::InProgress, Some(stream_id))
            .unwrap();

        let m = s
            .update_snapshot(
                msg.id,
                SnapshotUpdate {
                    stream_status: Some(StreamStatus::Completed),
                    active_stream_id: Some(Some(stream_id)),
                    last_seq: 3,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(m.stream_status, StreamStatus::Completed);
        assert_eq!(m.active_stream_id, None);
    }

    #[test]
    fn content_fields_only_update_when_some() {
        let s = Store::open_in_memory().unwrap();
        let chat = s.create_chat("u").unwrap();
        let msg = s
            .create_message(chat.id, Role::Assistant, "", StreamStatus::InProgress, None)
            .unwrap();
        s.update_snapshot(
            msg.id,
            SnapshotUpdate {
                content_text: Some("Hi".into()),
                content_render: Some(ContentRender { events: vec![serde_json::json!({"type":"assistant_text"})], segments: vec![] }),
                last_seq: 1,
                ..Default::default()
            },
        )
        .unwrap();
        let m = s.update_snapshot(msg.id, SnapshotUpdate { last_seq: 1, ..Default::default() }).unwrap();
        assert_eq!(m.content_text, "Hi");
        assert_eq!(m.content_render.events.len(), 1);
    }
}
