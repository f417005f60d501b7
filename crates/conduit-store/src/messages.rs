use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::store::Store;
use crate::types::{ContentRender, Message, Role, StreamStatus};

impl Store {
    /// Insert a new message row. `stream_status` is typically `InProgress`
    /// for a freshly-started assistant message, or `Completed` for a user
    /// message (which never streams).
    #[instrument(skip(self))]
    pub fn create_message(
        &self,
        chat_id: Uuid,
        role: Role,
        content_text: &str,
        stream_status: StreamStatus,
        active_stream_id: Option<Uuid>,
    ) -> Result<Message> {
        let id = Uuid::now_v7();
        let now = Utc::now().to_rfc3339();
        let render = ContentRender::default();
        let render_json = serde_json::to_string(&render)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO messages
             (id, chat_id, role, content_text, content_render, last_seq,
              active_stream_id, stream_status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?8)",
            params![
                id.to_string(),
                chat_id.to_string(),
                role.as_str(),
                content_text,
                render_json,
                active_stream_id.map(|s| s.to_string()),
                stream_status.as_str(),
                now,
            ],
        )?;
        Ok(Message {
            id,
            chat_id,
            role,
            content_text: content_text.to_string(),
            content_render: render,
            last_seq: 0,
            active_stream_id,
            stream_status,
            total_cost_usd: None,
            checkpoint_id: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    #[instrument(skip(self))]
    pub fn get_message(&self, message_id: Uuid) -> Result<Message> {
        let db = self.db.lock().unwrap();
        get_message_locked(&db, message_id)
    }

    /// The message a live Stream Runtime currently holds for this chat, if
    /// any (§4.G.6: at most one by construction). Used by the out-of-band
    /// permission endpoints to attribute a `permission_request` log entry
    /// to the right message/stream without the caller having to know it.
    #[instrument(skip(self))]
    pub fn get_active_message(&self, chat_id: Uuid) -> Result<Option<Message>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, chat_id, role, content_text, content_render, last_seq,
                    active_stream_id, stream_status, total_cost_usd, checkpoint_id,
                    created_at, updated_at
             FROM messages WHERE chat_id = ?1 AND active_stream_id IS NOT NULL
             ORDER BY created_at DESC LIMIT 1",
            params![chat_id.to_string()],
            row_to_message,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Single-writer enforcement (§4.G.6): claim `message_id` for
    /// `stream_id`, failing with `StreamConflict` if another, still-live
    /// stream already holds it. A message with no active stream, or one
    /// already held by this same `stream_id`, succeeds idempotently.
    #[instrument(skip(self))]
    pub fn claim_stream(&self, message_id: Uuid, stream_id: Uuid) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let current = get_message_locked(&db, message_id)?;
        if let Some(existing) = current.active_stream_id {
            if existing != stream_id {
                return Err(StoreError::StreamConflict(message_id.to_string()));
            }
        }
        db.execute(
            "UPDATE messages SET active_stream_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![stream_id.to_string(), now, message_id.to_string()],
        )?;
        Ok(())
    }
}

pub(crate) fn get_message_locked(db: &rusqlite::Connection, message_id: Uuid) -> Result<Message> {
    db.query_row(
        "SELECT id, chat_id, role, content_text, content_render, last_seq,
                active_stream_id, stream_status, total_cost_usd, checkpoint_id,
                created_at, updated_at
         FROM messages WHERE id = ?1",
        params![message_id.to_string()],
        row_to_message,
    )
    .optional()?
    .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let chat_id_str: String = row.get(1)?;
    let role_str: String = row.get(2)?;
    let render_str: String = row.get(4)?;
    let active_stream_str: Option<String> = row.get(6)?;
    let status_str: String = row.get(7)?;

    Ok(Message {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        chat_id: Uuid::parse_str(&chat_id_str).unwrap_or_default(),
        role: Role::parse(&role_str).unwrap_or(Role::Assistant),
        content_text: row.get(3)?,
        content_render: serde_json::from_str(&render_str).unwrap_or_default(),
        last_seq: row.get(5)?,
        active_stream_id: active_stream_str.and_then(|s| Uuid::parse_str(&s).ok()),
        stream_status: StreamStatus::parse(&status_str).unwrap_or(StreamStatus::InProgress),
        total_cost_usd: row.get(8)?,
        checkpoint_id: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get_message_roundtrips() {
        let s = Store::open_in_memory().unwrap();
        let chat = s.create_chat("user-1").unwrap();
        let stream_id = Uuid::now_v7();
        let msg = s
            .create_message(chat.id, Role::Assistant, "", StreamStatus::InProgress, Some(stream_id))
            .unwrap();
        let fetched = s.get_message(msg.id).unwrap();
        assert_eq!(fetched.active_stream_id, Some(stream_id));
        assert_eq!(fetched.stream_status, StreamStatus::InProgress);
        assert!(fetched.content_render.events.is_empty());
    }

    #[test]
    fn claim_stream_rejects_a_second_writer() {
        let s = Store::open_in_memory().unwrap();
        let chat = s.create_chat("user-1").unwrap();
        let stream_a = Uuid::now_v7();
        let stream_b = Uuid::now_v7();
        let msg = s
            .create_message(chat.id, Role::Assistant, "", StreamStatus::InProgress, Some(stream_a))
            .unwrap();

        let err = s.claim_stream(msg.id, stream_b).unwrap_err();
        assert_eq!(err.code(), "conflict");

        // Re-claiming with the same stream id is idempotent.
        s.claim_stream(msg.id, stream_a).unwrap();
    }
}
