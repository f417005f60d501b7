//! Event Log Store (§4.A): append events with gap-free per-chat sequence
//! numbers, read ranges by sequence.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use crate::chats::get_chat_locked;
use crate::error::{Result, StoreError};
use crate::store::Store;
use crate::types::{MessageEvent, PendingEvent};

impl Store {
    /// Atomically bump `Chat.last_event_seq` and insert one `MessageEvent`
    /// carrying the new seq, in a single transaction. The DB's serialized
    /// writer is what replaces a distributed lock (§4.A rationale).
    #[instrument(skip(self, render_payload, audit_payload))]
    pub fn append_with_next_seq(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        stream_id: Uuid,
        event_type: &str,
        render_payload: Value,
        audit_payload: Option<Value>,
    ) -> Result<i64> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        get_chat_locked(&tx, chat_id)?; // ChatNotFound if absent

        tx.execute(
            "UPDATE chats SET last_event_seq = last_event_seq + 1 WHERE id = ?1",
            params![chat_id.to_string()],
        )?;
        let seq: i64 = tx.query_row(
            "SELECT last_event_seq FROM chats WHERE id = ?1",
            params![chat_id.to_string()],
            |r| r.get(0),
        )?;

        insert_event_row(
            &tx,
            chat_id,
            message_id,
            stream_id,
            seq,
            event_type,
            &render_payload,
            audit_payload.as_ref(),
        )?;
        tx.commit()?;
        Ok(seq)
    }

    /// Allocate N consecutive seqs in one round-trip, equivalent to N calls
    /// to `append_with_next_seq` (§4.A).
    #[instrument(skip(self, events))]
    pub fn append_batch(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        stream_id: Uuid,
        events: &[PendingEvent],
    ) -> Result<i64> {
        if events.is_empty() {
            return Ok(self.get_chat(chat_id)?.last_event_seq);
        }

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        get_chat_locked(&tx, chat_id)?;

        tx.execute(
            "UPDATE chats SET last_event_seq = last_event_seq + ?1 WHERE id = ?2",
            params![events.len() as i64, chat_id.to_string()],
        )?;
        let last_seq: i64 = tx.query_row(
            "SELECT last_event_seq FROM chats WHERE id = ?1",
            params![chat_id.to_string()],
            |r| r.get(0),
        )?;
        let first_seq = last_seq - events.len() as i64 + 1;

        for (i, ev) in events.iter().enumerate() {
            insert_event_row(
                &tx,
                chat_id,
                message_id,
                stream_id,
                first_seq + i as i64,
                &ev.event_type,
                &ev.render_payload,
                ev.audit_payload.as_ref(),
            )?;
        }
        tx.commit()?;
        Ok(last_seq)
    }

    #[instrument(skip(self))]
    pub fn range_by_chat(&self, chat_id: Uuid, after_seq: i64, limit: i64) -> Result<Vec<MessageEvent>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, chat_id, message_id, stream_id, seq, event_type, render_payload, audit_payload, created_at
             FROM message_events WHERE chat_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![chat_id.to_string(), after_seq, limit], row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    pub fn range_by_message(&self, message_id: Uuid, after_seq: i64, limit: i64) -> Result<Vec<MessageEvent>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, chat_id, message_id, stream_id, seq, event_type, render_payload, audit_payload, created_at
             FROM message_events WHERE message_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![message_id.to_string(), after_seq, limit], row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Highest seq currently stored for a chat, or `None` if the chat has
    /// no events yet. Used by the SSE resumer's exit condition (§4.H).
    #[instrument(skip(self))]
    pub fn max_seq_for_chat(&self, chat_id: Uuid) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let seq: Option<i64> = db
            .query_row(
                "SELECT MAX(seq) FROM message_events WHERE chat_id = ?1",
                params![chat_id.to_string()],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        Ok(seq.unwrap_or(0))
    }
}

#[allow(clippy::too_many_arguments)]
fn insert_event_row(
    tx: &rusqlite::Transaction<'_>,
    chat_id: Uuid,
    message_id: Uuid,
    stream_id: Uuid,
    seq: i64,
    event_type: &str,
    render_payload: &Value,
    audit_payload: Option<&Value>,
) -> Result<()> {
    let id = Uuid::now_v7();
    let now = Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO message_events
         (id, chat_id, message_id, stream_id, seq, event_type, render_payload, audit_payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id.to_string(),
            chat_id.to_string(),
            message_id.to_string(),
            stream_id.to_string(),
            seq,
            event_type,
            render_payload.to_string(),
            audit_payload.map(|v| v.to_string()),
            now,
        ],
    )
    .map_err(StoreError::from)?;
    Ok(())
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageEvent> {
    let id_str: String = row.get(0)?;
    let chat_id_str: String = row.get(1)?;
    let message_id_str: String = row.get(2)?;
    let stream_id_str: String = row.get(3)?;
    let render_str: String = row.get(6)?;
    let audit_str: Option<String> = row.get(7)?;

    Ok(MessageEvent {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        chat_id: Uuid::parse_str(&chat_id_str).unwrap_or_default(),
        message_id: Uuid::parse_str(&message_id_str).unwrap_or_default(),
        stream_id: Uuid::parse_str(&stream_id_str).unwrap_or_default(),
        seq: row.get(4)?,
        event_type: row.get(5)?,
        render_payload: serde_json::from_str(&render_str).unwrap_or(Value::Null),
        audit_payload: audit_str.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use crate::types::StreamStatus;

    #[test]
    fn append_with_next_seq_is_gap_free() {
        let s = Store::open_in_memory().unwrap();
        let chat = s.create_chat("u").unwrap();
        let msg = s
            .create_message(chat.id, Role::Assistant, "", StreamStatus::InProgress, None)
            .unwrap();
        let stream_id = Uuid::now_v7();

        let seq1 = s
            .append_with_next_seq(chat.id, msg.id, stream_id, "stream_started", Value::Null, None)
            .unwrap();
        let seq2 = s
            .append_with_next_seq(chat.id, msg.id, stream_id, "complete", Value::Null, None)
            .unwrap();
        assert_eq!(seq1, 1);
        assert_eq!(seq2, 2);
        assert_eq!(s.get_chat(chat.id).unwrap().last_event_seq, 2);
    }

    #[test]
    fn append_batch_allocates_consecutive_seqs() {
        let s = Store::open_in_memory().unwrap();
        let chat = s.create_chat("u").unwrap();
        let msg = s
            .create_message(chat.id, Role::Assistant, "", StreamStatus::InProgress, None)
            .unwrap();
        let stream_id = Uuid::now_v7();
        let events = vec![
            PendingEvent { event_type: "assistant_text".into(), render_payload: Value::Null, audit_payload: None },
            PendingEvent { event_type: "tool_started".into(), render_payload: Value::Null, audit_payload: None },
            PendingEvent { event_type: "tool_completed".into(), render_payload: Value::Null, audit_payload: None },
        ];
        let last_seq = s.append_batch(chat.id, msg.id, stream_id, &events).unwrap();
        assert_eq!(last_seq, 3);
        let rows = s.range_by_chat(chat.id, 0, 100).unwrap();
        let seqs: Vec<i64> = rows.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn range_by_chat_respects_after_seq() {
        let s = Store::open_in_memory().unwrap();
        let chat = s.create_chat("u").unwrap();
        let msg = s
            .create_message(chat.id, Role::Assistant, "", StreamStatus::InProgress, None)
            .unwrap();
        let stream_id = Uuid::now_v7();
        for _ in 0..5 {
            s.append_with_next_seq(chat.id, msg.id, stream_id, "assistant_text", Value::Null, None)
                .unwrap();
        }
        let rows = s.range_by_chat(chat.id, 3, 100).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].seq, 4);
        assert_eq!(rows[1].seq, 5);
    }

    #[test]
    fn append_fails_for_missing_chat() {
        let s = Store::open_in_memory().unwrap();
        let err = s
            .append_with_next_seq(Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7(), "system", Value::Null, None)
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
