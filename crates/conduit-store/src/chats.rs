use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::store::Store;
use crate::types::Chat;

impl Store {
    #[instrument(skip(self))]
    pub fn create_chat(&self, user_id: &str) -> Result<Chat> {
        let id = Uuid::now_v7();
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO chats (id, user_id, last_event_seq, deleted, created_at, updated_at)
             VALUES (?1, ?2, 0, 0, ?3, ?3)",
            params![id.to_string(), user_id, now],
        )?;
        Ok(Chat {
            id,
            user_id: user_id.to_string(),
            sandbox_id: None,
            session_id: None,
            last_event_seq: 0,
            context_token_usage: None,
            deleted: false,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    #[instrument(skip(self))]
    pub fn get_chat(&self, chat_id: Uuid) -> Result<Chat> {
        let db = self.db.lock().unwrap();
        get_chat_locked(&db, chat_id)
    }

    #[instrument(skip(self))]
    pub fn set_sandbox(&self, chat_id: Uuid, sandbox_id: &str, session_id: Option<&str>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE chats SET sandbox_id = ?1, session_id = COALESCE(?2, session_id), updated_at = ?3 WHERE id = ?4",
            params![sandbox_id, session_id, now, chat_id.to_string()],
        )?;
        if n == 0 {
            return Err(StoreError::ChatNotFound(chat_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn set_session_id(&self, chat_id: Uuid, session_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE chats SET session_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![session_id, now, chat_id.to_string()],
        )?;
        if n == 0 {
            return Err(StoreError::ChatNotFound(chat_id.to_string()));
        }
        Ok(())
    }

    /// Update the cached `context_token_usage` snapshot (§4.G.5).
    #[instrument(skip(self, usage))]
    pub fn update_context_usage(&self, chat_id: Uuid, usage: serde_json::Value) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE chats SET context_token_usage = ?1, updated_at = ?2 WHERE id = ?3",
            params![usage.to_string(), now, chat_id.to_string()],
        )?;
        if n == 0 {
            return Err(StoreError::ChatNotFound(chat_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn soft_delete_chat(&self, chat_id: Uuid) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE chats SET deleted = 1, updated_at = ?1 WHERE id = ?2",
            params![now, chat_id.to_string()],
        )?;
        if n == 0 {
            return Err(StoreError::ChatNotFound(chat_id.to_string()));
        }
        Ok(())
    }
}

pub(crate) fn get_chat_locked(db: &rusqlite::Connection, chat_id: Uuid) -> Result<Chat> {
    db.query_row(
        "SELECT id, user_id, sandbox_id, session_id, last_event_seq, context_token_usage, deleted, created_at, updated_at
         FROM chats WHERE id = ?1",
        params![chat_id.to_string()],
        row_to_chat,
    )
    .optional()?
    .ok_or_else(|| StoreError::ChatNotFound(chat_id.to_string()))
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let id_str: String = row.get(0)?;
    let usage_str: Option<String> = row.get(5)?;
    Ok(Chat {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        user_id: row.get(1)?,
        sandbox_id: row.get(2)?,
        session_id: row.get(3)?,
        last_event_seq: row.get(4)?,
        context_token_usage: usage_str.and_then(|s| serde_json::from_str(&s).ok()),
        deleted: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get_roundtrips() {
        let s = Store::open_in_memory().unwrap();
        let chat = s.create_chat("user-1").unwrap();
        let fetched = s.get_chat(chat.id).unwrap();
        assert_eq!(fetched.user_id, "user-1");
        assert_eq!(fetched.last_event_seq, 0);
        assert!(!fetched.deleted);
    }

    #[test]
    fn get_missing_chat_errors() {
        let s = Store::open_in_memory().unwrap();
        let err = s.get_chat(Uuid::now_v7()).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn soft_delete_marks_flag() {
        let s = Store::open_in_memory().unwrap();
        let chat = s.create_chat("user-1").unwrap();
        s.soft_delete_chat(chat.id).unwrap();
        assert!(s.get_chat(chat.id).unwrap().deleted);
    }
}
