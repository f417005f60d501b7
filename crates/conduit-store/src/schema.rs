use rusqlite::Connection;

use crate::error::Result;

/// Initialise the chat/message/event tables and their indexes.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS chats (
            id                  TEXT PRIMARY KEY,
            user_id             TEXT NOT NULL,
            sandbox_id          TEXT,
            session_id          TEXT,
            last_event_seq      INTEGER NOT NULL DEFAULT 0,
            context_token_usage TEXT,
            deleted             INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chats_user ON chats(user_id, updated_at DESC);

        CREATE TABLE IF NOT EXISTS messages (
            id               TEXT PRIMARY KEY,
            chat_id          TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            role             TEXT NOT NULL,
            content_text     TEXT NOT NULL DEFAULT '',
            content_render   TEXT NOT NULL DEFAULT '{\"events\":[],\"segments\":[]}',
            last_seq         INTEGER NOT NULL DEFAULT 0,
            active_stream_id TEXT,
            stream_status    TEXT NOT NULL DEFAULT 'in_progress',
            total_cost_usd   REAL,
            checkpoint_id    TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_messages_active_stream ON messages(active_stream_id)
            WHERE active_stream_id IS NOT NULL;

        CREATE TABLE IF NOT EXISTS message_events (
            id             TEXT PRIMARY KEY,
            chat_id        TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            message_id     TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            stream_id      TEXT NOT NULL,
            seq            INTEGER NOT NULL,
            event_type     TEXT NOT NULL,
            render_payload TEXT NOT NULL,
            audit_payload  TEXT,
            created_at     TEXT NOT NULL,
            UNIQUE(chat_id, seq)
        );
        CREATE INDEX IF NOT EXISTS idx_events_chat_seq ON message_events(chat_id, seq);
        CREATE INDEX IF NOT EXISTS idx_events_message_seq ON message_events(message_id, seq);

        CREATE TABLE IF NOT EXISTS scheduled_tasks (
            id              TEXT PRIMARY KEY,
            user_id         TEXT NOT NULL,
            task_name       TEXT NOT NULL,
            prompt_message  TEXT NOT NULL,
            recurrence      TEXT NOT NULL,
            scheduled_time  TEXT NOT NULL,
            scheduled_day   INTEGER,
            timezone        TEXT NOT NULL,
            model_id        TEXT NOT NULL,
            next_fire_time  TEXT,
            status          TEXT NOT NULL DEFAULT 'active',
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_due ON scheduled_tasks(status, next_fire_time);
        CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_user ON scheduled_tasks(user_id);

        CREATE TABLE IF NOT EXISTS task_executions (
            id             TEXT PRIMARY KEY,
            task_id        TEXT NOT NULL REFERENCES scheduled_tasks(id) ON DELETE CASCADE,
            status         TEXT NOT NULL,
            executed_at    TEXT NOT NULL,
            completed_at   TEXT,
            chat_id        TEXT,
            error_message  TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_task_executions_task ON task_executions(task_id, executed_at DESC);
        CREATE INDEX IF NOT EXISTS idx_task_executions_status ON task_executions(status, executed_at);",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_db_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }
}
