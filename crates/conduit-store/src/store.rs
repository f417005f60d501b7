use std::sync::Mutex;

use rusqlite::Connection;

/// Single SQLite connection shared by the Event Log, Snapshot and Chat
/// stores, so that `append_with_next_seq`'s counter-bump-plus-insert and
/// `update_snapshot`'s read-modify-write can each run inside one
/// transaction (§4.A, §4.B). Methods are split across `chats.rs`,
/// `messages.rs`, `event_log.rs` and `snapshot.rs` as separate `impl`
/// blocks on this one type, mirroring the one-connection-per-manager
/// convention elsewhere in the workspace.
pub struct Store {
    pub(crate) db: Mutex<Connection>,
}

impl Store {
    pub fn new(conn: Connection) -> Self {
        Self { db: Mutex::new(conn) }
    }

    pub fn open(path: &str) -> crate::error::Result<Self> {
        let conn = Connection::open(path)?;
        crate::schema::init_db(&conn)?;
        Ok(Self::new(conn))
    }

    pub fn open_in_memory() -> crate::error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_db(&conn)?;
        Ok(Self::new(conn))
    }
}
