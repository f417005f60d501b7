//! `conduit-store` — durable SQLite-backed storage for chats, messages
//! and the per-chat append-only event log (§4.A, §4.B spec components).

pub mod chats;
pub mod error;
pub mod event_log;
pub mod messages;
pub mod scheduler;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use store::Store;
pub use types::{
    Chat, ContentRender, ExecutionStatus, Message, MessageEvent, PendingEvent, Recurrence, Role, ScheduledTask,
    SnapshotUpdate, StreamStatus, TaskExecution, TaskSpec, TaskStatus,
};
