//! Background-task bookkeeping (§5 supplement): the handle set a process
//! consults to answer "is this chat still streaming" for `GET
//! .../status`, and to wait out a graceful-shutdown grace period without
//! reaching into the Stream Runtime internals.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use uuid::Uuid;

struct Handle {
    stream_id: Uuid,
    started_at: Instant,
    join: JoinHandle<()>,
}

/// Keyed by chat id; only ever holds at most one entry per chat because a
/// new registration first evicts whatever the previous stream left behind.
#[derive(Default)]
pub struct BackgroundRegistry {
    tasks: DashMap<Uuid, Handle>,
}

impl BackgroundRegistry {
    pub fn new() -> Self {
        Self { tasks: DashMap::new() }
    }

    /// Record that `stream_id` is now the live stream for `chat_id`,
    /// dropping any stale bookkeeping left by a previous run (the previous
    /// entry's task has necessarily already finished by the time a new
    /// stream registers, since `claim_stream` enforces single-writer).
    pub fn register(&self, chat_id: Uuid, stream_id: Uuid, join: JoinHandle<()>) {
        self.tasks.insert(chat_id, Handle { stream_id, started_at: Instant::now(), join });
    }

    /// Clear the entry, but only if it still belongs to `stream_id` — an
    /// already-superseded registration must not clobber the new one.
    pub fn unregister(&self, chat_id: Uuid, stream_id: Uuid) {
        if let Some(entry) = self.tasks.get(&chat_id) {
            if entry.stream_id == stream_id {
                drop(entry);
                self.tasks.remove(&chat_id);
            }
        }
    }

    pub fn is_active(&self, chat_id: Uuid) -> bool {
        self.tasks.contains_key(&chat_id)
    }

    pub fn active_stream_id(&self, chat_id: Uuid) -> Option<Uuid> {
        self.tasks.get(&chat_id).map(|e| e.stream_id)
    }

    pub fn started_at(&self, chat_id: Uuid) -> Option<Instant> {
        self.tasks.get(&chat_id).map(|e| e.started_at)
    }

    /// Used at shutdown: every still-live join handle, to be awaited with a
    /// grace-period timeout by the caller.
    pub fn drain_handles(&self) -> Vec<JoinHandle<()>> {
        let keys: Vec<Uuid> = self.tasks.iter().map(|e| *e.key()).collect();
        keys.into_iter().filter_map(|k| self.tasks.remove(&k)).map(|(_, h)| h.join).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Awaits every outstanding background stream up to `grace` before
/// returning, logging (at the call site) any still-running afterward.
pub async fn wait_for_drain(registry: &Arc<BackgroundRegistry>, grace: Duration) {
    let handles = registry.drain_handles();
    let _ = tokio::time::timeout(grace, futures_util::future::join_all(handles)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_unregister_tracks_activity() {
        let reg = BackgroundRegistry::new();
        let chat_id = Uuid::now_v7();
        let stream_id = Uuid::now_v7();
        let join = tokio::spawn(async {});
        reg.register(chat_id, stream_id, join);
        assert!(reg.is_active(chat_id));
        assert_eq!(reg.active_stream_id(chat_id), Some(stream_id));

        reg.unregister(chat_id, stream_id);
        assert!(!reg.is_active(chat_id));
    }

    #[tokio::test]
    async fn unregister_ignores_stale_stream_id() {
        let reg = BackgroundRegistry::new();
        let chat_id = Uuid::now_v7();
        let old = Uuid::now_v7();
        let new = Uuid::now_v7();
        reg.register(chat_id, old, tokio::spawn(async {}));
        reg.register(chat_id, new, tokio::spawn(async {}));

        reg.unregister(chat_id, old);
        assert!(reg.is_active(chat_id));
        assert_eq!(reg.active_stream_id(chat_id), Some(new));
    }
}
