//! In-process `KvStore` fake backing unit tests (§1.1 ambient stack: tests
//! isolate from a real Redis the same way the store crate uses an
//! in-memory SQLite connection).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::error::Result;
use crate::kv::{CasOutcome, KvStore};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// An in-memory `KvStore` with real TTL expiry and per-channel broadcast
/// fan-out, used by tests across the workspace in place of a live Redis.
#[derive(Default)]
pub struct MemoryKv {
    values: DashMap<String, Entry>,
    channels: DashMap<String, broadcast::Sender<String>>,
    /// Serializes `cas` so the read-modify-write is atomic without needing
    /// per-key locks; fine at test scale.
    cas_lock: Mutex<()>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, key: &str) -> Option<String> {
        let entry = self.values.get(key)?;
        if let Some(exp) = entry.expires_at {
            if Instant::now() >= exp {
                drop(entry);
                self.values.remove(key);
                return None;
            }
        }
        Some(entry.value.clone())
    }

    fn channel(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read(key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let _ = self.channel(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let rx = self.channel(channel).subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|r| r.ok());
        Ok(Box::pin(stream))
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.remove(key).map(|(_, e)| e.value))
    }

    async fn cas(
        &self,
        key: &str,
        ttl_secs: u64,
        max_attempts: usize,
        f: &(dyn Fn(Option<&str>) -> Option<String> + Send + Sync),
    ) -> Result<CasOutcome> {
        for _ in 0..max_attempts {
            let _guard = self.cas_lock.lock().unwrap();
            let current = self.read(key);
            let Some(next) = f(current.as_deref()) else {
                return Ok(CasOutcome::Applied(None));
            };
            self.values.insert(
                key.to_string(),
                Entry {
                    value: next.clone(),
                    expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
                },
            );
            return Ok(CasOutcome::Applied(Some(next)));
        }
        Ok(CasOutcome::Conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", 60).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn get_del_is_atomic_pop() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", 60).await.unwrap();
        assert_eq!(kv.get_del("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let kv = MemoryKv::new();
        let mut stream = kv.subscribe("chan").await.unwrap();
        kv.publish("chan", "hello").await.unwrap();
        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, "hello");
    }
}
