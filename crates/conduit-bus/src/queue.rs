//! Queue Store (§4.E): at-most-one pending follow-up per chat.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BusError, Result};
use crate::kv::{CasOutcome, KvStore};

const MAX_CAS_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedFollowup {
    pub id: Uuid,
    pub content: String,
    pub model_id: String,
    pub permission_mode: String,
    pub thinking_mode: Option<String>,
    pub attachments: Option<Vec<Value>>,
    pub queued_at: String,
}

pub struct UpsertResult {
    pub id: Uuid,
    pub created: bool,
    pub merged_content: String,
    pub merged_attachments: Option<Vec<Value>>,
}

pub struct QueueStore {
    kv: Arc<dyn KvStore>,
    ttl_secs: u64,
}

impl QueueStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl_secs: u64) -> Self {
        Self { kv, ttl_secs }
    }

    fn key(chat_id: Uuid) -> String {
        format!("chat:{chat_id}:queue")
    }

    /// Merge `content` (and the mode fields / attachments) into the pending
    /// follow-up, creating one if none exists yet. Retried up to 5 times on
    /// CAS conflict (§4.E); exhausting retries surfaces `Unavailable` (§7).
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        &self,
        chat_id: Uuid,
        content: &str,
        model_id: &str,
        permission_mode: &str,
        thinking_mode: Option<&str>,
        attachments: Option<Vec<Value>>,
    ) -> Result<UpsertResult> {
        let key = Self::key(chat_id);
        let ttl = self.ttl_secs;
        let mut created = false;
        let mut new_id = Uuid::now_v7();

        let transform = |current: Option<&str>| -> Option<String> {
            let merged = match current.and_then(|raw| serde_json::from_str::<QueuedFollowup>(raw).ok()) {
                Some(mut existing) => {
                    existing.content = format!("{}\n{}", existing.content, content);
                    existing.model_id = model_id.to_string();
                    existing.permission_mode = permission_mode.to_string();
                    if let Some(tm) = thinking_mode {
                        existing.thinking_mode = Some(tm.to_string());
                    }
                    if let Some(new_attachments) = attachments.clone() {
                        let mut merged_attachments = existing.attachments.unwrap_or_default();
                        merged_attachments.extend(new_attachments);
                        existing.attachments = Some(merged_attachments);
                    }
                    new_id = existing.id;
                    created = false;
                    existing
                }
                None => {
                    created = true;
                    QueuedFollowup {
                        id: new_id,
                        content: content.to_string(),
                        model_id: model_id.to_string(),
                        permission_mode: permission_mode.to_string(),
                        thinking_mode: thinking_mode.map(str::to_string),
                        attachments: attachments.clone(),
                        queued_at: Utc::now().to_rfc3339(),
                    }
                }
            };
            serde_json::to_string(&merged).ok()
        };

        match self.kv.cas(&key, ttl, MAX_CAS_ATTEMPTS, &transform).await? {
            CasOutcome::Applied(Some(raw)) => {
                let followup: QueuedFollowup = serde_json::from_str(&raw)?;
                Ok(UpsertResult {
                    id: followup.id,
                    created,
                    merged_content: followup.content,
                    merged_attachments: followup.attachments,
                })
            }
            CasOutcome::Applied(None) => unreachable!("transform always returns Some"),
            CasOutcome::Conflict => Err(BusError::CasConflict(key)),
        }
    }

    pub async fn get(&self, chat_id: Uuid) -> Result<Option<QueuedFollowup>> {
        let raw = self.kv.get(&Self::key(chat_id)).await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    /// Replace only `content`, CAS-guarded; `None` if no follow-up exists.
    pub async fn update_content(&self, chat_id: Uuid, content: &str) -> Result<Option<QueuedFollowup>> {
        let key = Self::key(chat_id);
        let ttl = self.ttl_secs;
        let transform = |current: Option<&str>| -> Option<String> {
            let mut existing: QueuedFollowup = serde_json::from_str(current?).ok()?;
            existing.content = content.to_string();
            serde_json::to_string(&existing).ok()
        };

        match self.kv.cas(&key, ttl, MAX_CAS_ATTEMPTS, &transform).await? {
            CasOutcome::Applied(Some(raw)) => Ok(serde_json::from_str(&raw).ok()),
            CasOutcome::Applied(None) => Ok(None),
            CasOutcome::Conflict => Err(BusError::CasConflict(key)),
        }
    }

    pub async fn clear(&self, chat_id: Uuid) -> Result<()> {
        self.kv.del(&Self::key(chat_id)).await
    }

    /// Atomic get-and-delete (§4.E).
    pub async fn pop_next(&self, chat_id: Uuid) -> Result<Option<QueuedFollowup>> {
        let raw = self.kv.get_del(&Self::key(chat_id)).await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_kv::MemoryKv;

    fn store() -> QueueStore {
        QueueStore::new(Arc::new(MemoryKv::new()), 300)
    }

    #[tokio::test]
    async fn upsert_creates_then_merges() {
        let q = store();
        let chat_id = Uuid::now_v7();

        let first = q.upsert(chat_id, "First follow-up", "model-a", "auto", None, None).await.unwrap();
        assert!(first.created);
        assert_eq!(first.merged_content, "First follow-up");

        let second = q.upsert(chat_id, "Second follow-up", "model-a", "auto", None, None).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.merged_content, "First follow-up\nSecond follow-up");
        assert_eq!(second.id, first.id);
    }

    #[tokio::test]
    async fn pop_next_is_atomic_and_clears() {
        let q = store();
        let chat_id = Uuid::now_v7();
        q.upsert(chat_id, "hello", "model-a", "auto", None, None).await.unwrap();

        let popped = q.pop_next(chat_id).await.unwrap().unwrap();
        assert_eq!(popped.content, "hello");
        assert!(q.get(chat_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn attachments_accumulate() {
        let q = store();
        let chat_id = Uuid::now_v7();
        q.upsert(chat_id, "a", "m", "auto", None, Some(vec![serde_json::json!({"name": "x.png"})]))
            .await
            .unwrap();
        let r = q
            .upsert(chat_id, "b", "m", "auto", None, Some(vec![serde_json::json!({"name": "y.png"})]))
            .await
            .unwrap();
        assert_eq!(r.merged_attachments.unwrap().len(), 2);
    }
}
