//! Live Bus (§4.C) plus the live-task breadcrumb supplement (§2.1.L).

use std::sync::Arc;

use futures_util::stream::BoxStream;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::kv::KvStore;

pub struct LiveBus {
    kv: Arc<dyn KvStore>,
}

impl LiveBus {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn stream_live_channel(chat_id: Uuid) -> String {
        format!("chat:{chat_id}:stream:live")
    }

    fn cancel_channel(chat_id: Uuid) -> String {
        format!("chat:{chat_id}:cancel")
    }

    fn permission_response_channel(request_id: &str) -> String {
        format!("permission:{request_id}:response")
    }

    fn task_key(chat_id: Uuid) -> String {
        format!("chat:{chat_id}:task")
    }

    fn revoked_key(chat_id: Uuid) -> String {
        format!("chat:{chat_id}:revoked")
    }

    fn context_usage_key(chat_id: Uuid) -> String {
        format!("chat:{chat_id}:context_usage")
    }

    /// Advisory "new data" notice (§4.C) — payload is ignored by subscribers,
    /// so a bare word suffices. Best-effort: never fails the caller (§7).
    pub async fn notify_stream_live(&self, chat_id: Uuid) {
        if let Err(e) = self.kv.publish(&Self::stream_live_channel(chat_id), "tick").await {
            warn!(%chat_id, error = %e, "stream:live publish failed");
        }
    }

    /// Full envelope publish for low-latency delivery (§4.C note), in
    /// addition to the bare advisory notice.
    pub async fn publish_envelope(&self, chat_id: Uuid, envelope_json: &str) {
        if let Err(e) = self.kv.publish(&Self::stream_live_channel(chat_id), envelope_json).await {
            warn!(%chat_id, error = %e, "stream:live envelope publish failed");
        }
    }

    pub async fn subscribe_stream_live(&self, chat_id: Uuid) -> Result<BoxStream<'static, String>> {
        self.kv.subscribe(&Self::stream_live_channel(chat_id)).await
    }

    pub async fn subscribe_cancel(&self, chat_id: Uuid) -> Result<BoxStream<'static, String>> {
        self.kv.subscribe(&Self::cancel_channel(chat_id)).await
    }

    pub async fn publish_cancel(&self, chat_id: Uuid) {
        if let Err(e) = self.kv.publish(&Self::cancel_channel(chat_id), "cancel").await {
            warn!(%chat_id, error = %e, "cancel publish failed");
        }
    }

    pub async fn subscribe_permission_response(&self, request_id: &str) -> Result<BoxStream<'static, String>> {
        self.kv.subscribe(&Self::permission_response_channel(request_id)).await
    }

    /// Fallback path used when `respond`/expiry cannot reach the in-process
    /// waker directly (§4.D) — publishes the decision body out of band.
    pub async fn publish_permission_response(&self, request_id: &str, decision: &Value) {
        let payload = decision.to_string();
        if let Err(e) = self.kv.publish(&Self::permission_response_channel(request_id), &payload).await {
            warn!(request_id, error = %e, "permission response publish failed");
        }
    }

    /// §2.1.L: record that `worker_id` owns a live stream for `chat_id`.
    pub async fn record_live_task(&self, chat_id: Uuid, worker_id: &str, ttl_secs: u64) {
        if let Err(e) = self.kv.set_ex(&Self::task_key(chat_id), worker_id, ttl_secs).await {
            warn!(%chat_id, error = %e, "live task breadcrumb write failed");
        }
    }

    /// §2.1.L: disconnecting clears both the task breadcrumb and the sticky
    /// cancel breadcrumb.
    pub async fn clear_live_task(&self, chat_id: Uuid) {
        if let Err(e) = self.kv.del(&Self::task_key(chat_id)).await {
            warn!(%chat_id, error = %e, "live task breadcrumb clear failed");
        }
        if let Err(e) = self.kv.del(&Self::revoked_key(chat_id)).await {
            warn!(%chat_id, error = %e, "revoked breadcrumb clear failed");
        }
    }

    pub async fn has_live_task(&self, chat_id: Uuid) -> Result<bool> {
        Ok(self.kv.get(&Self::task_key(chat_id)).await?.is_some())
    }

    /// Cache the `{tokens_used, context_window, percentage}` snapshot
    /// (§4.G.5) for fast reads outside the chat row.
    pub async fn cache_context_usage(&self, chat_id: Uuid, usage: &Value, ttl_secs: u64) {
        let payload = usage.to_string();
        if let Err(e) = self.kv.set_ex(&Self::context_usage_key(chat_id), &payload, ttl_secs).await {
            warn!(%chat_id, error = %e, "context usage cache write failed");
        }
    }

    pub async fn cached_context_usage(&self, chat_id: Uuid) -> Result<Option<Value>> {
        let raw = self.kv.get(&Self::context_usage_key(chat_id)).await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }
}
