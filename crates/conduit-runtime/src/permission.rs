//! Permission Registry (§4.D): an in-process request table with TTL and a
//! single-waiter wake-up, scoped to out-of-band user permission decisions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

/// The user's decision on a permission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub approved: bool,
    pub alternative_instruction: Option<String>,
    pub user_answers: Option<Value>,
}

impl PermissionResponse {
    /// Synthetic denial used on TTL expiry (§8 S6, §7).
    pub fn expired() -> Self {
        Self {
            approved: false,
            alternative_instruction: Some("Permission request expired. Please try again.".to_string()),
            user_answers: None,
        }
    }
}

struct Entry {
    chat_id: String,
    tool_name: String,
    tool_input: Value,
    expires_at: Instant,
    response: std::sync::Mutex<Option<PermissionResponse>>,
    waker: Arc<Notify>,
}

/// Request metadata returned by `get` (§3 data model).
#[derive(Debug, Clone)]
pub struct PermissionRequestInfo {
    pub chat_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub expires_at: Instant,
}

pub struct PermissionRegistry {
    entries: DashMap<String, Entry>,
    default_ttl: Duration,
}

impl PermissionRegistry {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
    }

    /// Insert a fresh request, expiring after the registry's default TTL.
    pub fn create(&self, request_id: &str, chat_id: &str, tool_name: &str, tool_input: Value) {
        self.evict_expired();
        self.entries.insert(
            request_id.to_string(),
            Entry {
                chat_id: chat_id.to_string(),
                tool_name: tool_name.to_string(),
                tool_input,
                expires_at: Instant::now() + self.default_ttl,
                response: std::sync::Mutex::new(None),
                waker: Arc::new(Notify::new()),
            },
        );
    }

    pub fn get(&self, request_id: &str) -> Option<PermissionRequestInfo> {
        self.evict_expired();
        self.entries.get(request_id).map(|e| PermissionRequestInfo {
            chat_id: e.chat_id.clone(),
            tool_name: e.tool_name.clone(),
            tool_input: e.tool_input.clone(),
            expires_at: e.expires_at,
        })
    }

    /// Record the user's decision and wake the single waiter. Returns
    /// `false` if the request is missing or already expired — the caller
    /// must then publish a synthetic denial on the pub/sub fallback path
    /// (§4.D, §7) so a waiter attached only via pub/sub still unblocks.
    pub fn respond(&self, request_id: &str, response: PermissionResponse) -> bool {
        self.evict_expired();
        let Some(entry) = self.entries.get(request_id) else {
            return false;
        };
        *entry.response.lock().unwrap() = Some(response);
        entry.waker.notify_waiters();
        true
    }

    /// Block up to `min(timeout, remaining_ttl)` for a response, then
    /// remove the entry regardless of outcome (§4.D: `wait` consumes the
    /// entry on both the wake and the timeout path).
    pub async fn wait(&self, request_id: &str, timeout: Duration) -> Option<PermissionResponse> {
        let (waker, bound, already) = {
            let entry = self.entries.get(request_id)?;
            let remaining = entry.expires_at.saturating_duration_since(Instant::now());
            let already = entry.response.lock().unwrap().clone();
            (entry.waker.clone(), timeout.min(remaining), already)
        };

        // `notify_waiters` stores no permit for a future `notified()` call, so
        // a response recorded before this waiter registered must be checked
        // directly rather than relied on to wake us. `enable()` also forces
        // registration before the check below runs, so a `respond()` racing
        // in right after the check still wakes this waiter instead of
        // sleeping out the full timeout.
        if already.is_none() {
            let notified = waker.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let _ = tokio::time::timeout(bound, notified).await;
        }

        let (_, entry) = self.entries.remove(request_id)?;
        entry.response.into_inner().unwrap()
    }
}
