//! The "KV+PubSub" collaborator contract (spec §1): string GET/SETEX/DEL,
//! PUBLISH/SUBSCRIBE, and optimistic compare-and-set on a single key. Both
//! the Live Bus (§4.C) and the Queue Store (§4.E) are built on top of this.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::Result;

/// Outcome of a `cas` call (§4.E's upsert retry loop).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The transform ran and its result (or `None` for a delete) was written.
    Applied(Option<String>),
    /// `max_attempts` conflicting writers raced us out.
    Conflict,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// `SET key value EX ttl_secs`.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a single channel (no wildcard expansion needed by any
    /// caller in this substrate, though a real Redis backend is free to
    /// implement this via `PSUBSCRIBE` for symmetry with §1's contract).
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;

    /// Atomic get-and-delete, used by the Queue Store's `pop_next` (§4.E).
    async fn get_del(&self, key: &str) -> Result<Option<String>>;

    /// Optimistically apply `f` to the current value of `key` (`None` if
    /// absent) and write the result back with `ttl_secs`, retrying up to
    /// `max_attempts` times if another writer raced us. `f` returning `None`
    /// leaves the key untouched and aborts the call with `Applied(None)`.
    async fn cas(
        &self,
        key: &str,
        ttl_secs: u64,
        max_attempts: usize,
        f: &(dyn Fn(Option<&str>) -> Option<String> + Send + Sync),
    ) -> Result<CasOutcome>;
}
