//! Redis-backed `KvStore` (§1's "KV+PubSub" collaborator, concretely).

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tracing::warn;

use crate::error::{BusError, Result};
use crate::kv::{CasOutcome, KvStore};

/// CAS is implemented as a Lua script rather than `WATCH`/`MULTI`/`EXEC`:
/// pool connections are multiplexed, so per-connection `WATCH` state isn't
/// safe to rely on across concurrent callers. The script recomputes
/// atomically server-side instead.
/// Sentinel for "key must be absent" — distinguishes "no previous value"
/// from a legitimate empty-string value, since Lua's `GET` returns the
/// boolean `false` rather than an empty string for a missing key.
const ABSENT_MARKER: &str = "\u{0}__conduit_absent__\u{0}";

const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
local expected_absent = (ARGV[1] == ARGV[3])
local matches
if current == false then
    matches = expected_absent
else
    matches = (not expected_absent) and (current == ARGV[1])
end
if matches then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[4])
    return 1
else
    return 0
end
"#;

pub struct RedisKv {
    pool: Pool,
    client: redis::Client,
}

impl RedisKv {
    pub fn new(redis_url: &str) -> Result<Self> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        let client = redis::Client::open(redis_url)?;
        Ok(Self { pool, client })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        match conn.publish::<_, _, i64>(channel, payload).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // Best-effort per §4.C/§7: the log is authoritative, a
                // dropped advisory notice never fails the caller.
                warn!(%channel, error = %e, "live bus publish failed");
                Ok(())
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(Box::pin(stream))
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = redis::cmd("GETDEL").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn cas(
        &self,
        key: &str,
        ttl_secs: u64,
        max_attempts: usize,
        f: &(dyn Fn(Option<&str>) -> Option<String> + Send + Sync),
    ) -> Result<CasOutcome> {
        let mut conn = self.pool.get().await?;
        let script = redis::Script::new(CAS_SCRIPT);

        for _ in 0..max_attempts {
            let current: Option<String> = conn.get(key).await?;
            let Some(next) = f(current.as_deref()) else {
                return Ok(CasOutcome::Applied(None));
            };
            let expected = current.as_deref().unwrap_or(ABSENT_MARKER);

            let applied: i64 = script
                .key(key)
                .arg(expected)
                .arg(&next)
                .arg(ABSENT_MARKER)
                .arg(ttl_secs)
                .invoke_async(&mut conn)
                .await?;

            if applied == 1 {
                return Ok(CasOutcome::Applied(Some(next)));
            }
        }
        Ok(CasOutcome::Conflict)
    }
}
