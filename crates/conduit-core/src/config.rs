use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8089;

/// Top-level config (conduit.toml + CONDUIT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub kv: KvConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub collab: CollabConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            kv: KvConfig::default(),
            streaming: StreamingConfig::default(),
            scheduler: SchedulerConfig::default(),
            collab: CollabConfig::default(),
        }
    }
}

/// Endpoints for the two external collaborators named in §1 (agent process,
/// sandbox provisioner). Only their HTTP base URLs are ambient
/// configuration; the request/response shapes they speak are the
/// collaborator's own contract, not this substrate's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollabConfig {
    #[serde(default = "default_agent_url")]
    pub agent_url: String,
    #[serde(default = "default_sandbox_url")]
    pub sandbox_url: String,
    #[serde(default = "default_collab_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            agent_url: default_agent_url(),
            sandbox_url: default_sandbox_url(),
            request_timeout_secs: default_collab_timeout_secs(),
        }
    }
}

fn default_agent_url() -> String {
    "http://127.0.0.1:8090".to_string()
}
fn default_sandbox_url() -> String {
    "http://127.0.0.1:8091".to_string()
}
fn default_collab_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Grace period given to in-flight Stream Runtimes before a hard cancel on shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file backing the event log and snapshots.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// Redis connection URL backing the Live Bus, Queue Store and KV side effects.
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// SSE heartbeat interval, sent when no real frame has gone out recently.
    #[serde(default = "default_heartbeat_ms")]
    pub sse_heartbeat_ms: u64,
    /// Context-usage refresher poll interval (§4.G.5).
    #[serde(default = "default_context_poll_secs")]
    pub context_usage_poll_secs: u64,
    /// Snapshot batch flush threshold: elapsed time.
    #[serde(default = "default_batch_time_ms")]
    pub batch_time_ms: u64,
    /// Snapshot batch flush threshold: buffered event count.
    #[serde(default = "default_batch_count")]
    pub batch_count: usize,
    /// TTL for a "pending cancel" flag recorded before a producer registers.
    #[serde(default = "default_cancel_ttl_secs")]
    pub cancel_ttl_secs: u64,
    /// TTL for an out-of-band permission request.
    #[serde(default = "default_permission_ttl_secs")]
    pub permission_ttl_secs: u64,
    /// Hard cap on rows returned by a single `range_by_*` read.
    #[serde(default = "default_range_limit")]
    pub range_limit: i64,
    /// TTL for the `chat:{id}:task` live-task breadcrumb.
    #[serde(default = "default_task_ttl_secs")]
    pub task_ttl_secs: u64,
    /// TTL for the cached `chat:{id}:context_usage` entry.
    #[serde(default = "default_context_cache_ttl_secs")]
    pub context_cache_ttl_secs: u64,
    /// Context window size in tokens, used to compute the usage percentage.
    #[serde(default = "default_context_window_tokens")]
    pub context_window_tokens: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            sse_heartbeat_ms: default_heartbeat_ms(),
            context_usage_poll_secs: default_context_poll_secs(),
            batch_time_ms: default_batch_time_ms(),
            batch_count: default_batch_count(),
            cancel_ttl_secs: default_cancel_ttl_secs(),
            permission_ttl_secs: default_permission_ttl_secs(),
            range_limit: default_range_limit(),
            task_ttl_secs: default_task_ttl_secs(),
            context_cache_ttl_secs: default_context_cache_ttl_secs(),
            context_window_tokens: default_context_window_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maintenance loop tick interval for `check_due_tasks`.
    #[serde(default = "default_scheduler_tick_secs")]
    pub tick_secs: u64,
    /// Maximum number of tasks claimed per tick.
    #[serde(default = "default_scheduler_claim_limit")]
    pub claim_limit: i64,
    /// Refresh-token cleanup cadence.
    #[serde(default = "default_token_cleanup_secs")]
    pub token_cleanup_secs: u64,
    /// Orphaned-sandbox GC cadence.
    #[serde(default = "default_sandbox_gc_secs")]
    pub sandbox_gc_secs: u64,
    /// An execution stuck in `running` for longer than this (seconds) is reaped to `failed`.
    #[serde(default = "default_execution_stale_secs")]
    pub execution_stale_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_scheduler_tick_secs(),
            claim_limit: default_scheduler_claim_limit(),
            token_cleanup_secs: default_token_cleanup_secs(),
            sandbox_gc_secs: default_sandbox_gc_secs(),
            execution_stale_secs: default_execution_stale_secs(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_shutdown_grace_secs() -> u64 {
    30
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.conduit/conduit.db")
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_heartbeat_ms() -> u64 {
    15_000
}
fn default_context_poll_secs() -> u64 {
    20
}
fn default_batch_time_ms() -> u64 {
    200
}
fn default_batch_count() -> usize {
    24
}
fn default_cancel_ttl_secs() -> u64 {
    60
}
fn default_permission_ttl_secs() -> u64 {
    300
}
fn default_range_limit() -> i64 {
    500
}
fn default_task_ttl_secs() -> u64 {
    24 * 3600
}
fn default_context_cache_ttl_secs() -> u64 {
    300
}
fn default_context_window_tokens() -> u64 {
    200_000
}
fn default_scheduler_tick_secs() -> u64 {
    60
}
fn default_scheduler_claim_limit() -> i64 {
    25
}
fn default_token_cleanup_secs() -> u64 {
    24 * 3600
}
fn default_sandbox_gc_secs() -> u64 {
    3600
}
fn default_execution_stale_secs() -> i64 {
    900
}

impl Config {
    /// Load config from a TOML file with `CONDUIT_*` env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `~/.conduit/conduit.toml`
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: Config = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CONDUIT_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.conduit/conduit.toml")
}
