//! `conduit-bus` — the KV+PubSub collaborator (§1), the Live Bus (§4.C)
//! built on top of it, and the per-chat follow-up Queue Store (§4.E).

pub mod bus;
pub mod error;
pub mod kv;
pub mod memory_kv;
pub mod queue;
pub mod redis_kv;

pub use bus::LiveBus;
pub use error::{BusError, Result};
pub use kv::{CasOutcome, KvStore};
pub use memory_kv::MemoryKv;
pub use queue::{QueueStore, QueuedFollowup, UpsertResult};
pub use redis_kv::RedisKv;
