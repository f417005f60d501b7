//! Central shared state, passed as `Arc<AppState>` to every handler —
//! mirrors the teacher's `AppState` shape: one struct holding every
//! subsystem handle the router needs, built once in `main` and cloned
//! cheaply per request via the `Arc`.

use std::sync::Arc;

use axum::http::HeaderMap;
use conduit_bus::{LiveBus, QueueStore};
use conduit_core::collab::{AgentRunnerFactory, SandboxService};
use conduit_core::config::Config;
use conduit_core::CoreError;
use conduit_runtime::{BackgroundRegistry, CancellationRegistry, PermissionRegistry, RuntimeConfig, RuntimeHandles};
use conduit_scheduler::SchedulerService;
use conduit_store::Store;

use crate::error::ApiResult;

pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub bus: Arc<LiveBus>,
    pub queue: Arc<QueueStore>,
    pub permissions: Arc<PermissionRegistry>,
    pub cancels: Arc<CancellationRegistry>,
    pub background: Arc<BackgroundRegistry>,
    pub sandbox: Arc<dyn SandboxService>,
    pub factory: Arc<dyn AgentRunnerFactory>,
    pub scheduler: SchedulerService,
    pub runtime_config: RuntimeConfig,
}

impl AppState {
    /// Bundle the subset of fields `conduit_runtime::StreamRuntime` and
    /// `conduit_scheduler::dispatch` expect, cloned fresh per call since
    /// `RuntimeHandles` is cheap (every field is an `Arc` or `Clone` value).
    pub fn runtime_handles(&self) -> RuntimeHandles {
        RuntimeHandles {
            store: self.store.clone(),
            bus: self.bus.clone(),
            queue: self.queue.clone(),
            cancels: self.cancels.clone(),
            sandbox: self.sandbox.clone(),
            factory: self.factory.clone(),
            background: self.background.clone(),
            config: self.runtime_config.clone(),
        }
    }
}

/// Authentication itself is out of scope (§1): this substrate trusts that
/// whatever sits in front of it (a gateway, a reverse proxy) has already
/// authenticated the caller and forwards the resolved identity in this
/// header, the same way the teacher's gateway trusts a bearer token it
/// doesn't mint itself.
pub const USER_ID_HEADER: &str = "x-conduit-user-id";

pub fn extract_user_id(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CoreError::Forbidden(format!("missing {USER_ID_HEADER} header")).into())
}
