//! Wiring: construct every subsystem named in §2's component table and
//! assemble the Axum router over them. Mirrors the teacher's
//! `AppState::new` + `build_router` split in `skynet-gateway`.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;

use conduit_bus::{LiveBus, QueueStore, RedisKv};
use conduit_core::config::Config;
use conduit_runtime::{BackgroundRegistry, CancellationRegistry, PermissionRegistry, RuntimeConfig};
use conduit_scheduler::SchedulerService;
use conduit_store::Store;

use crate::collab_http::{HttpAgentRunnerFactory, HttpSandboxService};
use crate::state::AppState;

impl AppState {
    pub fn new(config: Config) -> conduit_core::Result<Self> {
        let store = Arc::new(
            Store::open(&config.storage.path)
                .map_err(|e| conduit_core::CoreError::Internal(format!("store open failed: {e}")))?,
        );

        let kv = Arc::new(
            RedisKv::new(&config.kv.url).map_err(|e| conduit_core::CoreError::Unavailable(e.to_string()))?,
        );
        let bus = Arc::new(LiveBus::new(kv.clone()));
        let queue = Arc::new(QueueStore::new(kv, config.streaming.task_ttl_secs));

        let permissions = Arc::new(PermissionRegistry::new(Duration::from_secs(config.streaming.permission_ttl_secs)));
        let cancels = Arc::new(CancellationRegistry::new(Duration::from_secs(config.streaming.cancel_ttl_secs)));
        let background = Arc::new(BackgroundRegistry::new());

        let timeout = Duration::from_secs(config.collab.request_timeout_secs);
        let sandbox: Arc<dyn conduit_core::collab::SandboxService> =
            Arc::new(HttpSandboxService::new(config.collab.sandbox_url.clone(), timeout));
        let factory: Arc<dyn conduit_core::collab::AgentRunnerFactory> =
            Arc::new(HttpAgentRunnerFactory::new(config.collab.agent_url.clone(), timeout));

        let scheduler = SchedulerService::new(store.clone());

        let runtime_config = RuntimeConfig {
            batch_time_ms: config.streaming.batch_time_ms,
            batch_count: config.streaming.batch_count,
            context_poll_secs: config.streaming.context_usage_poll_secs,
            task_ttl_secs: config.streaming.task_ttl_secs,
            context_cache_ttl_secs: config.streaming.context_cache_ttl_secs,
            context_window_tokens: config.streaming.context_window_tokens,
            worker_id: format!("conduit-gateway-{}", uuid::Uuid::now_v7()),
        };

        Ok(Self {
            config,
            store,
            bus,
            queue,
            permissions,
            cancels,
            background,
            sandbox,
            factory,
            scheduler,
            runtime_config,
        })
    }
}

/// Assemble the full Axum router (§6 HTTP surface), all under `/api/v1`
/// except the unauthenticated liveness probe.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health))
        .nest("/api/v1", api_router())
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat", post(crate::http::chat::start_chat))
        .route(
            "/chats/{id}/stream",
            get(crate::http::stream::subscribe).delete(crate::http::cancel::request_cancel),
        )
        .route("/chats/{id}/status", get(crate::http::status::stream_status))
        .route("/messages/{id}/events", get(crate::http::events::list_message_events))
        .route(
            "/chats/{id}/queue",
            post(crate::http::queue::upsert_queue)
                .get(crate::http::queue::get_queue)
                .patch(crate::http::queue::update_queue)
                .delete(crate::http::queue::clear_queue),
        )
        .route("/chats/{id}/permissions/request", post(crate::http::permissions::create_request))
        .route("/chats/{id}/permissions/response/{rid}", get(crate::http::permissions::wait_for_response))
        .route(
            "/chats/{id}/permissions/{rid}",
            get(crate::http::permissions::get_request),
        )
        .route("/chats/{id}/permissions/{rid}/respond", post(crate::http::permissions::respond))
        .route(
            "/scheduler/tasks",
            post(crate::http::scheduler::create_task).get(crate::http::scheduler::list_tasks),
        )
        .route(
            "/scheduler/tasks/{id}",
            get(crate::http::scheduler::get_task)
                .patch(crate::http::scheduler::update_task)
                .delete(crate::http::scheduler::delete_task),
        )
        .route("/scheduler/tasks/{id}/pause", post(crate::http::scheduler::pause_task))
        .route("/scheduler/tasks/{id}/resume", post(crate::http::scheduler::resume_task))
}
