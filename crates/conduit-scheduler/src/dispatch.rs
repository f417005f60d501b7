//! Scheduled-task dispatch (§4.I): turns a claimed `(task, execution)` pair
//! into a running chat, tracks it to completion, and finalizes the
//! execution and task rows once the Stream Runtime has finished.
//!
//! A scheduled task's sandbox is ephemeral: created fresh for this one run
//! and deleted unconditionally once the stream ends, regardless of outcome
//! — unlike an interactive chat's sandbox, which the Stream Runtime only
//! ever checkpoints.

use std::time::Duration;

use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use conduit_core::collab::AgentSpawnRequest;
use conduit_runtime::{RuntimeHandles, StreamRequest, StreamRuntime};
use conduit_store::{ExecutionStatus, Recurrence, Role, ScheduledTask, StreamStatus, TaskExecution, TaskStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Run a single claimed task to completion. Never panics or propagates:
/// every failure path is logged and folded into the execution/task rows so
/// the maintenance loop's tick can move on to the next claim.
#[instrument(skip(handles, task, execution), fields(task_id = %task.id, execution_id = %execution.id))]
pub async fn dispatch(handles: RuntimeHandles, task: ScheduledTask, execution: TaskExecution) {
    match handles.store.get_execution(execution.id) {
        Ok(current) if current.status != ExecutionStatus::Running => {
            info!("execution no longer running, presumably reaped; skipping dispatch");
            return;
        }
        Err(e) => {
            error!(error = %e, "could not re-read execution before dispatch");
            return;
        }
        _ => {}
    }

    let sandbox_id = match handles.sandbox.create(&task.user_id).await {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "scheduled task sandbox provisioning failed");
            finalize(&handles, &task, execution.id, None, ExecutionStatus::Failed, Some(&e.to_string())).await;
            return;
        }
    };

    let chat = match handles.store.create_chat(&task.user_id) {
        Ok(chat) => chat,
        Err(e) => {
            error!(error = %e, "scheduled task chat creation failed");
            if let Err(e2) = handles.sandbox.delete(&sandbox_id).await {
                warn!(error = %e2, "sandbox cleanup after failed chat creation also failed");
            }
            finalize(&handles, &task, execution.id, None, ExecutionStatus::Failed, Some(&e.to_string())).await;
            return;
        }
    };

    if let Err(e) = handles.store.set_sandbox(chat.id, &sandbox_id, None) {
        warn!(chat_id = %chat.id, error = %e, "failed to persist scheduled task sandbox id");
    }

    let outcome = run_to_completion(&handles, &task, chat.id, &sandbox_id).await;

    if let Err(e) = handles.sandbox.delete(&sandbox_id).await {
        warn!(chat_id = %chat.id, error = %e, "scheduled task sandbox cleanup failed");
    }

    let (exec_status, error_message) = match outcome {
        Ok(StreamStatus::Completed) => (ExecutionStatus::Success, None),
        Ok(status) => (ExecutionStatus::Failed, Some(format!("stream ended in {} state", status.as_str()))),
        Err(msg) => (ExecutionStatus::Failed, Some(msg)),
    };
    finalize(&handles, &task, execution.id, Some(chat.id), exec_status, error_message.as_deref()).await;
}

async fn run_to_completion(
    handles: &RuntimeHandles,
    task: &ScheduledTask,
    chat_id: Uuid,
    sandbox_id: &str,
) -> Result<StreamStatus, String> {
    handles
        .store
        .create_message(chat_id, Role::User, &task.prompt_message, StreamStatus::Completed, None)
        .map_err(|e| e.to_string())?;
    let assistant = handles
        .store
        .create_message(chat_id, Role::Assistant, "", StreamStatus::InProgress, None)
        .map_err(|e| e.to_string())?;

    let spawn_req = AgentSpawnRequest {
        chat_id: chat_id.to_string(),
        sandbox_id: Some(sandbox_id.to_string()),
        session_id: None,
        prompt: task.prompt_message.clone(),
        model_id: task.model_id.clone(),
        permission_mode: "default".to_string(),
        thinking_mode: None,
        attachments: None,
    };
    let agent = handles.factory.spawn(spawn_req).await.map_err(|e| e.to_string())?;

    let stream_req = StreamRequest {
        chat_id,
        message_id: assistant.id,
        model_id: task.model_id.clone(),
        permission_mode: "default".to_string(),
        thinking_mode: None,
        attachments: None,
    };
    StreamRuntime::spawn(handles.clone(), stream_req, agent).await.map_err(|e| e.to_string())?;

    while handles.background.is_active(chat_id) {
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    handles.store.get_message(assistant.id).map(|m| m.stream_status).map_err(|e| e.to_string())
}

/// Resolve the task's terminal status: `once` consumes itself into
/// `completed`/`failed`; any recurring cadence returns to `active` so the
/// next `next_fire_time` (already advanced at claim time) has a chance to fire.
async fn finalize(
    handles: &RuntimeHandles,
    task: &ScheduledTask,
    execution_id: Uuid,
    chat_id: Option<Uuid>,
    exec_status: ExecutionStatus,
    error_message: Option<&str>,
) {
    if let Err(e) = handles.store.complete_execution(execution_id, exec_status, chat_id, error_message) {
        error!(error = %e, "failed to persist execution completion");
    }

    let task_status = if task.recurrence == Recurrence::Once {
        if exec_status == ExecutionStatus::Success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        }
    } else {
        TaskStatus::Active
    };

    if let Err(e) = handles.store.set_task_status(task.id, task_status) {
        error!(error = %e, "failed to persist task status after dispatch");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;

    use conduit_bus::{KvStore, LiveBus, MemoryKv, QueueStore};
    use conduit_core::collab::{AgentEvent, AgentRunner, AgentRunnerFactory, AgentSpawnRequest, SandboxService};
    use conduit_core::CoreError;
    use conduit_runtime::{BackgroundRegistry, CancellationRegistry, RuntimeConfig};
    use conduit_store::{Store, TaskSpec};

    use super::*;

    struct ScriptedAgent {
        events: std::sync::Mutex<VecDeque<AgentEvent>>,
    }

    impl ScriptedAgent {
        fn new(events: Vec<AgentEvent>) -> Self {
            Self { events: std::sync::Mutex::new(events.into()) }
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedAgent {
        async fn next_event(&mut self) -> conduit_core::Result<Option<AgentEvent>> {
            Ok(self.events.lock().unwrap().pop_front())
        }
        async fn cancel(&self) {}
        async fn total_cost_usd(&self) -> f64 {
            0.0
        }
        async fn context_token_usage(&self, _session_id: &str) -> Option<u64> {
            None
        }
        fn session_id(&self) -> Option<String> {
            None
        }
    }

    struct OneShotFactory {
        agent: std::sync::Mutex<Option<Box<dyn AgentRunner>>>,
    }

    #[async_trait]
    impl AgentRunnerFactory for OneShotFactory {
        async fn spawn(&self, _req: AgentSpawnRequest) -> conduit_core::Result<Box<dyn AgentRunner>> {
            self.agent
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| CoreError::Internal("factory exhausted".into()))
        }
    }

    struct FailingFactory;

    #[async_trait]
    impl AgentRunnerFactory for FailingFactory {
        async fn spawn(&self, _req: AgentSpawnRequest) -> conduit_core::Result<Box<dyn AgentRunner>> {
            Err(CoreError::Internal("agent spawn failed".into()))
        }
    }

    struct CountingSandbox {
        created: std::sync::atomic::AtomicU64,
        deleted: std::sync::atomic::AtomicU64,
    }

    impl CountingSandbox {
        fn new() -> Self {
            Self { created: std::sync::atomic::AtomicU64::new(0), deleted: std::sync::atomic::AtomicU64::new(0) }
        }
    }

    #[async_trait]
    impl SandboxService for CountingSandbox {
        async fn create(&self, _user_id: &str) -> conduit_core::Result<String> {
            let n = self.created.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(format!("sandbox-{n}"))
        }
        async fn attach(&self, _sandbox_id: &str) -> conduit_core::Result<()> {
            Ok(())
        }
        async fn create_checkpoint(&self, _sandbox_id: &str, _message_id: &str) -> conduit_core::Result<Option<String>> {
            Ok(None)
        }
        async fn delete(&self, _sandbox_id: &str) -> conduit_core::Result<()> {
            self.deleted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSandbox;

    #[async_trait]
    impl SandboxService for FailingSandbox {
        async fn create(&self, _user_id: &str) -> conduit_core::Result<String> {
            Err(CoreError::Unavailable("sandbox provider down".into()))
        }
        async fn attach(&self, _sandbox_id: &str) -> conduit_core::Result<()> {
            Ok(())
        }
        async fn create_checkpoint(&self, _sandbox_id: &str, _message_id: &str) -> conduit_core::Result<Option<String>> {
            Ok(None)
        }
        async fn delete(&self, _sandbox_id: &str) -> conduit_core::Result<()> {
            Ok(())
        }
    }

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            batch_time_ms: 50,
            batch_count: 2,
            context_poll_secs: 3600,
            task_ttl_secs: 3600,
            context_cache_ttl_secs: 3600,
            context_window_tokens: 100_000,
            worker_id: "test-worker".into(),
        }
    }

    fn test_handles(factory: Arc<dyn AgentRunnerFactory>, sandbox: Arc<dyn SandboxService>) -> (RuntimeHandles, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let bus = Arc::new(LiveBus::new(kv.clone()));
        let queue = Arc::new(QueueStore::new(kv.clone(), 300));
        let cancels = Arc::new(CancellationRegistry::new(std::time::Duration::from_secs(5)));
        let background = Arc::new(BackgroundRegistry::new());
        let handles = RuntimeHandles {
            store: store.clone(),
            bus,
            queue,
            cancels,
            sandbox,
            factory,
            background,
            config: test_config(),
        };
        (handles, store)
    }

    fn spec(recurrence: Recurrence) -> TaskSpec {
        TaskSpec {
            task_name: "daily standup".into(),
            prompt_message: "summarize yesterday's commits".into(),
            recurrence,
            scheduled_time: "09:00".into(),
            scheduled_day: None,
            timezone: "UTC".into(),
            model_id: "model-a".into(),
        }
    }

    fn claim_one(store: &Store) -> (ScheduledTask, TaskExecution) {
        let mut claimed = store.claim_due_tasks(10, |_task| None).unwrap();
        assert_eq!(claimed.len(), 1);
        claimed.remove(0)
    }

    /// A once-off task that completes cleanly finishes `completed`, its
    /// execution records `success`, and the ephemeral sandbox is torn down.
    #[tokio::test]
    async fn once_task_completes_and_marks_execution_success() {
        let sandbox = Arc::new(CountingSandbox::new());
        let agent = ScriptedAgent::new(vec![AgentEvent::AssistantText { text: "done".into() }]);
        let factory = Arc::new(OneShotFactory { agent: std::sync::Mutex::new(Some(Box::new(agent))) });
        let (handles, store) = test_handles(factory, sandbox.clone());

        store.create_scheduled_task("user-1", spec(Recurrence::Once), Some("2026-01-01T00:00:00Z".into())).unwrap();
        let (task, execution) = claim_one(&store);

        dispatch(handles, task.clone(), execution.clone()).await;

        let final_execution = store.get_execution(execution.id).unwrap();
        assert_eq!(final_execution.status, ExecutionStatus::Success);
        assert!(final_execution.chat_id.is_some());

        let final_task = store.get_scheduled_task(task.id).unwrap();
        assert_eq!(final_task.status, TaskStatus::Completed);

        assert_eq!(sandbox.created.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(sandbox.deleted.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    /// A recurring task returns to `active` after a successful run instead
    /// of being consumed, since `next_fire_time` was already advanced at
    /// claim time.
    #[tokio::test]
    async fn recurring_task_returns_to_active_after_success() {
        let sandbox = Arc::new(CountingSandbox::new());
        let agent = ScriptedAgent::new(vec![AgentEvent::AssistantText { text: "done".into() }]);
        let factory = Arc::new(OneShotFactory { agent: std::sync::Mutex::new(Some(Box::new(agent))) });
        let (handles, store) = test_handles(factory, sandbox);

        store.create_scheduled_task("user-1", spec(Recurrence::Daily), Some("2026-01-01T00:00:00Z".into())).unwrap();
        let (task, execution) = claim_one(&store);

        dispatch(handles, task.clone(), execution.clone()).await;

        let final_task = store.get_scheduled_task(task.id).unwrap();
        assert_eq!(final_task.status, TaskStatus::Active);
    }

    /// A failed agent spawn never creates a stream; the execution is marked
    /// `failed` and the once-off task itself moves to `failed`, with the
    /// sandbox cleaned up and the chat still attributed on the execution.
    #[tokio::test]
    async fn agent_spawn_failure_marks_execution_failed() {
        let sandbox = Arc::new(CountingSandbox::new());
        let (handles, store) = test_handles(Arc::new(FailingFactory), sandbox.clone());

        store.create_scheduled_task("user-1", spec(Recurrence::Once), Some("2026-01-01T00:00:00Z".into())).unwrap();
        let (task, execution) = claim_one(&store);

        dispatch(handles, task.clone(), execution.clone()).await;

        let final_execution = store.get_execution(execution.id).unwrap();
        assert_eq!(final_execution.status, ExecutionStatus::Failed);
        assert!(final_execution.error_message.is_some());
        assert!(final_execution.chat_id.is_some());

        let final_task = store.get_scheduled_task(task.id).unwrap();
        assert_eq!(final_task.status, TaskStatus::Failed);

        assert_eq!(sandbox.created.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(sandbox.deleted.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    /// Sandbox provisioning failure never reaches `run_to_completion`; no
    /// chat is created and the execution carries no `chat_id`.
    #[tokio::test]
    async fn sandbox_provisioning_failure_skips_chat_creation() {
        let (handles, store) = test_handles(Arc::new(FailingFactory), Arc::new(FailingSandbox));

        store.create_scheduled_task("user-1", spec(Recurrence::Once), Some("2026-01-01T00:00:00Z".into())).unwrap();
        let (task, execution) = claim_one(&store);

        dispatch(handles, task.clone(), execution.clone()).await;

        let final_execution = store.get_execution(execution.id).unwrap();
        assert_eq!(final_execution.status, ExecutionStatus::Failed);
        assert!(final_execution.chat_id.is_none());

        let final_task = store.get_scheduled_task(task.id).unwrap();
        assert_eq!(final_task.status, TaskStatus::Failed);
    }

    /// An execution already reaped out from under a slow dispatch (e.g. by
    /// the recovery sweep) is detected by the re-read guard and skipped
    /// entirely: no sandbox is provisioned.
    #[tokio::test]
    async fn already_reaped_execution_is_skipped() {
        let sandbox = Arc::new(CountingSandbox::new());
        let (handles, store) = test_handles(Arc::new(FailingFactory), sandbox.clone());

        store.create_scheduled_task("user-1", spec(Recurrence::Once), Some("2026-01-01T00:00:00Z".into())).unwrap();
        let (task, execution) = claim_one(&store);

        store.complete_execution(execution.id, ExecutionStatus::Failed, None, Some("reaped")).unwrap();

        dispatch(handles, task, execution).await;

        assert_eq!(sandbox.created.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
