//! Stream Runtime (§4.G): drives one `AgentRunner` to completion, batching
//! its events into the Event Log and Snapshot Store, publishing advisories
//! on the Live Bus, and handing off to the next queued follow-up on a
//! clean finish (§2.1.K).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use conduit_bus::{LiveBus, QueueStore};
use conduit_core::collab::{AgentRunnerFactory, AgentSpawnRequest};
use conduit_core::redact::redact_for_audit;
use conduit_core::{AgentEvent, AgentRunner, Envelope, SandboxService};
use conduit_store::{ContentRender, PendingEvent, Role, SnapshotUpdate, Store, StreamStatus};

use crate::background::BackgroundRegistry;
use crate::cancel::{CancelEvent, CancellationRegistry};
use crate::error::Result;

/// Tunables threaded through from `conduit_core::config::StreamingConfig`.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub batch_time_ms: u64,
    pub batch_count: usize,
    pub context_poll_secs: u64,
    pub task_ttl_secs: u64,
    pub context_cache_ttl_secs: u64,
    pub context_window_tokens: u64,
    pub worker_id: String,
}

/// Shared dependencies injected into every Stream Runtime instance.
#[derive(Clone)]
pub struct RuntimeHandles {
    pub store: Arc<Store>,
    pub bus: Arc<LiveBus>,
    pub queue: Arc<QueueStore>,
    pub cancels: Arc<CancellationRegistry>,
    pub sandbox: Arc<dyn SandboxService>,
    pub factory: Arc<dyn AgentRunnerFactory>,
    pub background: Arc<BackgroundRegistry>,
    pub config: RuntimeConfig,
}

/// The turn to run: an assistant message already created `InProgress` and
/// the parameters the agent collaborator needs to resume the conversation.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub chat_id: Uuid,
    pub message_id: Uuid,
    pub model_id: String,
    pub permission_mode: String,
    pub thinking_mode: Option<String>,
    pub attachments: Option<Value>,
}

enum Outcome {
    Completed,
    Cancelled,
    Error(String),
}

struct Accumulator {
    content_text: String,
    render_events: Vec<Value>,
    pending: Vec<PendingEvent>,
    watermark: usize,
    total_events: usize,
    last_seq: i64,
    last_flush: Instant,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            content_text: String::new(),
            render_events: Vec::new(),
            pending: Vec::new(),
            watermark: 0,
            total_events: 0,
            last_seq: 0,
            last_flush: Instant::now(),
        }
    }

    fn push(&mut self, event: AgentEvent) {
        let kind = event.kind().to_string();
        let payload = event.render_payload();
        if let AgentEvent::AssistantText { text } = &event {
            self.content_text.push_str(text);
        }
        let audit_payload = Some(redact_for_audit(&payload));
        self.render_events.push(payload.clone());
        self.pending.push(PendingEvent { event_type: kind, render_payload: payload, audit_payload });
        self.watermark += 1;
        self.total_events += 1;
    }

    fn snapshot_update(&self, last_seq: i64) -> SnapshotUpdate {
        SnapshotUpdate {
            content_text: Some(self.content_text.clone()),
            content_render: Some(ContentRender { events: self.render_events.clone(), segments: vec![] }),
            last_seq,
            ..Default::default()
        }
    }
}

/// Entry point: claims the message for a fresh `stream_id`, registers with
/// the Cancellation Registry, and spawns the consume loop as a background
/// task tracked in `handles.background`.
pub struct StreamRuntime;

impl StreamRuntime {
    pub async fn spawn(handles: RuntimeHandles, req: StreamRequest, agent: Box<dyn AgentRunner>) -> Result<Uuid> {
        let stream_id = Uuid::now_v7();
        handles.store.claim_stream(req.message_id, stream_id)?;

        let cancel_event = handles.cancels.register(req.chat_id);
        let spawn_handles = handles.clone();
        let spawn_req = req.clone();
        let spawn_cancel = cancel_event.clone();

        let join: JoinHandle<()> =
            tokio::spawn(run(spawn_handles, spawn_req, agent, stream_id, spawn_cancel));
        handles.background.register(req.chat_id, stream_id, join);
        Ok(stream_id)
    }
}

async fn run(
    handles: RuntimeHandles,
    req: StreamRequest,
    mut agent: Box<dyn AgentRunner>,
    stream_id: Uuid,
    cancel_event: CancelEvent,
) {
    let span = info_span!("stream", chat_id = %req.chat_id, message_id = %req.message_id, stream_id = %stream_id);
    async {
        if let Err(e) = emit_control(&handles, req.chat_id, req.message_id, stream_id, "stream_started", Value::Object(Default::default())).await
        {
            error!(error = %e, "failed to record stream_started");
        }
        handles.bus.record_live_task(req.chat_id, &handles.config.worker_id, handles.config.task_ttl_secs).await;

        let mut acc = Accumulator::new();
        let outcome = consume(&handles, &mut agent, &mut acc, req.chat_id, req.message_id, stream_id, &cancel_event).await;

        complete(&handles, &req, stream_id, &mut acc, outcome, agent.as_ref()).await;

        handles.bus.clear_live_task(req.chat_id).await;
        handles.cancels.unregister(req.chat_id, &cancel_event);
        handles.background.unregister(req.chat_id, stream_id);
    }
    .instrument(span)
    .await
}

/// Race agent events against cancellation, buffering snapshot events and
/// flushing on the §4.G.3 cadence. Also drives the context-usage refresher
/// ticker (§4.G.5) on the same clock as the flush timer.
async fn consume(
    handles: &RuntimeHandles,
    agent: &mut Box<dyn AgentRunner>,
    acc: &mut Accumulator,
    chat_id: Uuid,
    message_id: Uuid,
    stream_id: Uuid,
    cancel_event: &CancelEvent,
) -> Outcome {
    // S3: a cancel that raced construction is already visible here.
    if cancel_event.is_set() {
        agent.cancel().await;
        return Outcome::Cancelled;
    }

    let batch_time = Duration::from_millis(handles.config.batch_time_ms);
    let context_poll = Duration::from_secs(handles.config.context_poll_secs.max(1));
    let mut next_tick = Instant::now() + batch_time;
    let mut last_context_poll = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = cancel_event.wait() => {
                agent.cancel().await;
                return Outcome::Cancelled;
            }
            event = agent.next_event() => {
                match event {
                    Ok(Some(ev)) => {
                        acc.push(ev);
                        if acc.pending.len() >= handles.config.batch_count {
                            flush(handles, chat_id, message_id, stream_id, acc).await;
                            next_tick = Instant::now() + batch_time;
                        }
                    }
                    Ok(None) => return Outcome::Completed,
                    Err(e) => return Outcome::Error(e.to_string()),
                }
            }
            _ = tokio::time::sleep_until(next_tick) => {
                if !acc.pending.is_empty() && acc.last_flush.elapsed() >= batch_time {
                    flush(handles, chat_id, message_id, stream_id, acc).await;
                }
                next_tick = Instant::now() + batch_time;

                if last_context_poll.elapsed() >= context_poll {
                    poll_context_usage(handles, chat_id, message_id, stream_id, agent.as_ref()).await;
                    last_context_poll = Instant::now();
                }
            }
        }
    }
}

/// Write the buffered batch to the Event Log unconditionally, and to the
/// Snapshot Store only when the cadence thresholds are met — an
/// append-triggering control event elsewhere in the flow would otherwise
/// force a snapshot write on every single buffered event.
async fn flush(handles: &RuntimeHandles, chat_id: Uuid, message_id: Uuid, stream_id: Uuid, acc: &mut Accumulator) {
    if acc.pending.is_empty() {
        return;
    }
    let cadence_met = acc.last_flush.elapsed() >= Duration::from_millis(handles.config.batch_time_ms)
        || acc.pending.len() >= handles.config.batch_count;

    let last_seq = match handles.store.append_batch(chat_id, message_id, stream_id, &acc.pending) {
        Ok(seq) => seq,
        Err(e) => {
            error!(%chat_id, %message_id, error = %e, "event batch append failed");
            acc.pending.clear();
            return;
        }
    };
    acc.last_seq = last_seq;
    acc.pending.clear();
    acc.last_flush = Instant::now();

    if acc.watermark > 0 && cadence_met {
        if let Err(e) = handles.store.update_snapshot(message_id, acc.snapshot_update(last_seq)) {
            error!(%message_id, error = %e, "snapshot update failed");
        } else {
            acc.watermark = 0;
        }
    }

    handles.bus.notify_stream_live(chat_id).await;
}

/// Always writes the Event Log, and always writes a control event's own
/// Envelope for the low-latency path (§4.C note) in addition to the bare
/// advisory every other write relies on.
async fn emit_control(
    handles: &RuntimeHandles,
    chat_id: Uuid,
    message_id: Uuid,
    stream_id: Uuid,
    kind: &str,
    payload: Value,
) -> Result<i64> {
    let seq = handles.store.append_with_next_seq(chat_id, message_id, stream_id, kind, payload.clone(), None)?;
    let envelope = Envelope::new(chat_id, message_id, stream_id, seq, kind, payload);
    if let Ok(json) = serde_json::to_string(&envelope) {
        handles.bus.publish_envelope(chat_id, &json).await;
    }
    handles.bus.notify_stream_live(chat_id).await;
    Ok(seq)
}

/// §4.G.5: on a numeric result, persists `Chat.context_token_usage`, caches
/// `{tokens_used, context_window, percentage}` at the short-TTL KV key, and
/// emits a `system` event carrying that same snapshot so live and late
/// watchers update without polling.
async fn poll_context_usage(handles: &RuntimeHandles, chat_id: Uuid, message_id: Uuid, stream_id: Uuid, agent: &dyn AgentRunner) {
    let Some(session_id) = agent.session_id() else {
        return;
    };
    let Some(tokens_used) = agent.context_token_usage(&session_id).await else {
        return;
    };
    let window = handles.config.context_window_tokens;
    let percentage = if window > 0 { (tokens_used as f64 / window as f64) * 100.0 } else { 0.0 };
    let usage = serde_json::json!({
        "tokens_used": tokens_used,
        "context_window": window,
        "percentage": percentage,
    });
    if let Err(e) = handles.store.update_context_usage(chat_id, usage.clone()) {
        debug!(%chat_id, error = %e, "context usage persist failed");
    }
    handles.bus.cache_context_usage(chat_id, &usage, handles.config.context_cache_ttl_secs).await;

    if let Err(e) = emit_control(handles, chat_id, message_id, stream_id, "system", usage).await {
        error!(%chat_id, error = %e, "failed to record context usage system event");
    }
}

/// Final flush, effective-status computation, a §4.G.4-ordered snapshot
/// write (using the last flushed seq, *before* the terminal control event
/// exists), best-effort checkpoint, then either a follow-up handoff
/// (`queue_processing`, no final `complete`) or a context-usage refresh
/// plus the final `complete`/`cancelled`/`error` frame.
async fn complete(
    handles: &RuntimeHandles,
    req: &StreamRequest,
    stream_id: Uuid,
    acc: &mut Accumulator,
    outcome: Outcome,
    agent: &dyn AgentRunner,
) {
    if !acc.pending.is_empty() {
        if let Ok(seq) = handles.store.append_batch(req.chat_id, req.message_id, stream_id, &acc.pending) {
            acc.last_seq = seq;
        }
        acc.pending.clear();
    }

    let status = match &outcome {
        Outcome::Cancelled => StreamStatus::Interrupted,
        Outcome::Error(_) => StreamStatus::Failed,
        Outcome::Completed if acc.total_events == 0 => StreamStatus::Failed,
        Outcome::Completed => StreamStatus::Completed,
    };

    let total_cost_usd = agent.total_cost_usd().await;
    let mut update = acc.snapshot_update(acc.last_seq);
    update.stream_status = Some(status);
    update.total_cost_usd = Some(total_cost_usd);
    if let Err(e) = handles.store.update_snapshot(req.message_id, update) {
        error!(message_id = %req.message_id, error = %e, "terminal snapshot write failed");
    }

    if status == StreamStatus::Completed {
        checkpoint(handles, req).await;

        match handles.queue.pop_next(req.chat_id).await {
            Ok(Some(followup)) => {
                if let Err(e) =
                    emit_control(handles, req.chat_id, req.message_id, stream_id, "queue_processing", Value::Object(Default::default())).await
                {
                    error!(chat_id = %req.chat_id, error = %e, "failed to record queue_processing event");
                }
                if let Err(e) = spawn_followup(handles, req.chat_id, followup).await {
                    error!(chat_id = %req.chat_id, error = %e, "follow-up dispatch failed");
                }
            }
            Ok(None) => {
                poll_context_usage(handles, req.chat_id, req.message_id, stream_id, agent).await;
                if let Err(e) =
                    emit_control(handles, req.chat_id, req.message_id, stream_id, "complete", Value::Object(Default::default())).await
                {
                    error!(chat_id = %req.chat_id, error = %e, "failed to record complete event");
                }
            }
            Err(e) => {
                error!(chat_id = %req.chat_id, error = %e, "queue pop failed");
                poll_context_usage(handles, req.chat_id, req.message_id, stream_id, agent).await;
                let _ = emit_control(handles, req.chat_id, req.message_id, stream_id, "complete", Value::Object(Default::default())).await;
            }
        }
        return;
    }

    poll_context_usage(handles, req.chat_id, req.message_id, stream_id, agent).await;

    let (kind, payload) = match &outcome {
        Outcome::Cancelled => ("cancelled", Value::Object(Default::default())),
        Outcome::Error(msg) => ("error", serde_json::json!({ "error": msg })),
        Outcome::Completed => ("error", serde_json::json!({ "error": "agent produced no events" })),
    };
    if let Err(e) = emit_control(handles, req.chat_id, req.message_id, stream_id, kind, payload).await {
        error!(chat_id = %req.chat_id, message_id = %req.message_id, error = %e, "failed to record terminal control event");
    }
}

/// Best-effort sandbox checkpoint (§4.G.4 step 3); failure is logged, not
/// surfaced, and never blocks the queue drain that follows.
async fn checkpoint(handles: &RuntimeHandles, req: &StreamRequest) {
    match handles.store.get_chat(req.chat_id) {
        Ok(chat) => {
            if let Some(sandbox_id) = chat.sandbox_id.clone() {
                match handles.sandbox.create_checkpoint(&sandbox_id, &req.message_id.to_string()).await {
                    Ok(Some(checkpoint_id)) => {
                        if let Err(e) = handles.store.update_snapshot(
                            req.message_id,
                            SnapshotUpdate { checkpoint_id: Some(checkpoint_id), ..Default::default() },
                        ) {
                            warn!(chat_id = %req.chat_id, error = %e, "checkpoint id persist failed");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(chat_id = %req.chat_id, error = %e, "sandbox checkpoint failed"),
                }
            }
        }
        Err(e) => warn!(chat_id = %req.chat_id, error = %e, "chat lookup for checkpoint failed"),
    }
}

/// §2.1.K: materialize an already-popped follow-up as a fresh user/assistant
/// message pair and spawn a new Stream Runtime for it — the same
/// construction path a user-submitted turn goes through.
async fn spawn_followup(handles: &RuntimeHandles, chat_id: Uuid, followup: conduit_bus::QueuedFollowup) -> Result<()> {
    let chat = handles.store.get_chat(chat_id)?;

    handles.store.create_message(chat_id, Role::User, &followup.content, StreamStatus::Completed, None)?;
    let assistant_msg = handles.store.create_message(chat_id, Role::Assistant, "", StreamStatus::InProgress, None)?;

    let attachments = followup.attachments.clone().map(Value::Array);
    let spawn_req = AgentSpawnRequest {
        chat_id: chat_id.to_string(),
        sandbox_id: chat.sandbox_id.clone(),
        session_id: chat.session_id.clone(),
        prompt: followup.content.clone(),
        model_id: followup.model_id.clone(),
        permission_mode: followup.permission_mode.clone(),
        thinking_mode: followup.thinking_mode.clone(),
        attachments: attachments.clone(),
    };

    let agent = handles.factory.spawn(spawn_req).await?;

    let stream_req = StreamRequest {
        chat_id,
        message_id: assistant_msg.id,
        model_id: followup.model_id,
        permission_mode: followup.permission_mode,
        thinking_mode: followup.thinking_mode,
        attachments,
    };

    StreamRuntime::spawn(handles.clone(), stream_req, agent).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use conduit_bus::{KvStore, MemoryKv};
    use conduit_core::CoreError;

    use super::*;

    /// Replays a fixed script of events, then returns `None` (clean finish).
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
            0.01
        }
        async fn context_token_usage(&self, _session_id: &str) -> Option<u64> {
            None
        }
        fn session_id(&self) -> Option<String> {
            None
        }
    }

    /// Replays a script, then blocks forever on the next call — used to pin
    /// the consume loop mid-stream so a test can race a cancel against it.
    struct StallingAgent {
        events: std::sync::Mutex<VecDeque<AgentEvent>>,
    }

    #[async_trait]
    impl AgentRunner for StallingAgent {
        async fn next_event(&mut self) -> conduit_core::Result<Option<AgentEvent>> {
            if let Some(ev) = self.events.lock().unwrap().pop_front() {
                return Ok(Some(ev));
            }
            std::future::pending().await
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

    /// Yields one event, then parks until the test releases it — used to
    /// open a window between "stream still running" and "stream completes"
    /// in which the test can enqueue follow-ups.
    struct GatedCompletionAgent {
        first: std::sync::Mutex<Option<AgentEvent>>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl AgentRunner for GatedCompletionAgent {
        async fn next_event(&mut self) -> conduit_core::Result<Option<AgentEvent>> {
            if let Some(ev) = self.first.lock().unwrap().take() {
                return Ok(Some(ev));
            }
            self.release.notified().await;
            Ok(None)
        }
        async fn cancel(&self) {}
        async fn total_cost_usd(&self) -> f64 {
            0.02
        }
        async fn context_token_usage(&self, _session_id: &str) -> Option<u64> {
            None
        }
        fn session_id(&self) -> Option<String> {
            None
        }
    }

    struct NoopSandbox;

    #[async_trait]
    impl SandboxService for NoopSandbox {
        async fn create(&self, _user_id: &str) -> conduit_core::Result<String> {
            Ok("sandbox".into())
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

    /// Never exercised unless a test's queue actually has a follow-up
    /// pending at completion time.
    struct NoFollowupFactory;

    #[async_trait]
    impl AgentRunnerFactory for NoFollowupFactory {
        async fn spawn(&self, _req: AgentSpawnRequest) -> conduit_core::Result<Box<dyn AgentRunner>> {
            Err(CoreError::Internal("unexpected follow-up spawn".into()))
        }
    }

    /// Hands back exactly one scripted agent for the single follow-up the
    /// queue-merge test expects to be drained.
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
                .ok_or_else(|| CoreError::Internal("follow-up factory exhausted".into()))
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

    fn test_handles(factory: Arc<dyn AgentRunnerFactory>) -> (RuntimeHandles, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let bus = Arc::new(LiveBus::new(kv.clone()));
        let queue = Arc::new(QueueStore::new(kv.clone(), 300));
        let cancels = Arc::new(CancellationRegistry::new(Duration::from_secs(5)));
        let background = Arc::new(BackgroundRegistry::new());
        let handles = RuntimeHandles {
            store: store.clone(),
            bus,
            queue,
            cancels,
            sandbox: Arc::new(NoopSandbox),
            factory,
            background,
            config: test_config(),
        };
        (handles, store)
    }

    async fn await_drain(handles: &RuntimeHandles, chat_id: Uuid) {
        for _ in 0..200 {
            if !handles.background.is_active(chat_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("stream did not finish draining within 2s");
    }

    /// S1: happy path — text, a tool round-trip, more text, clean finish.
    #[tokio::test]
    async fn happy_path_produces_gap_free_log_and_coalesced_snapshot() {
        let (handles, store) = test_handles(Arc::new(NoFollowupFactory));
        let chat = store.create_chat("user-1").unwrap();
        let message = store.create_message(chat.id, Role::Assistant, "", StreamStatus::InProgress, None).unwrap();

        let agent = ScriptedAgent::new(vec![
            AgentEvent::AssistantText { text: "Hi".into() },
            AgentEvent::ToolStarted { id: "t1".into(), name: "read".into(), input: serde_json::json!({}) },
            AgentEvent::ToolCompleted { id: "t1".into(), result: serde_json::json!({"ok": true}) },
            AgentEvent::AssistantText { text: " there.".into() },
        ]);

        let req = StreamRequest {
            chat_id: chat.id,
            message_id: message.id,
            model_id: "model-a".into(),
            permission_mode: "auto".into(),
            thinking_mode: None,
            attachments: None,
        };
        StreamRuntime::spawn(handles.clone(), req, Box::new(agent)).await.unwrap();
        await_drain(&handles, chat.id).await;

        let final_chat = store.get_chat(chat.id).unwrap();
        assert_eq!(final_chat.last_event_seq, 6); // stream_started, 2x text, 2x tool, complete

        let final_message = store.get_message(message.id).unwrap();
        assert_eq!(final_message.content_text, "Hi there.");
        assert_eq!(final_message.content_render.events.len(), 4);
        assert_eq!(final_message.stream_status, StreamStatus::Completed);
        assert!(final_message.active_stream_id.is_none());
        assert_eq!(final_message.total_cost_usd, Some(0.01));

        let events = store.range_by_chat(chat.id, 0, 100).unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["stream_started", "assistant_text", "tool_started", "tool_completed", "assistant_text", "complete"]
        );
    }

    /// S2: a cancel mid-stream stops consumption and marks the message
    /// interrupted, keeping whatever text was persisted so far.
    #[tokio::test]
    async fn mid_stream_cancel_marks_interrupted() {
        let (handles, store) = test_handles(Arc::new(NoFollowupFactory));
        let chat = store.create_chat("user-1").unwrap();
        let message = store.create_message(chat.id, Role::Assistant, "", StreamStatus::InProgress, None).unwrap();

        let agent = StallingAgent {
            events: std::sync::Mutex::new(
                vec![
                    AgentEvent::AssistantText { text: "Hi".into() },
                    AgentEvent::AssistantText { text: " there".into() },
                ]
                .into(),
            ),
        };

        let req = StreamRequest {
            chat_id: chat.id,
            message_id: message.id,
            model_id: "model-a".into(),
            permission_mode: "auto".into(),
            thinking_mode: None,
            attachments: None,
        };
        StreamRuntime::spawn(handles.clone(), req, Box::new(agent)).await.unwrap();

        // batch_count=2 forces a flush right after the two scripted events
        // land, so polling the log for them is deterministic.
        for _ in 0..200 {
            if store.range_by_chat(chat.id, 0, 100).unwrap().len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handles.cancels.request_cancel(chat.id);
        await_drain(&handles, chat.id).await;

        let final_message = store.get_message(message.id).unwrap();
        assert_eq!(final_message.stream_status, StreamStatus::Interrupted);
        assert_eq!(final_message.content_text, "Hi there");
        assert!(final_message.active_stream_id.is_none());

        let events = store.range_by_chat(chat.id, 0, 100).unwrap();
        assert_eq!(events.last().unwrap().event_type, "cancelled");
    }

    /// S3: a cancel that races construction is observed immediately, before
    /// any agent event is consumed.
    #[tokio::test]
    async fn pending_cancel_race_short_circuits_before_any_event() {
        let (handles, store) = test_handles(Arc::new(NoFollowupFactory));
        let chat = store.create_chat("user-1").unwrap();
        let message = store.create_message(chat.id, Role::Assistant, "", StreamStatus::InProgress, None).unwrap();

        // Cancel arrives before the runtime registers.
        handles.cancels.request_cancel(chat.id);

        let agent = ScriptedAgent::new(vec![AgentEvent::AssistantText { text: "never seen".into() }]);
        let req = StreamRequest {
            chat_id: chat.id,
            message_id: message.id,
            model_id: "model-a".into(),
            permission_mode: "auto".into(),
            thinking_mode: None,
            attachments: None,
        };
        StreamRuntime::spawn(handles.clone(), req, Box::new(agent)).await.unwrap();
        await_drain(&handles, chat.id).await;

        let final_message = store.get_message(message.id).unwrap();
        assert_eq!(final_message.stream_status, StreamStatus::Interrupted);
        assert_eq!(final_message.content_text, "");
        assert!(final_message.content_render.events.is_empty());

        let events = store.range_by_chat(chat.id, 0, 100).unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["stream_started", "cancelled"]);
    }

    /// S5: follow-ups queued mid-flight are merged and handed off atomically
    /// on clean completion; the original stream emits `queue_processing`
    /// instead of `complete`.
    #[tokio::test]
    async fn completion_drains_merged_follow_up_instead_of_completing() {
        let release = Arc::new(Notify::new());
        let followup_agent = ScriptedAgent::new(vec![AgentEvent::AssistantText { text: "Merged reply".into() }]);
        let factory = Arc::new(OneShotFactory { agent: std::sync::Mutex::new(Some(Box::new(followup_agent))) });
        let (handles, store) = test_handles(factory);

        let chat = store.create_chat("user-1").unwrap();
        let message = store.create_message(chat.id, Role::Assistant, "", StreamStatus::InProgress, None).unwrap();

        let agent = GatedCompletionAgent {
            first: std::sync::Mutex::new(Some(AgentEvent::AssistantText { text: "Hi".into() })),
            release: release.clone(),
        };
        let req = StreamRequest {
            chat_id: chat.id,
            message_id: message.id,
            model_id: "model-a".into(),
            permission_mode: "auto".into(),
            thinking_mode: None,
            attachments: None,
        };
        StreamRuntime::spawn(handles.clone(), req, Box::new(agent)).await.unwrap();

        // Wait for the first event to land, then queue two follow-ups while
        // the stream is still parked mid-flight.
        for _ in 0..200 {
            if store.range_by_chat(chat.id, 0, 100).unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handles.queue.upsert(chat.id, "First follow-up", "model-a", "auto", None, None).await.unwrap();
        handles.queue.upsert(chat.id, "Second follow-up", "model-a", "auto", None, None).await.unwrap();

        release.notify_one();
        await_drain(&handles, chat.id).await;

        let original = store.get_message(message.id).unwrap();
        assert_eq!(original.stream_status, StreamStatus::Completed);

        let events = store.range_by_chat(chat.id, 0, 100).unwrap();
        let original_kinds: Vec<&str> =
            events.iter().filter(|e| e.message_id == message.id).map(|e| e.event_type.as_str()).collect();
        assert!(original_kinds.contains(&"queue_processing"));
        assert!(!original_kinds.contains(&"complete"));

        let followup_message_id = events.iter().find(|e| e.message_id != message.id).unwrap().message_id;
        let followup_message = store.get_message(followup_message_id).unwrap();
        assert_eq!(followup_message.content_text, "Merged reply");
        assert_eq!(followup_message.stream_status, StreamStatus::Completed);

        assert!(handles.queue.get(chat.id).await.unwrap().is_none());
    }
}
