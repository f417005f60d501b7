//! Contracts for the collaborators this substrate treats as external per §1:
//! the agent process, the sandbox provisioner. Only the shape of their
//! interaction with the streaming substrate is specified here — concrete
//! implementations (subprocess framing, sandbox API client) live outside
//! this crate and are injected as trait objects.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// One item yielded by an [`AgentRunner`]'s lazy event sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AssistantText { text: String },
    AssistantThinking { text: String },
    ToolStarted { id: String, name: String, input: Value },
    ToolCompleted { id: String, result: Value },
    ToolFailed { id: String, error: String },
    PermissionRequest { request_id: String, tool_name: String, tool_input: Value },
    System { payload: Value },
    PromptSuggestions { suggestions: Vec<String> },
}

impl AgentEvent {
    /// The `event_type`/`kind` string written to the log and SSE envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::AssistantText { .. } => "assistant_text",
            AgentEvent::AssistantThinking { .. } => "assistant_thinking",
            AgentEvent::ToolStarted { .. } => "tool_started",
            AgentEvent::ToolCompleted { .. } => "tool_completed",
            AgentEvent::ToolFailed { .. } => "tool_failed",
            AgentEvent::PermissionRequest { .. } => "permission_request",
            AgentEvent::System { .. } => "system",
            AgentEvent::PromptSuggestions { .. } => "prompt_suggestions",
        }
    }

    /// The JSON payload delivered to clients verbatim (not redacted).
    pub fn render_payload(&self) -> Value {
        match self {
            AgentEvent::AssistantText { text } => serde_json::json!({ "text": text }),
            AgentEvent::AssistantThinking { text } => serde_json::json!({ "text": text }),
            AgentEvent::ToolStarted { id, name, input } => {
                serde_json::json!({ "id": id, "name": name, "input": input })
            }
            AgentEvent::ToolCompleted { id, result } => {
                serde_json::json!({ "id": id, "result": result })
            }
            AgentEvent::ToolFailed { id, error } => {
                serde_json::json!({ "id": id, "error": error })
            }
            AgentEvent::PermissionRequest { request_id, tool_name, tool_input } => {
                serde_json::json!({ "request_id": request_id, "tool_name": tool_name, "tool_input": tool_input })
            }
            AgentEvent::System { payload } => payload.clone(),
            AgentEvent::PromptSuggestions { suggestions } => {
                serde_json::json!({ "suggestions": suggestions })
            }
        }
    }
}

/// A lazy, single-consumer sequence of agent events plus the side channels
/// a Stream Runtime needs: cost accounting and context-window usage.
///
/// `cancel` must be safe to call at any time, including after the sequence
/// has already been exhausted, and is idempotent.
#[async_trait]
pub trait AgentRunner: Send {
    /// Pull the next event, or `None` when the agent has finished speaking.
    async fn next_event(&mut self) -> Result<Option<AgentEvent>>;

    /// Request the underlying agent process stop producing events. Idempotent.
    async fn cancel(&self);

    /// Cumulative cost of this run so far, in US dollars.
    async fn total_cost_usd(&self) -> f64;

    /// Current context-window token usage for `session_id`, if the agent
    /// can report one yet.
    async fn context_token_usage(&self, session_id: &str) -> Option<u64>;

    /// The session identifier the agent has assigned, once known. Consulted
    /// by the context-usage refresher, which cannot start polling before a
    /// session exists.
    fn session_id(&self) -> Option<String>;
}

/// Opaque sandbox lifecycle, out of scope beyond this contract per §1.
#[async_trait]
pub trait SandboxService: Send + Sync {
    async fn create(&self, user_id: &str) -> Result<String>;
    async fn attach(&self, sandbox_id: &str) -> Result<()>;
    async fn create_checkpoint(&self, sandbox_id: &str, message_id: &str) -> Result<Option<String>>;
    async fn delete(&self, sandbox_id: &str) -> Result<()>;
}

/// Everything needed to hand a prompt to the agent collaborator and get
/// back a fresh [`AgentRunner`]. Used both by the HTTP entry point (a
/// user-submitted turn) and by the Stream Runtime's queue-drain handoff
/// (§2.1.K) so the two call sites build runners identically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpawnRequest {
    pub chat_id: String,
    pub sandbox_id: Option<String>,
    pub session_id: Option<String>,
    pub prompt: String,
    pub model_id: String,
    pub permission_mode: String,
    pub thinking_mode: Option<String>,
    pub attachments: Option<Value>,
}

/// Factory for [`AgentRunner`] instances (§2.1.K): a runner is single-use
/// and consumed over the lifetime of one stream, so starting a new turn —
/// whether user-submitted or a drained follow-up — always goes through
/// this seam rather than reusing a finished runner.
#[async_trait]
pub trait AgentRunnerFactory: Send + Sync {
    async fn spawn(&self, req: AgentSpawnRequest) -> Result<Box<dyn AgentRunner>>;
}
