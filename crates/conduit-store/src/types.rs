//! Data model (spec §3): Chat owns Message owns MessageEvent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    InProgress,
    Completed,
    Interrupted,
    Failed,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::InProgress => "in_progress",
            StreamStatus::Completed => "completed",
            StreamStatus::Interrupted => "interrupted",
            StreamStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(StreamStatus::InProgress),
            "completed" => Some(StreamStatus::Completed),
            "interrupted" => Some(StreamStatus::Interrupted),
            "failed" => Some(StreamStatus::Failed),
            _ => None,
        }
    }

    /// Terminal statuses never revert (§3 invariant, §8.4).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamStatus::InProgress)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: Uuid,
    pub user_id: String,
    pub sandbox_id: Option<String>,
    pub session_id: Option<String>,
    pub last_event_seq: i64,
    pub context_token_usage: Option<Value>,
    pub deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// The coalesced per-message render state a client needs to draw the
/// message without replaying the log (§3, §6 "Persisted shapes").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRender {
    pub events: Vec<Value>,
    /// Reserved for future use; always empty on write (§9 open question b).
    #[serde(default)]
    pub segments: Vec<Value>,
}

impl Default for ContentRender {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            segments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub role: Role,
    pub content_text: String,
    pub content_render: ContentRender,
    pub last_seq: i64,
    pub active_stream_id: Option<Uuid>,
    pub stream_status: StreamStatus,
    pub total_cost_usd: Option<f64>,
    pub checkpoint_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub message_id: Uuid,
    pub stream_id: Uuid,
    pub seq: i64,
    pub event_type: String,
    pub render_payload: Value,
    pub audit_payload: Option<Value>,
    pub created_at: String,
}

/// One event queued for a batched `append_batch` call (§4.A, §4.G.3).
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub event_type: String,
    pub render_payload: Value,
    pub audit_payload: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    Once,
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recurrence::Once => "once",
            Recurrence::Daily => "daily",
            Recurrence::Weekly => "weekly",
            Recurrence::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "once" => Some(Recurrence::Once),
            "daily" => Some(Recurrence::Daily),
            "weekly" => Some(Recurrence::Weekly),
            "monthly" => Some(Recurrence::Monthly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Pending,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Pending => "pending",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TaskStatus::Active),
            "paused" => Some(TaskStatus::Paused),
            "pending" => Some(TaskStatus::Pending),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ExecutionStatus::Running),
            "success" => Some(ExecutionStatus::Success),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

/// A scheduled task (§3, §4.I): `scheduled_time` is `HH:MM[:SS]` interpreted
/// in `timezone`; `scheduled_day` is the ISO weekday (0=Monday) for `Weekly`
/// or the day-of-month (1-31, clamped) for `Monthly`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub user_id: String,
    pub task_name: String,
    pub prompt_message: String,
    pub recurrence: Recurrence,
    pub scheduled_time: String,
    pub scheduled_day: Option<i64>,
    pub timezone: String,
    pub model_id: String,
    pub next_fire_time: Option<String>,
    pub status: TaskStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: ExecutionStatus,
    pub executed_at: String,
    pub completed_at: Option<String>,
    pub chat_id: Option<Uuid>,
    pub error_message: Option<String>,
}

/// Fields accepted by `create_scheduled_task`/`update_scheduled_task` (§4.I).
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_name: String,
    pub prompt_message: String,
    pub recurrence: Recurrence,
    pub scheduled_time: String,
    pub scheduled_day: Option<i64>,
    pub timezone: String,
    pub model_id: String,
}

/// Fields `update_snapshot` may touch (§4.B); only `Some` fields are written,
/// except `last_seq` which is always compared against the stored value.
#[derive(Debug, Clone, Default)]
pub struct SnapshotUpdate {
    pub content_text: Option<String>,
    pub content_render: Option<ContentRender>,
    pub last_seq: i64,
    pub active_stream_id: Option<Option<Uuid>>,
    pub stream_status: Option<StreamStatus>,
    pub total_cost_usd: Option<f64>,
    pub checkpoint_id: Option<String>,
}
