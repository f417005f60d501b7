use thiserror::Error;

/// Errors raised by the durable stores (event log, snapshot, chat/message CRUD).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chat not found: {0}")]
    ChatNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("message {0} already has an active stream")]
    StreamConflict(String),

    #[error("scheduled task not found: {0}")]
    TaskNotFound(String),

    #[error("task execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("invalid recurrence configuration: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::ChatNotFound(_)
            | StoreError::MessageNotFound(_)
            | StoreError::TaskNotFound(_)
            | StoreError::ExecutionNotFound(_) => "not_found",
            StoreError::StreamConflict(_) => "conflict",
            StoreError::Validation(_) => "validation",
            StoreError::Database(_) | StoreError::Serde(_) => "internal",
        }
    }
}

impl From<StoreError> for conduit_core::CoreError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::ChatNotFound(_) | StoreError::MessageNotFound(_) | StoreError::TaskNotFound(_) | StoreError::ExecutionNotFound(_) => {
                conduit_core::CoreError::NotFound(e.to_string())
            }
            StoreError::StreamConflict(_) => conduit_core::CoreError::Conflict(e.to_string()),
            StoreError::Validation(_) => conduit_core::CoreError::Validation(e.to_string()),
            StoreError::Database(_) | StoreError::Serde(_) => {
                conduit_core::CoreError::Internal(e.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
