use thiserror::Error;

/// Errors raised by the Stream Runtime and its in-process registries.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("a stream is already active for message {0}")]
    AlreadyStreaming(String),

    #[error(transparent)]
    Store(#[from] conduit_store::StoreError),

    #[error(transparent)]
    Bus(#[from] conduit_bus::BusError),

    #[error(transparent)]
    Agent(#[from] conduit_core::CoreError),
}

impl RuntimeError {
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::AlreadyStreaming(_) => "conflict",
            RuntimeError::Store(e) => e.code(),
            RuntimeError::Bus(e) => e.code(),
            RuntimeError::Agent(e) => e.code(),
        }
    }
}

impl From<RuntimeError> for conduit_core::CoreError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::AlreadyStreaming(id) => conduit_core::CoreError::Conflict(format!(
                "a stream is already active for message {id}"
            )),
            RuntimeError::Store(e) => e.into(),
            RuntimeError::Bus(e) => e.into(),
            RuntimeError::Agent(e) => e,
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
