use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("kv store unavailable: {0}")]
    Unavailable(String),

    #[error("cas retries exhausted for key {0}")]
    CasConflict(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),
}

impl BusError {
    pub fn code(&self) -> &'static str {
        match self {
            BusError::Unavailable(_) | BusError::Redis(_) | BusError::Pool(_) => "unavailable",
            BusError::CasConflict(_) => "conflict",
            BusError::Serde(_) => "internal",
        }
    }
}

impl From<BusError> for conduit_core::CoreError {
    fn from(e: BusError) -> Self {
        match &e {
            BusError::Unavailable(_) | BusError::Redis(_) | BusError::Pool(_) => {
                conduit_core::CoreError::Unavailable(e.to_string())
            }
            BusError::CasConflict(_) => conduit_core::CoreError::Conflict(e.to_string()),
            BusError::Serde(_) => conduit_core::CoreError::Internal(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
