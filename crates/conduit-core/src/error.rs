use thiserror::Error;

/// Error taxonomy shared across the substrate, kind-based rather than
/// type-based so every crate's errors map onto the same HTTP surface.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Machine-readable error code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "config_error",
            CoreError::NotFound(_) => "not_found",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::Validation(_) => "validation",
            CoreError::Conflict(_) => "conflict",
            CoreError::Unavailable(_) => "unavailable",
            CoreError::Internal(_) => "internal",
        }
    }

    /// Conventional HTTP status for this error kind.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Config(_) => 500,
            CoreError::NotFound(_) => 404,
            CoreError::Forbidden(_) => 403,
            CoreError::Validation(_) => 422,
            CoreError::Conflict(_) => 409,
            CoreError::Unavailable(_) => 503,
            CoreError::Internal(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
