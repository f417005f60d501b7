//! HTTP-facing error mapping (§7): every crate's error taxonomy funnels
//! through `conduit_core::CoreError` and lands on the conventional status
//! code from there.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use conduit_core::CoreError;

pub struct ApiError(pub CoreError);

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody { error: self.0.to_string(), code: self.0.code() };
        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl From<conduit_store::StoreError> for ApiError {
    fn from(e: conduit_store::StoreError) -> Self {
        Self(e.into())
    }
}

impl From<conduit_bus::BusError> for ApiError {
    fn from(e: conduit_bus::BusError) -> Self {
        Self(e.into())
    }
}

impl From<conduit_runtime::RuntimeError> for ApiError {
    fn from(e: conduit_runtime::RuntimeError) -> Self {
        Self(e.into())
    }
}

impl From<conduit_scheduler::SchedulerError> for ApiError {
    fn from(e: conduit_scheduler::SchedulerError) -> Self {
        Self(e.into())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
