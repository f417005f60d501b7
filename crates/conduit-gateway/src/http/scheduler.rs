//! Scheduled-task CRUD and toggle (§4.I, §6).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use conduit_core::CoreError;
use conduit_store::{Recurrence, ScheduledTask, TaskSpec};

use crate::error::ApiResult;
use crate::state::{extract_user_id, AppState};

#[derive(Deserialize)]
pub struct TaskBody {
    pub task_name: String,
    pub prompt_message: String,
    pub recurrence: String,
    pub scheduled_time: String,
    #[serde(default)]
    pub scheduled_day: Option<i64>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub model_id: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn parse_spec(body: TaskBody) -> ApiResult<TaskSpec> {
    let recurrence = Recurrence::parse(&body.recurrence)
        .ok_or_else(|| CoreError::Validation(format!("unknown recurrence {}", body.recurrence)))?;
    Ok(TaskSpec {
        task_name: body.task_name,
        prompt_message: body.prompt_message,
        recurrence,
        scheduled_time: body.scheduled_time,
        scheduled_day: body.scheduled_day,
        timezone: body.timezone,
        model_id: body.model_id,
    })
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TaskBody>,
) -> ApiResult<Json<ScheduledTask>> {
    let user_id = extract_user_id(&headers)?;
    let spec = parse_spec(body)?;
    Ok(Json(state.scheduler.create_task(&user_id, spec)?))
}

pub async fn list_tasks(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Json<Vec<ScheduledTask>>> {
    let user_id = extract_user_id(&headers)?;
    Ok(Json(state.scheduler.list_tasks(&user_id)?))
}

async fn authorize(state: &AppState, headers: &HeaderMap, task_id: Uuid) -> ApiResult<ScheduledTask> {
    let user_id = extract_user_id(headers)?;
    let task = state.scheduler.get_task(task_id)?;
    if task.user_id != user_id {
        return Err(CoreError::Forbidden("task belongs to a different user".to_string()).into());
    }
    Ok(task)
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<ScheduledTask>> {
    Ok(Json(authorize(&state, &headers, task_id).await?))
}

pub async fn update_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
    Json(body): Json<TaskBody>,
) -> ApiResult<Json<ScheduledTask>> {
    authorize(&state, &headers, task_id).await?;
    let spec = parse_spec(body)?;
    Ok(Json(state.scheduler.update_task(task_id, spec)?))
}

pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    authorize(&state, &headers, task_id).await?;
    state.scheduler.delete_task(task_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pause_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<ScheduledTask>> {
    authorize(&state, &headers, task_id).await?;
    Ok(Json(state.scheduler.pause_task(task_id)?))
}

pub async fn resume_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<ScheduledTask>> {
    authorize(&state, &headers, task_id).await?;
    Ok(Json(state.scheduler.resume_task(task_id)?))
}
