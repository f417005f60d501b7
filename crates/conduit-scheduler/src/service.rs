//! Scheduled-task CRUD and toggle (§4.I), the half of the component that
//! has nothing to do with claiming or dispatch: compute `next_fire_time` on
//! create/update/resume and delegate persistence to `conduit-store`.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use conduit_store::{ScheduledTask, Store, TaskSpec, TaskStatus};

use crate::error::Result;
use crate::next_fire::compute_next_fire;

#[derive(Clone)]
pub struct SchedulerService {
    store: Arc<Store>,
}

impl SchedulerService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn create_task(&self, user_id: &str, spec: TaskSpec) -> Result<ScheduledTask> {
        let next = compute_next_fire(spec.recurrence, &spec.scheduled_time, spec.scheduled_day, &spec.timezone, Utc::now(), true)?
            .map(|dt| dt.to_rfc3339());
        Ok(self.store.create_scheduled_task(user_id, spec, next)?)
    }

    pub fn get_task(&self, task_id: Uuid) -> Result<ScheduledTask> {
        Ok(self.store.get_scheduled_task(task_id)?)
    }

    pub fn list_tasks(&self, user_id: &str) -> Result<Vec<ScheduledTask>> {
        Ok(self.store.list_scheduled_tasks(user_id)?)
    }

    pub fn update_task(&self, task_id: Uuid, spec: TaskSpec) -> Result<ScheduledTask> {
        let next = compute_next_fire(spec.recurrence, &spec.scheduled_time, spec.scheduled_day, &spec.timezone, Utc::now(), true)?
            .map(|dt| dt.to_rfc3339());
        Ok(self.store.update_scheduled_task(task_id, spec, next)?)
    }

    pub fn pause_task(&self, task_id: Uuid) -> Result<ScheduledTask> {
        Ok(self.store.set_task_status(task_id, TaskStatus::Paused)?)
    }

    /// Re-activate a paused task. If its `next_fire_time` already elapsed
    /// while paused, recompute it from "now" rather than dispatching a
    /// backlog of missed runs.
    pub fn resume_task(&self, task_id: Uuid) -> Result<ScheduledTask> {
        let task = self.store.get_scheduled_task(task_id)?;
        let now = Utc::now();
        let already_due = task
            .next_fire_time
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc) <= now)
            .unwrap_or(true);

        let next_fire_time = if already_due {
            compute_next_fire(task.recurrence, &task.scheduled_time, task.scheduled_day, &task.timezone, now, true)?
                .map(|dt| dt.to_rfc3339())
        } else {
            task.next_fire_time.clone()
        };

        Ok(self.store.rearm_task(task_id, next_fire_time, TaskStatus::Active)?)
    }

    pub fn delete_task(&self, task_id: Uuid) -> Result<()> {
        Ok(self.store.delete_scheduled_task(task_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_store::Recurrence;

    fn spec() -> TaskSpec {
        TaskSpec {
            task_name: "weekly digest".into(),
            prompt_message: "summarize the week".into(),
            recurrence: Recurrence::Daily,
            scheduled_time: "09:00:00".into(),
            scheduled_day: None,
            timezone: "UTC".into(),
            model_id: "model-a".into(),
        }
    }

    #[test]
    fn create_populates_next_fire_time() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let svc = SchedulerService::new(store);
        let task = svc.create_task("u1", spec()).unwrap();
        assert!(task.next_fire_time.is_some());
    }

    #[test]
    fn pause_then_resume_round_trips_status() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let svc = SchedulerService::new(store);
        let task = svc.create_task("u1", spec()).unwrap();

        let paused = svc.pause_task(task.id).unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);

        let resumed = svc.resume_task(task.id).unwrap();
        assert_eq!(resumed.status, TaskStatus::Active);
        assert!(resumed.next_fire_time.is_some());
    }

    #[test]
    fn invalid_weekly_day_is_rejected_before_persistence() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let svc = SchedulerService::new(store);
        let mut bad = spec();
        bad.recurrence = Recurrence::Weekly;
        bad.scheduled_day = Some(9);
        let err = svc.create_task("u1", bad).unwrap_err();
        assert_eq!(err.code(), "validation");
    }
}
