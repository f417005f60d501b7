//! Scheduled-task persistence (§3, §4.I): CRUD over `scheduled_tasks`, the
//! claim protocol `check_due_tasks` relies on, and the stale-execution
//! recovery sweep.
//!
//! The reference design claims due rows with `FOR UPDATE SKIP LOCKED` under
//! Postgres; this workspace's storage engine is SQLite, which serialises all
//! writers onto a single connection instead of row-level locking. The claim
//! is made exactly-once by folding "select due rows" and "advance them past
//! due" into one `UPDATE ... RETURNING` statement inside a single
//! transaction — no other writer can observe the pre-claim state because
//! SQLite holds the write lock for the statement's whole duration. Recorded
//! as an Open Question decision in DESIGN.md.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::store::Store;
use crate::types::{ExecutionStatus, Recurrence, ScheduledTask, TaskExecution, TaskSpec, TaskStatus};

impl Store {
    #[instrument(skip(self, spec))]
    pub fn create_scheduled_task(&self, user_id: &str, spec: TaskSpec, next_fire_time: Option<String>) -> Result<ScheduledTask> {
        validate_spec(&spec)?;
        let id = Uuid::now_v7();
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO scheduled_tasks
             (id, user_id, task_name, prompt_message, recurrence, scheduled_time, scheduled_day,
              timezone, model_id, next_fire_time, status, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,'active',?11,?11)",
            params![
                id.to_string(),
                user_id,
                spec.task_name,
                spec.prompt_message,
                spec.recurrence.as_str(),
                spec.scheduled_time,
                spec.scheduled_day,
                spec.timezone,
                spec.model_id,
                next_fire_time,
                now,
            ],
        )?;
        Ok(ScheduledTask {
            id,
            user_id: user_id.to_string(),
            task_name: spec.task_name,
            prompt_message: spec.prompt_message,
            recurrence: spec.recurrence,
            scheduled_time: spec.scheduled_time,
            scheduled_day: spec.scheduled_day,
            timezone: spec.timezone,
            model_id: spec.model_id,
            next_fire_time,
            status: TaskStatus::Active,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    #[instrument(skip(self))]
    pub fn get_scheduled_task(&self, task_id: Uuid) -> Result<ScheduledTask> {
        let db = self.db.lock().unwrap();
        get_task_locked(&db, task_id)
    }

    #[instrument(skip(self))]
    pub fn list_scheduled_tasks(&self, user_id: &str) -> Result<Vec<ScheduledTask>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, task_name, prompt_message, recurrence, scheduled_time, scheduled_day,
                    timezone, model_id, next_fire_time, status, created_at, updated_at
             FROM scheduled_tasks WHERE user_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![user_id], row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Replace the mutable fields of a task and recompute `next_fire_time`
    /// (the caller supplies the recomputed value; this module has no
    /// timezone logic of its own, see `conduit-scheduler`).
    #[instrument(skip(self, spec))]
    pub fn update_scheduled_task(&self, task_id: Uuid, spec: TaskSpec, next_fire_time: Option<String>) -> Result<ScheduledTask> {
        validate_spec(&spec)?;
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE scheduled_tasks SET
                task_name = ?1, prompt_message = ?2, recurrence = ?3, scheduled_time = ?4,
                scheduled_day = ?5, timezone = ?6, model_id = ?7, next_fire_time = ?8, updated_at = ?9
             WHERE id = ?10",
            params![
                spec.task_name,
                spec.prompt_message,
                spec.recurrence.as_str(),
                spec.scheduled_time,
                spec.scheduled_day,
                spec.timezone,
                spec.model_id,
                next_fire_time,
                now,
                task_id.to_string(),
            ],
        )?;
        if n == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        get_task_locked(&db, task_id)
    }

    /// Flip `active`/`paused`. Pausing does not clear `next_fire_time`, so
    /// resuming picks up from wherever it was (re-armed by the caller if
    /// the fire time has already passed).
    #[instrument(skip(self))]
    pub fn set_task_status(&self, task_id: Uuid, status: TaskStatus) -> Result<ScheduledTask> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE scheduled_tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, task_id.to_string()],
        )?;
        if n == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        get_task_locked(&db, task_id)
    }

    /// Set `next_fire_time` and `status` together without touching the rest
    /// of the task's fields — used by `resume_task` to re-arm a paused task
    /// whose fire time has already passed while it was paused.
    #[instrument(skip(self))]
    pub fn rearm_task(&self, task_id: Uuid, next_fire_time: Option<String>, status: TaskStatus) -> Result<ScheduledTask> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE scheduled_tasks SET next_fire_time = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
            params![next_fire_time, status.as_str(), now, task_id.to_string()],
        )?;
        if n == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        get_task_locked(&db, task_id)
    }

    #[instrument(skip(self))]
    pub fn delete_scheduled_task(&self, task_id: Uuid) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![task_id.to_string()])?;
        if n == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    /// Claim protocol (§4.I): atomically select tasks due at or before
    /// `now` and advance them to `pending` with a freshly computed
    /// `next_fire_time`, inserting a `running` `TaskExecution` for each. The
    /// whole operation runs inside one transaction so two concurrent callers
    /// can never claim the same row (§8 property 9).
    ///
    /// `compute_next` receives the task and returns its next fire time (or
    /// `None` to mark the task exhausted) — kept as a callback so this crate
    /// stays free of timezone-recurrence logic.
    #[instrument(skip(self, compute_next))]
    pub fn claim_due_tasks(
        &self,
        limit: i64,
        compute_next: impl Fn(&ScheduledTask) -> Option<String>,
    ) -> Result<Vec<(ScheduledTask, TaskExecution)>> {
        let now = Utc::now().to_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let due: Vec<ScheduledTask> = {
            let mut stmt = tx.prepare(
                "SELECT id, user_id, task_name, prompt_message, recurrence, scheduled_time, scheduled_day,
                        timezone, model_id, next_fire_time, status, created_at, updated_at
                 FROM scheduled_tasks
                 WHERE status = 'active' AND next_fire_time IS NOT NULL AND next_fire_time <= ?1
                 ORDER BY next_fire_time LIMIT ?2",
            )?;
            stmt.query_map(params![now, limit], row_to_task)?.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut claimed = Vec::with_capacity(due.len());
        for task in due {
            let next = compute_next(&task);
            let new_status = TaskStatus::Pending;

            tx.execute(
                "UPDATE scheduled_tasks SET next_fire_time = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
                params![next, new_status.as_str(), now, task.id.to_string()],
            )?;

            let execution_id = Uuid::now_v7();
            tx.execute(
                "INSERT INTO task_executions (id, task_id, status, executed_at, completed_at, chat_id, error_message)
                 VALUES (?1, ?2, 'running', ?3, NULL, NULL, NULL)",
                params![execution_id.to_string(), task.id.to_string(), now],
            )?;

            let execution = TaskExecution {
                id: execution_id,
                task_id: task.id,
                status: ExecutionStatus::Running,
                executed_at: now.clone(),
                completed_at: None,
                chat_id: None,
                error_message: None,
            };
            claimed.push((ScheduledTask { next_fire_time: next, status: new_status, ..task }, execution));
        }

        tx.commit()?;
        Ok(claimed)
    }

    /// Idempotency guard (§4.I supplement): re-read an execution's current
    /// status before a worker begins running the claimed task, so a slow or
    /// retried dispatch can detect that the recovery sweep already reaped it.
    #[instrument(skip(self))]
    pub fn get_execution(&self, execution_id: Uuid) -> Result<TaskExecution> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, task_id, status, executed_at, completed_at, chat_id, error_message
             FROM task_executions WHERE id = ?1",
            params![execution_id.to_string()],
            row_to_execution,
        )
        .optional()?
        .ok_or_else(|| StoreError::ExecutionNotFound(execution_id.to_string()))
    }

    #[instrument(skip(self))]
    pub fn complete_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        chat_id: Option<Uuid>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE task_executions SET status = ?1, completed_at = ?2, chat_id = ?3, error_message = ?4 WHERE id = ?5",
            params![
                status.as_str(),
                now,
                chat_id.map(|c| c.to_string()),
                error_message,
                execution_id.to_string(),
            ],
        )?;
        if n == 0 {
            return Err(StoreError::ExecutionNotFound(execution_id.to_string()));
        }
        Ok(())
    }

    /// Recovery sweep (§4.I): executions stuck in `running` older than
    /// `stale_secs` are reaped to `failed`, and their owning task (if still
    /// `pending`) returns to `active` so the next tick can retry it. Callers
    /// pass the set of `task_id`s this worker believes are genuinely
    /// in-flight so it never reaps its own live work.
    #[instrument(skip(self, locally_in_flight))]
    pub fn reap_stale_executions(&self, stale_secs: i64, locally_in_flight: &[Uuid]) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(stale_secs)).to_rfc3339();
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();

        let mut stmt = db.prepare(
            "SELECT id, task_id FROM task_executions WHERE status = 'running' AND executed_at < ?1",
        )?;
        let rows: Vec<(Uuid, Uuid)> = stmt
            .query_map(params![cutoff], |row| {
                let exec_str: String = row.get(0)?;
                let task_str: String = row.get(1)?;
                Ok((
                    Uuid::parse_str(&exec_str).unwrap_or_default(),
                    Uuid::parse_str(&task_str).unwrap_or_default(),
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut reaped = 0;
        for (execution_id, task_id) in rows {
            if locally_in_flight.contains(&task_id) {
                continue;
            }
            db.execute(
                "UPDATE task_executions SET status = 'failed', completed_at = ?1, error_message = 'reaped: worker died or hung' WHERE id = ?2",
                params![now, execution_id.to_string()],
            )?;
            db.execute(
                "UPDATE scheduled_tasks SET status = 'active', updated_at = ?1 WHERE id = ?2 AND status = 'pending'",
                params![now, task_id.to_string()],
            )?;
            reaped += 1;
        }
        Ok(reaped)
    }
}

fn validate_spec(spec: &TaskSpec) -> Result<()> {
    match spec.recurrence {
        Recurrence::Weekly => match spec.scheduled_day {
            Some(d) if (0..=6).contains(&d) => {}
            _ => return Err(StoreError::Validation("weekly recurrence requires scheduled_day in 0..=6".into())),
        },
        Recurrence::Monthly => match spec.scheduled_day {
            Some(d) if (1..=31).contains(&d) => {}
            _ => return Err(StoreError::Validation("monthly recurrence requires scheduled_day in 1..=31".into())),
        },
        Recurrence::Once | Recurrence::Daily => {}
    }
    Ok(())
}

fn get_task_locked(db: &rusqlite::Connection, task_id: Uuid) -> Result<ScheduledTask> {
    db.query_row(
        "SELECT id, user_id, task_name, prompt_message, recurrence, scheduled_time, scheduled_day,
                timezone, model_id, next_fire_time, status, created_at, updated_at
         FROM scheduled_tasks WHERE id = ?1",
        params![task_id.to_string()],
        row_to_task,
    )
    .optional()?
    .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskExecution> {
    let id_str: String = row.get(0)?;
    let task_str: String = row.get(1)?;
    let status_str: String = row.get(2)?;
    let chat_str: Option<String> = row.get(5)?;
    Ok(TaskExecution {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        task_id: Uuid::parse_str(&task_str).unwrap_or_default(),
        status: ExecutionStatus::parse(&status_str).unwrap_or(ExecutionStatus::Running),
        executed_at: row.get(3)?,
        completed_at: row.get(4)?,
        chat_id: chat_str.and_then(|s| Uuid::parse_str(&s).ok()),
        error_message: row.get(6)?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let id_str: String = row.get(0)?;
    let recurrence_str: String = row.get(4)?;
    let status_str: String = row.get(10)?;
    Ok(ScheduledTask {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        user_id: row.get(1)?,
        task_name: row.get(2)?,
        prompt_message: row.get(3)?,
        recurrence: Recurrence::parse(&recurrence_str).unwrap_or(Recurrence::Once),
        scheduled_time: row.get(5)?,
        scheduled_day: row.get(6)?,
        timezone: row.get(7)?,
        model_id: row.get(8)?,
        next_fire_time: row.get(9)?,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Active),
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(recurrence: Recurrence, day: Option<i64>) -> TaskSpec {
        TaskSpec {
            task_name: "nightly build".into(),
            prompt_message: "run the build".into(),
            recurrence,
            scheduled_time: "09:00:00".into(),
            scheduled_day: day,
            timezone: "UTC".into(),
            model_id: "model-a".into(),
        }
    }

    #[test]
    fn create_and_get_roundtrips() {
        let s = Store::open_in_memory().unwrap();
        let task = s.create_scheduled_task("u1", spec(Recurrence::Daily, None), Some("2026-07-29T09:00:00Z".into())).unwrap();
        let fetched = s.get_scheduled_task(task.id).unwrap();
        assert_eq!(fetched.task_name, "nightly build");
        assert_eq!(fetched.status, TaskStatus::Active);
    }

    #[test]
    fn weekly_without_day_is_rejected() {
        let s = Store::open_in_memory().unwrap();
        let err = s.create_scheduled_task("u1", spec(Recurrence::Weekly, None), None).unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn monthly_day_out_of_range_is_rejected() {
        let s = Store::open_in_memory().unwrap();
        let err = s.create_scheduled_task("u1", spec(Recurrence::Monthly, Some(40)), None).unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn claim_due_tasks_is_exactly_once_under_concurrent_calls() {
        let s = Store::open_in_memory().unwrap();
        let past = (Utc::now() - chrono::Duration::seconds(5)).to_rfc3339();
        s.create_scheduled_task("u1", spec(Recurrence::Once, None), Some(past)).unwrap();

        let first = s.claim_due_tasks(10, |_| None).unwrap();
        let second = s.claim_due_tasks(10, |_| None).unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 0);
        assert_eq!(first[0].0.status, TaskStatus::Pending);
    }

    #[test]
    fn reap_stale_executions_restores_pending_task_to_active() {
        let s = Store::open_in_memory().unwrap();
        let past = (Utc::now() - chrono::Duration::seconds(5)).to_rfc3339();
        s.create_scheduled_task("u1", spec(Recurrence::Daily, None), Some(past)).unwrap();
        let claimed = s.claim_due_tasks(10, |_| Some("2099-01-01T00:00:00Z".into())).unwrap();
        let (task, _execution) = &claimed[0];

        // Backdate the execution row so it looks stale.
        {
            let db = s.db.lock().unwrap();
            db.execute(
                "UPDATE task_executions SET executed_at = ?1 WHERE task_id = ?2",
                params![(Utc::now() - chrono::Duration::seconds(3600)).to_rfc3339(), task.id.to_string()],
            )
            .unwrap();
        }

        let reaped = s.reap_stale_executions(900, &[]).unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(s.get_scheduled_task(task.id).unwrap().status, TaskStatus::Active);
    }

    #[test]
    fn get_execution_roundtrips() {
        let s = Store::open_in_memory().unwrap();
        let past = (Utc::now() - chrono::Duration::seconds(5)).to_rfc3339();
        s.create_scheduled_task("u1", spec(Recurrence::Once, None), Some(past)).unwrap();
        let claimed = s.claim_due_tasks(10, |_| None).unwrap();
        let (_, execution) = &claimed[0];

        let fetched = s.get_execution(execution.id).unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Running);

        s.complete_execution(execution.id, ExecutionStatus::Success, None, None).unwrap();
        assert_eq!(s.get_execution(execution.id).unwrap().status, ExecutionStatus::Success);
    }

    #[test]
    fn reap_skips_locally_in_flight_tasks() {
        let s = Store::open_in_memory().unwrap();
        let past = (Utc::now() - chrono::Duration::seconds(5)).to_rfc3339();
        s.create_scheduled_task("u1", spec(Recurrence::Daily, None), Some(past)).unwrap();
        let claimed = s.claim_due_tasks(10, |_| Some("2099-01-01T00:00:00Z".into())).unwrap();
        let (task, _) = &claimed[0];
        {
            let db = s.db.lock().unwrap();
            db.execute(
                "UPDATE task_executions SET executed_at = ?1 WHERE task_id = ?2",
                params![(Utc::now() - chrono::Duration::seconds(3600)).to_rfc3339(), task.id.to_string()],
            )
            .unwrap();
        }
        let reaped = s.reap_stale_executions(900, &[task.id]).unwrap();
        assert_eq!(reaped, 0);
        assert_eq!(s.get_scheduled_task(task.id).unwrap().status, TaskStatus::Pending);
    }
}
