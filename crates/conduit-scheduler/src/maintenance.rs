//! Maintenance Loop (§4.J): three independently-paced background jobs
//! started on boot and stopped on shutdown. Each job is its own task with
//! its own `tokio::time::interval`, so a slow scheduler tick never delays
//! token cleanup or sandbox GC — but within a single job, ticks never
//! overlap, since the next `interval.tick()` cannot resolve until the
//! previous call to the job body has returned.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use conduit_runtime::RuntimeHandles;

use crate::dispatch;
use crate::hooks::{SandboxGc, TokenCleanup};
use crate::next_fire::compute_next_after_fire;

/// Tracks scheduled-task ids this process is currently dispatching, so the
/// recovery sweep never reaps a task its own worker is still running.
#[derive(Default)]
struct InFlight(Mutex<HashSet<Uuid>>);

impl InFlight {
    fn insert(&self, id: Uuid) {
        self.0.lock().unwrap().insert(id);
    }

    fn remove(&self, id: Uuid) {
        self.0.lock().unwrap().remove(&id);
    }

    fn snapshot(&self) -> Vec<Uuid> {
        self.0.lock().unwrap().iter().copied().collect()
    }
}

pub struct MaintenanceConfig {
    pub tick_secs: u64,
    pub claim_limit: i64,
    pub execution_stale_secs: i64,
    pub token_cleanup_secs: u64,
    pub sandbox_gc_secs: u64,
}

impl From<&conduit_core::config::SchedulerConfig> for MaintenanceConfig {
    fn from(c: &conduit_core::config::SchedulerConfig) -> Self {
        Self {
            tick_secs: c.tick_secs,
            claim_limit: c.claim_limit,
            execution_stale_secs: c.execution_stale_secs,
            token_cleanup_secs: c.token_cleanup_secs,
            sandbox_gc_secs: c.sandbox_gc_secs,
        }
    }
}

/// Spawns the three jobs and returns their join handles so the caller can
/// await them (with a grace timeout) during shutdown, mirroring how the
/// Stream Runtime's background registry is drained.
pub fn spawn(
    handles: RuntimeHandles,
    config: MaintenanceConfig,
    token_cleanup: Arc<dyn TokenCleanup>,
    sandbox_gc: Arc<dyn SandboxGc>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let in_flight = Arc::new(InFlight::default());

    let scheduler_handles = handles.clone();
    let scheduler_in_flight = in_flight.clone();
    let scheduler_shutdown = shutdown.clone();
    let scheduler_job = tokio::spawn(scheduler_tick_loop(
        scheduler_handles,
        scheduler_in_flight,
        config.tick_secs,
        config.claim_limit,
        config.execution_stale_secs,
        scheduler_shutdown,
    ));

    let token_shutdown = shutdown.clone();
    let token_job = tokio::spawn(token_cleanup_loop(token_cleanup, config.token_cleanup_secs, token_shutdown));

    let sandbox_job = tokio::spawn(sandbox_gc_loop(sandbox_gc, config.sandbox_gc_secs, shutdown));

    vec![scheduler_job, token_job, sandbox_job]
}

async fn scheduler_tick_loop(
    handles: RuntimeHandles,
    in_flight: Arc<InFlight>,
    tick_secs: u64,
    claim_limit: i64,
    execution_stale_secs: i64,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(tick_secs, "scheduler tick loop started");
    let mut interval = tokio::time::interval(Duration::from_secs(tick_secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_scheduler_tick(&handles, &in_flight, claim_limit, execution_stale_secs).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("scheduler tick loop shutting down");
                    break;
                }
            }
        }
    }
}

async fn run_scheduler_tick(handles: &RuntimeHandles, in_flight: &Arc<InFlight>, claim_limit: i64, execution_stale_secs: i64) {
    let now = Utc::now();
    let claimed = match handles.store.claim_due_tasks(claim_limit, |task| compute_next_after_fire(task, now).map(|dt| dt.to_rfc3339())) {
        Ok(claimed) => claimed,
        Err(e) => {
            error!(error = %e, "check_due_tasks failed");
            Vec::new()
        }
    };

    for (task, execution) in claimed {
        let task_id = task.id;
        in_flight.insert(task_id);
        let dispatch_handles = handles.clone();
        let dispatch_in_flight = in_flight.clone();
        tokio::spawn(async move {
            dispatch::dispatch(dispatch_handles, task, execution).await;
            dispatch_in_flight.remove(task_id);
        });
    }

    match handles.store.reap_stale_executions(execution_stale_secs, &in_flight.snapshot()) {
        Ok(0) => {}
        Ok(n) => warn!(count = n, "reaped stale scheduled-task executions"),
        Err(e) => error!(error = %e, "reap_stale_executions failed"),
    }
}

async fn token_cleanup_loop(hooks: Arc<dyn TokenCleanup>, interval_secs: u64, mut shutdown: watch::Receiver<bool>) {
    info!(interval_secs, "token cleanup loop started");
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match hooks.cleanup_expired_tokens().await {
                    Ok(n) => info!(removed = n, "refresh-token cleanup completed"),
                    Err(e) => error!(error = %e, "refresh-token cleanup failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("token cleanup loop shutting down");
                    break;
                }
            }
        }
    }
}

async fn sandbox_gc_loop(hooks: Arc<dyn SandboxGc>, interval_secs: u64, mut shutdown: watch::Receiver<bool>) {
    info!(interval_secs, "sandbox gc loop started");
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match hooks.collect_orphaned_sandboxes().await {
                    Ok(n) => info!(collected = n, "orphaned-sandbox gc completed"),
                    Err(e) => error!(error = %e, "orphaned-sandbox gc failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("sandbox gc loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_tracks_membership() {
        let set = InFlight::default();
        let id = Uuid::now_v7();
        set.insert(id);
        assert_eq!(set.snapshot(), vec![id]);
        set.remove(id);
        assert!(set.snapshot().is_empty());
    }
}
