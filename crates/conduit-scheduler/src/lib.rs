//! `conduit-scheduler` — the Scheduler (§4.I) and Maintenance Loop (§4.J):
//! per-user-timezone next-fire-time computation, the CRUD/toggle surface
//! over scheduled tasks, and the background jobs that claim due tasks,
//! dispatch them through the Stream Runtime, and sweep token/sandbox debris.

pub mod dispatch;
pub mod error;
pub mod hooks;
pub mod maintenance;
pub mod next_fire;
pub mod service;

pub use error::{Result, SchedulerError};
pub use hooks::{NoopHooks, SandboxGc, TokenCleanup};
pub use maintenance::MaintenanceConfig;
pub use next_fire::{compute_next_after_fire, compute_next_fire, NextFireError};
pub use service::SchedulerService;
