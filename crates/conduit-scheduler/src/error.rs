use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] conduit_store::StoreError),

    #[error("invalid scheduled_time: {0}")]
    BadTime(String),

    #[error("weekly recurrence requires scheduled_day in 0..=6")]
    BadWeeklyDay,

    #[error("monthly recurrence requires scheduled_day in 1..=31")]
    BadMonthlyDay,
}

impl SchedulerError {
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Store(e) => e.code(),
            SchedulerError::BadTime(_) | SchedulerError::BadWeeklyDay | SchedulerError::BadMonthlyDay => "validation",
        }
    }
}

impl From<crate::next_fire::NextFireError> for SchedulerError {
    fn from(e: crate::next_fire::NextFireError) -> Self {
        match e {
            crate::next_fire::NextFireError::BadTime(t) => SchedulerError::BadTime(t),
            crate::next_fire::NextFireError::BadWeeklyDay => SchedulerError::BadWeeklyDay,
            crate::next_fire::NextFireError::BadMonthlyDay => SchedulerError::BadMonthlyDay,
        }
    }
}

impl From<SchedulerError> for conduit_core::CoreError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Store(store_err) => store_err.into(),
            SchedulerError::BadTime(_) | SchedulerError::BadWeeklyDay | SchedulerError::BadMonthlyDay => {
                conduit_core::CoreError::Validation(e.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
