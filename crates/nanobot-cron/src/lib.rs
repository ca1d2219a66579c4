//! Nanobot cron — persistent timed-job scheduler.
//!
//! - [`types`] — schedule, payload, job state, and the on-disk job store.
//! - [`service::CronService`] — the async timer loop and job lifecycle.

pub mod service;
pub mod types;

pub use service::{CronService, OnJobFn};
pub use types::{
    compute_next_run_from, CronJob, CronJobState, CronKind, CronPayload, CronSchedule,
    CronStore, JobStatus, ScheduleKind,
};
