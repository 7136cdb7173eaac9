//! # StockWatch Scheduler
//!
//! Recurring shortage checks: cron triggers, the per-task execution cycle,
//! change detection and the task stores.
//!
//! ## Architecture
//! ```text
//! Scheduler (tokio interval)
//!   ├── Trigger: "0 8 * * MON-FRI" → task-1a2b
//!   ├── Trigger: "@hourly"         → task-3c4d
//!   └── on firing → TaskExecutor::run(id)
//!                     ├── TaskStore      (tasks.json | SQLite)
//!                     ├── Calculator     (retry + deadline)
//!                     ├── shortage hash  (OnChange tasks)
//!                     └── NotifyChannel  (report / admin escalation)
//! ```

pub mod cron;
pub mod engine;
pub mod executor;
pub mod hash;
pub mod persistence;
pub mod store;

#[cfg(test)]
mod test_support;

pub use cron::{CronSchedule, validate_task};
pub use engine::{ReconcileSummary, Scheduler, SchedulerStats, StatsSnapshot};
pub use executor::{RunOutcome, SkipReason, TaskExecutor};
pub use hash::{ShortageSnapshot, shortage_hash};
pub use persistence::SqliteTaskStore;
pub use store::FileTaskStore;
