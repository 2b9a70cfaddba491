//! Periodic task scheduling
//!
//! - [`TaskScheduler`]: time-ordered pending list and the loop that wakes on
//!   the earliest deadline
//! - [`Executioner`]: bounded queue and worker running due tasks
//! - [`Task`]: cron, interval and one-shot occurrences
//! - [`Locker`]: decides which instance runs a per-service occurrence
//!
//! # Example
//!
//! ```ignore
//! use shardbus_core::periodic::{task_fn, NoneLocker, Task, TaskScheduler};
//!
//! let scheduler = TaskScheduler::start(Arc::new(NoneLocker), &PeriodicConfig::default())?;
//! scheduler.add_task(Task::cron("cleanup", "0 3 * * *", true, task_fn(|| async {
//!     // ...
//!     Ok(())
//! }))?);
//! ```

mod executioner;
mod locker;
mod manager;
mod task;
mod types;

pub use executioner::Executioner;
pub use locker::{run_locked, Locker, NoneLocker, StoreLocker};
pub use manager::TaskScheduler;
pub use task::{task_fn, Schedule, Task, TaskFn, TaskFuture};
pub use types::{now, PeriodicError, Result};
