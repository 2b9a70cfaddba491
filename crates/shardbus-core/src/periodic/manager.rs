//! Task scheduler
//!
//! Holds the pending tasks ordered by fire time. A single loop sleeps until
//! the earliest one is due (or a new task is added) and hands due tasks to
//! the [`Executioner`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::executioner::Executioner;
use super::locker::{run_locked, Locker};
use super::task::{Task, TaskFuture};
use super::types::{now, Result};
use crate::config::PeriodicConfig;

/// Longest single sleep of the loop; far deadlines are re-checked after it
const MAX_WAIT: Duration = Duration::from_secs(60);

/// Pending tasks, ascending by fire time, plus the wake signal for the loop
#[derive(Default)]
pub(crate) struct Pending {
    tasks: Mutex<Vec<Task>>,
    wake: Notify,
}

impl Pending {
    /// Sorted insert; tasks with equal times keep insertion order
    pub(crate) fn insert(&self, task: Task) {
        {
            let mut tasks = lock_unpoisoned(&self.tasks);
            let index = tasks.partition_point(|other| other.at_time() <= task.at_time());
            tasks.insert(index, task);
        }
        self.wake.notify_one();
    }

    fn next(&self, now: f64) -> Next {
        let mut tasks = lock_unpoisoned(&self.tasks);
        match tasks.first() {
            None => Next::Idle,
            Some(task) if task.at_time() <= now => Next::Due(tasks.remove(0)),
            Some(task) => Next::Wait(task.at_time() - now),
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock_unpoisoned(&self.tasks).len()
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<Task> {
        lock_unpoisoned(&self.tasks).clone()
    }
}

enum Next {
    Idle,
    Due(Task),
    Wait(f64),
}

/// Periodic task scheduler
pub struct TaskScheduler {
    pending: Arc<Pending>,
    locker: Arc<dyn Locker>,
    executioner: Arc<Executioner>,
    cancel: CancellationToken,
    stopped: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Spawn the scheduler loop and its executioner on the current runtime
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn start(locker: Arc<dyn Locker>, config: &PeriodicConfig) -> Result<Self> {
        config.validate()?;

        let pending = Arc::new(Pending::default());
        let executioner = Arc::new(Executioner::spawn(
            config.queue_capacity,
            locker.clone(),
            pending.clone(),
        ));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run(pending.clone(), executioner.clone(), cancel.clone()));

        info!(queue_capacity = config.queue_capacity, "Task scheduler started");
        Ok(Self {
            pending,
            locker,
            executioner,
            cancel,
            stopped: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Schedule `task` and wake the loop
    pub fn add_task(&self, task: Task) {
        debug!(task = %task.name(), at = task.at_time(), "Task scheduled");
        self.pending.insert(task);
    }

    /// Run `work` only if the locker grants the `(name, at)` occurrence
    pub async fn lock(&self, name: &str, at: f64, work: TaskFuture) -> Result<bool> {
        run_locked(self.locker.as_ref(), name, at, work).await
    }

    /// Whether no task is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pending tasks
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Stop the loop, then let the executioner finish queued tasks. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        let worker = lock_unpoisoned(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Scheduler loop failed");
            }
        }
        self.executioner.stop().await;
        info!("Task scheduler stopped");
    }
}

async fn run(pending: Arc<Pending>, executioner: Arc<Executioner>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        match pending.next(now()) {
            Next::Due(task) => {
                trace!(task = %task.name(), at = task.at_time(), "Task due");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    submitted = executioner.submit(task) => {
                        if submitted.is_err() {
                            break;
                        }
                    }
                }
            }
            Next::Idle => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = pending.wake.notified() => {}
                }
            }
            Next::Wait(seconds) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = pending.wake.notified() => {}
                    _ = tokio::time::sleep(wait_for(seconds)) => {}
                }
            }
        }
    }
    debug!("Scheduler loop exited");
}

/// Sleep length for a deadline `seconds` away, capped at [`MAX_WAIT`]
fn wait_for(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0))
        .unwrap_or(MAX_WAIT)
        .min(MAX_WAIT)
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
