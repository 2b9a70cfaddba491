//! Executioner: runs due tasks one at a time, off the scheduler loop
//!
//! A slow or failing task body never delays the scheduler beyond the
//! bounded queue filling up.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::locker::Locker;
use super::manager::Pending;
use super::task::Task;
use super::types::{PeriodicError, Result};

/// Bounded task queue plus the worker draining it
pub struct Executioner {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Executioner {
    /// Spawn the worker. Successors of executed tasks go back to `pending`.
    pub(crate) fn spawn(capacity: usize, locker: Arc<dyn Locker>, pending: Arc<Pending>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(work(receiver, locker, pending));
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue `task`, waiting while the queue is full
    ///
    /// # Errors
    ///
    /// Returns [`PeriodicError::Stopped`] once [`stop`](Self::stop) was called
    pub async fn submit(&self, task: Task) -> Result<()> {
        let sender = lock_unpoisoned(&self.sender).clone();
        let Some(sender) = sender else {
            return Err(PeriodicError::Stopped);
        };
        sender.send(task).await.map_err(|_| PeriodicError::Stopped)
    }

    /// Close the queue and wait for queued tasks to finish. Idempotent.
    pub async fn stop(&self) {
        drop(lock_unpoisoned(&self.sender).take());
        let worker = lock_unpoisoned(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Executioner worker failed");
            }
        }
    }
}

async fn work(mut receiver: mpsc::Receiver<Task>, locker: Arc<dyn Locker>, pending: Arc<Pending>) {
    while let Some(task) = receiver.recv().await {
        let successor = task.successor();
        let name = task.name().to_string();
        let at = task.at_time();

        // Separate task so a panicking body is contained
        let locker = locker.clone();
        let run = tokio::spawn(async move { task.execute(locker.as_ref()).await });
        match run.await {
            Ok(Ok(())) => debug!(task = %name, at, "Task done"),
            Ok(Err(e)) => warn!(task = %name, at, error = %e, "Task failed"),
            Err(e) if e.is_panic() => error!(task = %name, at, "Task panicked"),
            Err(e) => error!(task = %name, at, error = %e, "Task aborted"),
        }

        if let Some(next) = successor {
            pending.insert(next);
        }
    }
    debug!("Executioner drained");
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::periodic::locker::NoneLocker;
    use crate::periodic::task::{task_fn, Schedule};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_task(name: &str, schedule: Schedule, counter: Arc<AtomicUsize>) -> Task {
        let body = task_fn(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        Task::at(name, 0.0, false, schedule, body).unwrap()
    }

    async fn explode() -> Result<()> {
        panic!("task blew up")
    }

    #[tokio::test]
    async fn test_runs_tasks_and_requeues_successors() {
        let pending = Arc::new(Pending::default());
        let executioner = Executioner::spawn(10, Arc::new(NoneLocker), pending.clone());
        let counter = Arc::new(AtomicUsize::new(0));

        executioner
            .submit(counting_task("once", Schedule::Once, counter.clone()))
            .await
            .unwrap();
        executioner
            .submit(counting_task("tick", Schedule::every(5.0).unwrap(), counter.clone()))
            .await
            .unwrap();
        executioner.stop().await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        let queued = pending.snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].name(), "tick");
        assert_eq!(queued[0].at_time(), 5.0);
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_contained() {
        let pending = Arc::new(Pending::default());
        let executioner = Executioner::spawn(10, Arc::new(NoneLocker), pending.clone());
        let counter = Arc::new(AtomicUsize::new(0));

        let failing = Task::at(
            "failing",
            0.0,
            false,
            Schedule::every(1.0).unwrap(),
            task_fn(|| async { Err(PeriodicError::Task("boom".to_string())) }),
        )
        .unwrap();
        let panicking = Task::at(
            "panicking",
            0.0,
            false,
            Schedule::Once,
            task_fn(explode),
        )
        .unwrap();

        executioner.submit(failing).await.unwrap();
        executioner.submit(panicking).await.unwrap();
        executioner
            .submit(counting_task("after", Schedule::Once, counter.clone()))
            .await
            .unwrap();
        executioner.stop().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        // The failed repeating task still has its next occurrence queued
        assert_eq!(pending.snapshot()[0].name(), "failing");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_rejects_submissions() {
        let pending = Arc::new(Pending::default());
        let executioner = Executioner::spawn(10, Arc::new(NoneLocker), pending);

        tokio::time::timeout(Duration::from_secs(2), executioner.stop())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), executioner.stop())
            .await
            .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        assert!(matches!(
            executioner
                .submit(counting_task("late", Schedule::Once, counter))
                .await,
            Err(PeriodicError::Stopped)
        ));
    }
}
