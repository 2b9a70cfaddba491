//! Periodic tasks
//!
//! A [`Task`] is one scheduled occurrence: a name, a fire time and a body.
//! After it runs, [`Task::successor`] yields the next occurrence for
//! repeating schedules.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use super::locker::{run_locked, Locker};
use super::types::{datetime, now, timestamp, PeriodicError, Result};

/// Future returned by a task body
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Task body; called once per occurrence
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Wrap an async closure as a [`TaskFn`]
pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// When a task repeats
#[derive(Clone)]
pub enum Schedule {
    /// Fires once
    Once,
    /// Fires every `period` seconds, aligned on the unix epoch
    Every(f64),
    /// Fires on every match of a cron expression, evaluated in UTC
    Cron {
        /// Expression as given
        expression: String,
        /// Parsed form
        schedule: Box<cron::Schedule>,
    },
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Once => write!(f, "Once"),
            Self::Every(period) => write!(f, "Every({}s)", period),
            Self::Cron { expression, .. } => write!(f, "Cron({})", expression),
        }
    }
}

impl Schedule {
    /// Parse a cron expression.
    ///
    /// Five fields (`min hour dom mon dow`, day-of-week `0`/`7` = Sunday) and
    /// six or seven fields (leading seconds, optional trailing year) are accepted.
    pub fn cron(expression: &str) -> Result<Self> {
        let normalized = normalize_cron(expression);
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| PeriodicError::InvalidCron {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self::Cron {
            expression: expression.to_string(),
            schedule: Box::new(schedule),
        })
    }

    /// Validate an interval
    pub fn every(period: f64) -> Result<Self> {
        if !(period.is_finite() && period > 0.0) {
            return Err(PeriodicError::InvalidPeriod(period));
        }
        Ok(Self::Every(period))
    }

    /// First fire time at or after `now`
    fn first(&self, now: f64) -> Option<f64> {
        match self {
            Self::Once => Some(now),
            Self::Every(period) => Some(now - now % period + period),
            Self::Cron { .. } => self.next_after(now),
        }
    }

    /// Fire time following `at`, if the schedule repeats
    fn next_after(&self, at: f64) -> Option<f64> {
        match self {
            Self::Once => None,
            Self::Every(period) => Some(at + period),
            Self::Cron { schedule, .. } => {
                let from = datetime(at)?;
                schedule.after(&from).next().map(timestamp)
            }
        }
    }
}

/// One scheduled occurrence
#[derive(Clone)]
pub struct Task {
    name: String,
    at: f64,
    per_service: bool,
    schedule: Schedule,
    body: TaskFn,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("at", &self.at)
            .field("per_service", &self.per_service)
            .field("schedule", &self.schedule)
            .finish()
    }
}

impl Task {
    /// Task firing on every match of `expression`
    ///
    /// # Errors
    ///
    /// Returns [`PeriodicError::InvalidCron`] for unparseable expressions, or when
    /// the expression never matches again
    pub fn cron(
        name: impl Into<String>,
        expression: &str,
        per_service: bool,
        body: TaskFn,
    ) -> Result<Self> {
        let schedule = Schedule::cron(expression)?;
        let at = schedule
            .first(now())
            .ok_or_else(|| PeriodicError::InvalidCron {
                expression: expression.to_string(),
                message: "no upcoming match".to_string(),
            })?;
        Self::at(name, at, per_service, schedule, body)
    }

    /// Task firing every `period` seconds, starting at the next multiple of
    /// `period` since the epoch
    pub fn every(
        name: impl Into<String>,
        period: f64,
        per_service: bool,
        body: TaskFn,
    ) -> Result<Self> {
        let schedule = Schedule::every(period)?;
        let at = schedule
            .first(now())
            .ok_or(PeriodicError::InvalidPeriod(period))?;
        Self::at(name, at, per_service, schedule, body)
    }

    /// Task firing once, `delay` seconds from now, on every instance
    ///
    /// # Errors
    ///
    /// Returns [`PeriodicError::InvalidTime`] when `delay` is not finite
    pub fn run_once(name: impl Into<String>, delay: f64, body: TaskFn) -> Result<Self> {
        if !delay.is_finite() {
            return Err(PeriodicError::InvalidTime(delay));
        }
        Self::at(name, now() + delay.max(0.0), false, Schedule::Once, body)
    }

    /// Task with an explicit first fire time
    ///
    /// # Errors
    ///
    /// Returns [`PeriodicError::InvalidTime`] when `at` is NaN or infinite
    pub fn at(
        name: impl Into<String>,
        at: f64,
        per_service: bool,
        schedule: Schedule,
        body: TaskFn,
    ) -> Result<Self> {
        if !at.is_finite() {
            return Err(PeriodicError::InvalidTime(at));
        }
        // One-shot tasks run locally by definition
        let per_service = per_service && !matches!(schedule, Schedule::Once);
        Ok(Self {
            name: name.into(),
            at,
            per_service,
            schedule,
            body,
        })
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire time, unix seconds
    pub fn at_time(&self) -> f64 {
        self.at
    }

    /// Whether one instance of the service runs each occurrence
    pub fn per_service(&self) -> bool {
        self.per_service
    }

    /// Repeat rule
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Next occurrence of this task, `None` for one-shot tasks
    pub fn successor(&self) -> Option<Task> {
        let at = self
            .schedule
            .next_after(self.at)
            .filter(|at| at.is_finite())?;
        Some(Self {
            name: self.name.clone(),
            at,
            per_service: self.per_service,
            schedule: self.schedule.clone(),
            body: self.body.clone(),
        })
    }

    /// Run the body, through `locker` for per-service tasks
    pub async fn execute(&self, locker: &dyn Locker) -> Result<()> {
        let work = (self.body)();
        if self.per_service {
            if !run_locked(locker, &self.name, self.at, work).await? {
                debug!(task = %self.name, at = self.at, "Occurrence claimed elsewhere");
            }
            Ok(())
        } else {
            work.await
        }
    }
}

/// Expand five-field expressions to the seconds-first form, translating
/// numeric weekdays (`0`/`7` = Sunday) to names
fn normalize_cron(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return fields.join(" ");
    }
    let weekdays = weekday_names(fields[4]);
    format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], weekdays
    )
}

fn weekday_names(field: &str) -> String {
    const NAMES: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];
    let name = |part: &str| match part.parse::<usize>() {
        Ok(n) if n < NAMES.len() => NAMES[n].to_string(),
        _ => part.to_string(),
    };

    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let range = range.split('-').map(name).collect::<Vec<_>>().join("-");
            match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TaskFn {
        task_fn(|| async { Ok(()) })
    }

    #[test]
    fn test_normalize_five_fields() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("0 9 * * 1-5"), "0 0 9 * * MON-FRI");
        assert_eq!(normalize_cron("0 0 * * 0,7"), "0 0 0 * * SUN,SUN");
        assert_eq!(normalize_cron("0 0 * * */2"), "0 0 0 * * */2");
        assert_eq!(normalize_cron("30 0 9 * * *"), "30 0 9 * * *");
    }

    #[test]
    fn test_invalid_cron_rejected() {
        assert!(matches!(
            Task::cron("bad", "not a cron", false, noop()),
            Err(PeriodicError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_cron_successor_is_next_match() {
        let schedule = Schedule::cron("*/15 * * * *").unwrap();
        // 2024-01-01T00:07:30Z
        let start = 1_704_067_650.0;
        let task = Task::at("quarterly", start, false, schedule, noop()).unwrap();

        let next = task.successor().unwrap();
        assert_eq!(next.at_time(), 1_704_068_100.0); // 00:15:00
        let after = next.successor().unwrap();
        assert_eq!(after.at_time(), 1_704_069_000.0); // 00:30:00
        assert!(after.at_time() > next.at_time());
    }

    #[test]
    fn test_cron_first_fire_is_in_future() {
        let task = Task::cron("minutely", "* * * * *", false, noop()).unwrap();
        assert!(task.at_time() > now());
        assert_eq!(task.at_time() % 60.0, 0.0);
    }

    #[test]
    fn test_every_aligned_on_epoch() {
        let task = Task::every("tick", 10.0, false, noop()).unwrap();
        assert_eq!(task.at_time() % 10.0, 0.0);
        assert!(task.at_time() > now() - 0.001);
        assert!(task.at_time() <= now() + 10.0);

        let next = task.successor().unwrap();
        assert_eq!(next.at_time(), task.at_time() + 10.0);
        assert_eq!(next.name(), "tick");
    }

    #[test]
    fn test_every_rejects_bad_period() {
        assert!(Task::every("t", 0.0, false, noop()).is_err());
        assert!(Task::every("t", -1.0, false, noop()).is_err());
        assert!(Task::every("t", f64::INFINITY, false, noop()).is_err());
    }

    #[test]
    fn test_run_once_never_per_service_nor_repeats() {
        let task = Task::at("boot", 1.0, true, Schedule::Once, noop()).unwrap();
        assert!(!task.per_service());
        assert!(task.successor().is_none());

        let delayed = Task::run_once("later", 5.0, noop()).unwrap();
        assert!(delayed.at_time() >= now() + 4.9);
    }

    #[test]
    fn test_non_finite_times_rejected() {
        for at in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                Task::at("broken", at, false, Schedule::Once, noop()),
                Err(PeriodicError::InvalidTime(_))
            ));
        }
        assert!(matches!(
            Task::run_once("never", f64::INFINITY, noop()),
            Err(PeriodicError::InvalidTime(_))
        ));
        // Far but finite is accepted
        assert!(Task::run_once("far", 1e20, noop()).is_ok());
    }
}
