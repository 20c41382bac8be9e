//! Cron-driven job scheduler.
//!
//! Jobs are declared as a table of (name, cron expression, handler) so
//! tests can invoke handlers directly without waiting on wall-clock
//! timers. Each job runs in its own task: sleep until the next cron
//! occurrence, run the handler under a tick timeout, log any failure,
//! repeat. A tick failure never crashes the process or blocks the job's
//! next tick; distinct jobs run independently and may overlap.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use croner::Cron;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::services::automation::AutomationError;

/// Upper bound on one tick, so a stuck handler cannot stall the job
/// forever.
const TICK_TIMEOUT: Duration = Duration::from_secs(600);

/// Errors raised while building the schedule.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// A job's cron expression failed to parse.
    #[error("invalid cron expression for job '{job}': {message}")]
    InvalidExpression {
        /// Job name from the table.
        job: &'static str,
        /// Parser diagnostic.
        message: String,
    },
}

type Handler = Box<dyn Fn() -> BoxFuture<'static, Result<(), AutomationError>> + Send + Sync>;

/// One entry in the declarative job table.
pub struct JobSpec {
    /// Stable job name used in logs.
    pub name: &'static str,
    /// Five-field cron expression (minute hour day month weekday).
    pub schedule: &'static str,
    handler: Handler,
}

impl JobSpec {
    /// Declare a job.
    pub fn new<F>(name: &'static str, schedule: &'static str, handler: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<(), AutomationError>> + Send + Sync + 'static,
    {
        Self {
            name,
            schedule,
            handler: Box::new(handler),
        }
    }

    /// Run one tick of this job directly (used by tests and the loop).
    ///
    /// # Errors
    ///
    /// Propagates the handler's error.
    pub async fn run(&self) -> Result<(), AutomationError> {
        (self.handler)().await
    }
}

impl std::fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSpec")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

/// Running scheduler; dropping it cancels all job tasks.
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Parse every expression and spawn one task per job.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::InvalidExpression`] before spawning
    /// anything if any expression is malformed.
    pub fn start(jobs: Vec<JobSpec>) -> Result<Self, ScheduleError> {
        let mut parsed = Vec::with_capacity(jobs.len());
        for job in jobs {
            let cron =
                Cron::from_str(job.schedule).map_err(|e| ScheduleError::InvalidExpression {
                    job: job.name,
                    message: e.to_string(),
                })?;
            parsed.push((cron, job));
        }

        let handles = parsed
            .into_iter()
            .map(|(cron, job)| tokio::spawn(run_job_loop(cron, job)))
            .collect();

        Ok(Self { handles })
    }

    /// Cancel all job tasks. Idempotent.
    pub fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_job_loop(cron: Cron, job: JobSpec) {
    tracing::info!(job = job.name, schedule = job.schedule, "Job scheduled");

    loop {
        let next = match cron.find_next_occurrence(&Utc::now(), false) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(job = job.name, error = %e, "No next occurrence, job stopped");
                return;
            }
        };

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        match tokio::time::timeout(TICK_TIMEOUT, job.run()).await {
            Ok(Ok(())) => {
                tracing::debug!(job = job.name, "Tick finished");
            }
            Ok(Err(e)) => {
                tracing::error!(job = job.name, error = %e, "Tick failed");
            }
            Err(_) => {
                tracing::error!(job = job.name, timeout = ?TICK_TIMEOUT, "Tick timed out");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cadence_expressions_parse() {
        for expr in ["0 * * * *", "0 */6 * * *", "*/15 * * * *", "0 2 * * *"] {
            assert!(Cron::from_str(expr).is_ok(), "{expr} should parse");
        }
    }

    #[test]
    fn test_next_occurrence_daily_cleanup() {
        let cron = Cron::from_str("0 2 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let next = cron.find_next_occurrence(&after, false).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 2, 2, 0, 0).unwrap());
    }

    #[test]
    fn test_next_occurrence_quarter_hourly() {
        let cron = Cron::from_str("*/15 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 12, 7, 0).unwrap();
        let next = cron.find_next_occurrence(&after, false).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 12, 15, 0).unwrap());
    }

    #[tokio::test]
    async fn test_job_spec_runs_handler() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let job = JobSpec::new("test-job", "* * * * *", move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        job.run().await.unwrap();
        job.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_expression_rejected() {
        let job = JobSpec::new("bad", "not a cron", || Box::pin(async { Ok(()) }));
        let result = Scheduler::start(vec![job]);
        assert!(matches!(
            result,
            Err(ScheduleError::InvalidExpression { job: "bad", .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_idempotent() {
        let job = JobSpec::new("noop", "0 2 * * *", || Box::pin(async { Ok(()) }));
        let mut scheduler = Scheduler::start(vec![job]).unwrap();
        scheduler.shutdown();
        scheduler.shutdown();
    }
}
