use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use accredit_core::clock::Clock;
use accredit_core::error::Result;

use crate::sla::ScanSummary;

/// A periodic scan driven by [`SlaScheduler`].
pub trait ScanJob: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn run(&self) -> BoxFuture<'_, Result<ScanSummary>>;
}

/// Snapshot of the scheduler's lifecycle and tick history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub ticks: u64,
    pub failed_ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_summary: Option<ScanSummary>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Runs a [`ScanJob`] on a fixed interval.
///
/// Each tick runs in its own task, so a scan that errors or panics is
/// recorded as a failed tick and the loop keeps going. Ticks never overlap:
/// the next sleep starts after the previous tick has finished.
pub struct SlaScheduler {
    job: Arc<dyn ScanJob>,
    interval: Duration,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<SchedulerStatus>>,
    running: Mutex<Option<Running>>,
}

impl SlaScheduler {
    pub fn new(job: Arc<dyn ScanJob>, interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            job,
            interval,
            clock,
            state: Arc::new(Mutex::new(SchedulerStatus::default())),
            running: Mutex::new(None),
        }
    }

    /// Start the tick loop. Returns `false` if it is already running.
    pub fn start(&self) -> bool {
        let mut running = lock(&self.running);
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            self.job.clone(),
            self.interval,
            self.clock.clone(),
            self.state.clone(),
            cancel.clone(),
        ));
        *running = Some(Running { cancel, task });
        lock(&self.state).running = true;
        true
    }

    /// Cancel the loop and wait for an in-flight tick to finish.
    pub async fn stop(&self) {
        let running = lock(&self.running).take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.task.await {
                error!(job = self.job.name(), error = %e, "SLA scheduler task ended abnormally");
            }
        }
        lock(&self.state).running = false;
    }

    pub fn status(&self) -> SchedulerStatus {
        lock(&self.state).clone()
    }

    /// Run one tick immediately, outside the schedule. `None` means the
    /// scan failed; the failure is logged and counted like a scheduled one.
    pub async fn tick_now(&self) -> Option<ScanSummary> {
        tick(&self.job, self.clock.as_ref(), &self.state).await
    }
}

async fn run_loop(
    job: Arc<dyn ScanJob>,
    interval: Duration,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<SchedulerStatus>>,
    cancel: CancellationToken,
) {
    info!(job = job.name(), interval_secs = interval.as_secs(), "SLA scheduler started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => {
                info!(job = job.name(), "SLA scheduler shutting down");
                break;
            }
        }

        tick(&job, clock.as_ref(), &state).await;
    }
}

async fn tick(
    job: &Arc<dyn ScanJob>,
    clock: &dyn Clock,
    state: &Mutex<SchedulerStatus>,
) -> Option<ScanSummary> {
    let started = clock.now();
    let task_job = job.clone();
    let result = tokio::spawn(async move { task_job.run().await }).await;

    let summary = match result {
        Ok(Ok(summary)) => Some(summary),
        Ok(Err(e)) => {
            error!(job = job.name(), error = %e, "Scan failed");
            None
        }
        Err(e) => {
            error!(job = job.name(), error = %e, "Scan panicked");
            None
        }
    };

    let mut status = lock(state);
    status.ticks += 1;
    status.last_tick_at = Some(started);
    match &summary {
        Some(s) => status.last_summary = Some(s.clone()),
        None => status.failed_ticks += 1,
    }
    summary
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use accredit_core::clock::SystemClock;
    use accredit_core::error::WorkflowError;

    /// Fails (or panics) on the first call, succeeds afterwards.
    struct FlakyJob {
        calls: AtomicUsize,
        panic_first: bool,
    }

    impl FlakyJob {
        fn new(panic_first: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                panic_first,
            })
        }
    }

    impl ScanJob for FlakyJob {
        fn name(&self) -> &str {
            "flaky"
        }

        fn run(&self) -> BoxFuture<'_, Result<ScanSummary>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call == 0 {
                    if self.panic_first {
                        panic!("scan exploded");
                    }
                    return Err(WorkflowError::Database("database is locked".into()));
                }
                Ok(ScanSummary {
                    checked: call,
                    ..Default::default()
                })
            })
        }
    }

    fn scheduler(job: Arc<FlakyJob>) -> SlaScheduler {
        SlaScheduler::new(job, Duration::from_secs(60), Arc::new(SystemClock))
    }

    #[tokio::test(start_paused = true)]
    async fn failing_tick_does_not_stop_the_schedule() {
        let job = FlakyJob::new(false);
        let scheduler = scheduler(job.clone());
        assert!(scheduler.start());

        tokio::time::sleep(Duration::from_secs(121)).await;

        assert_eq!(job.calls.load(Ordering::SeqCst), 2);
        let status = scheduler.status();
        assert!(status.running);
        assert_eq!(status.ticks, 2);
        assert_eq!(status.failed_ticks, 1);
        assert_eq!(status.last_summary.map(|s| s.checked), Some(1));

        scheduler.stop().await;
        assert!(!scheduler.status().running);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_tick_is_contained() {
        let job = FlakyJob::new(true);
        let scheduler = scheduler(job.clone());
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(121)).await;

        assert_eq!(job.calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.status().failed_ticks, 1);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_not_reentrant() {
        let scheduler = scheduler(FlakyJob::new(false));
        assert!(scheduler.start());
        assert!(!scheduler.start());
        scheduler.stop().await;
        assert!(scheduler.start());
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_ticks() {
        let job = FlakyJob::new(false);
        let scheduler = scheduler(job.clone());
        scheduler.start();
        scheduler.stop().await;

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(job.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tick_now_runs_once() {
        let job = FlakyJob::new(false);
        let scheduler = scheduler(job.clone());

        assert!(scheduler.tick_now().await.is_none());
        let summary = scheduler.tick_now().await.expect("second tick succeeds");
        assert_eq!(summary.checked, 1);
        assert_eq!(scheduler.status().ticks, 2);
        assert!(!scheduler.status().running);
    }
}
