//! Named periodic jobs and the last line of error handling.
//!
//! Every recurring activity in the process runs as a named job on the
//! shared worker pool. A job returning `Err` never takes the schedule down:
//! the error is caught here, raised as a CRITICAL alert, and the next run
//! happens on time. Errors out of the Modbus stack additionally fire a
//! crash signal the meter reader uses to force a close+reopen.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, info, warn};

use crate::alerts::{AlertEngine, Severity};

pub const ALERT_UNCAUGHT: &str = "UNCAUGHT";
pub const ALERT_MODBUS_UNCAUGHT: &str = "MODBUS_UNCAUGHT";

struct JobHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    alerts: Arc<AlertEngine>,
    crash_tx: broadcast::Sender<()>,
    stop_tx: watch::Sender<bool>,
    jobs: Mutex<Vec<JobHandle>>,
}

impl Scheduler {
    pub fn new(alerts: Arc<AlertEngine>) -> Self {
        let (crash_tx, _) = broadcast::channel(4);
        let (stop_tx, _) = watch::channel(false);
        Self {
            alerts,
            crash_tx,
            stop_tx,
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Signal fired when a job dies inside the Modbus stack.
    pub fn modbus_crashed(&self) -> broadcast::Receiver<()> {
        self.crash_tx.subscribe()
    }

    /// Run `job` forever with a fixed pause between the end of one run and
    /// the start of the next.
    pub fn spawn_fixed_delay<F, Fut>(
        &self,
        name: &'static str,
        initial_delay: Duration,
        period: Duration,
        job: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let alerts = self.alerts.clone();
        let crash_tx = self.crash_tx.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = sleep(initial_delay) => {}
            }
            loop {
                if *stop_rx.borrow() {
                    return;
                }
                run_job(name, &alerts, &crash_tx, &job).await;
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = sleep(period) => {}
                }
            }
        });
        self.register(name, handle);
    }

    /// Run `job` forever on a fixed cadence, regardless of how long each
    /// run takes.
    pub fn spawn_fixed_rate<F, Fut>(
        &self,
        name: &'static str,
        initial_delay: Duration,
        period: Duration,
        job: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let alerts = self.alerts.clone();
        let crash_tx = self.crash_tx.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + initial_delay, period);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = ticker.tick() => {}
                }
                if *stop_rx.borrow() {
                    return;
                }
                run_job(name, &alerts, &crash_tx, &job).await;
            }
        });
        self.register(name, handle);
    }

    /// Run `job` once per day at the given UTC hour.
    pub fn spawn_daily<F, Fut>(&self, name: &'static str, hour: u32, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let alerts = self.alerts.clone();
        let crash_tx = self.crash_tx.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = next_daily_run(now, hour);
                let wait = (next - now)
                    .to_std()
                    .unwrap_or_else(|_| Duration::from_secs(60));
                info!(job = name, next = %next, "daily job scheduled");
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = sleep(wait) => {}
                }
                if *stop_rx.borrow() {
                    return;
                }
                run_job(name, &alerts, &crash_tx, &job).await;
            }
        });
        self.register(name, handle);
    }

    fn register(&self, name: &'static str, handle: JoinHandle<()>) {
        debug!(job = name, "job registered");
        self.jobs.lock().push(JobHandle { name, handle });
    }

    /// Stop the schedule. Running jobs get a short grace to finish their
    /// current tick before being aborted.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        let jobs: Vec<JobHandle> = std::mem::take(&mut *self.jobs.lock());
        for job in jobs {
            let mut handle = job.handle;
            if tokio::time::timeout(Duration::from_secs(2), &mut handle)
                .await
                .is_err()
            {
                warn!(job = job.name, "job did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

async fn run_job<F, Fut>(
    name: &'static str,
    alerts: &AlertEngine,
    crash_tx: &broadcast::Sender<()>,
    job: &F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if let Err(err) = job().await {
        let detail = format!("{err:#}");
        if detail.to_ascii_lowercase().contains("modbus") {
            alerts.raise(
                ALERT_MODBUS_UNCAUGHT,
                Severity::Critical,
                format!("{name}: {detail}"),
            );
            let _ = crash_tx.send(());
        } else {
            alerts.raise(
                ALERT_UNCAUGHT,
                Severity::Critical,
                format!("{name}: {detail}"),
            );
        }
    }
}

/// Next occurrence of `hour:00:00` UTC strictly after `now`.
fn next_daily_run(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let today = now
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .expect("valid hour");
    let today = Utc.from_utc_datetime(&today);
    if now.hour() < hour {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}
