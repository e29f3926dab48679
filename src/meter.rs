//! Meter reader: Modbus RTU master on the physical meter bus.
//!
//! One periodic job polls the meter, rebuilds a fresh register image per
//! pass and publishes it through the shared snapshot handle. The serial
//! port lives behind `master`; nothing else in the process touches it.
//! Transient timeouts are ridden out in place, persistent trouble closes
//! the port and backs off before reopening.

use anyhow::Result;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tokio_modbus::client::{rtu, Context};
use tokio_modbus::prelude::*;
use tokio_serial::SerialStream;
use tracing::{debug, info, warn};

use crate::alerts::{AlertEngine, Severity};
use crate::config::MeterConfig;
use crate::registers::IMAGE_LEN;
use crate::scheduler::ALERT_MODBUS_UNCAUGHT;
use crate::snapshot::{MeterSnapshot, SharedSnapshot};
use crate::util::now_ms;

pub const ALERT_METER_DISCONNECTED: &str = "METER_DISCONNECTED";
pub const ALERT_METER_STALE: &str = "METER_STALE";

/// Register windows fetched per pass with function 03: per-phase voltages,
/// currents and frequency in one block, the signed power pairs in another.
pub const READ_WINDOWS: [(u16, u16); 2] = [(97, 26), (356, 8)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum PortState {
    Closed,
    Opening,
    Warmup,
    Steady,
    Failing,
}

enum PassOutcome {
    Success(Vec<u16>),
    Timeout,
    Transport(String),
}

pub struct MeterReader {
    cfg: MeterConfig,
    alerts: Arc<AlertEngine>,
    snapshot: SharedSnapshot,
    master: tokio::sync::Mutex<Option<Context>>,
    state: parking_lot::Mutex<PortState>,
    consecutive_timeouts: AtomicU32,
    last_open_at_ms: AtomicI64,
    backoff_until_ms: AtomicI64,
    last_stale_alert_ms: AtomicI64,
    force_reopen: AtomicBool,
    started_at_ms: i64,
}

impl MeterReader {
    pub fn new(cfg: MeterConfig, alerts: Arc<AlertEngine>, snapshot: SharedSnapshot) -> Self {
        Self {
            cfg,
            alerts,
            snapshot,
            master: tokio::sync::Mutex::new(None),
            state: parking_lot::Mutex::new(PortState::Closed),
            consecutive_timeouts: AtomicU32::new(0),
            last_open_at_ms: AtomicI64::new(0),
            backoff_until_ms: AtomicI64::new(0),
            last_stale_alert_ms: AtomicI64::new(0),
            force_reopen: AtomicBool::new(false),
            started_at_ms: now_ms(),
        }
    }

    pub fn latest_snapshot(&self) -> Arc<MeterSnapshot> {
        self.snapshot.latest()
    }

    pub fn port_state(&self) -> PortState {
        *self.state.lock()
    }

    /// Force a close+reopen on the next tick, e.g. after the Modbus stack
    /// reported an escaped error.
    pub fn request_reopen(&self) {
        self.force_reopen.store(true, Ordering::SeqCst);
    }

    /// One poll tick. Everything foreseeable is handled in place via alerts;
    /// an `Err` from here means something genuinely unexpected escaped.
    pub async fn poll_once(&self) -> Result<()> {
        let now = now_ms();
        let mut guard = self.master.lock().await;

        if self.force_reopen.swap(false, Ordering::SeqCst) && guard.is_some() {
            info!("reopening meter port on request");
            *guard = None;
            *self.state.lock() = PortState::Closed;
        }

        if !Path::new(&self.cfg.port).exists() {
            self.alerts.raise(
                ALERT_METER_DISCONNECTED,
                Severity::Error,
                format!("meter port {} is gone", self.cfg.port),
            );
            *guard = None;
            self.enter_backoff(now, PortState::Failing);
            return Ok(());
        }

        self.check_staleness(now);

        if now < self.backoff_until_ms.load(Ordering::SeqCst) {
            return Ok(());
        }

        if guard.is_none() {
            *self.state.lock() = PortState::Opening;
            match self.open_port() {
                Ok(ctx) => {
                    *guard = Some(ctx);
                    self.last_open_at_ms.store(now, Ordering::SeqCst);
                    self.consecutive_timeouts.store(0, Ordering::SeqCst);
                    *self.state.lock() = PortState::Warmup;
                    debug!(port = %self.cfg.port, "meter port opened");
                }
                Err(err) => {
                    self.alerts.raise(
                        ALERT_METER_DISCONNECTED,
                        Severity::Error,
                        format!("failed to open meter port: {err}"),
                    );
                    self.enter_backoff(now, PortState::Failing);
                    return Ok(());
                }
            }
        }

        let Some(ctx) = guard.as_mut() else {
            return Ok(());
        };
        match self.read_pass(ctx).await {
            PassOutcome::Success(image) => {
                self.snapshot.publish(MeterSnapshot::new(image, now_ms()));
                self.consecutive_timeouts.store(0, Ordering::SeqCst);
                let in_warmup =
                    now - self.last_open_at_ms.load(Ordering::SeqCst) < self.cfg.warmup_ms as i64;
                *self.state.lock() = if in_warmup {
                    PortState::Warmup
                } else {
                    PortState::Steady
                };
                self.alerts.resolve(ALERT_METER_DISCONNECTED);
                self.alerts.resolve(ALERT_METER_STALE);
                self.alerts.resolve(ALERT_MODBUS_UNCAUGHT);
            }
            PassOutcome::Timeout => {
                let since_open = now - self.last_open_at_ms.load(Ordering::SeqCst);
                if since_open < self.cfg.warmup_ms as i64 {
                    // The meter often stays mute right after an open.
                    debug!("read timeout during warmup, keeping port");
                    return Ok(());
                }
                let timeouts = self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(timeouts, "meter read pass timed out");
                if timeouts >= self.cfg.timeouts_before_reopen {
                    *guard = None;
                    self.consecutive_timeouts.store(0, Ordering::SeqCst);
                    self.enter_backoff(now, PortState::Failing);
                }
            }
            PassOutcome::Transport(message) => {
                self.alerts.raise(
                    ALERT_METER_DISCONNECTED,
                    Severity::Error,
                    format!("meter transport error: {message}"),
                );
                *guard = None;
                self.enter_backoff(now, PortState::Failing);
            }
        }
        Ok(())
    }

    /// Read all windows into a fresh image. Individual windows may fail;
    /// the pass fails once too many of them do.
    async fn read_pass(&self, ctx: &mut Context) -> PassOutcome {
        let mut image = vec![0u16; IMAGE_LEN];
        let mut failed_windows = 0u32;
        let mut timeouts = 0u32;
        let mut last_error: Option<String> = None;
        let request_timeout = Duration::from_millis(self.cfg.request_timeout_ms);

        for (start, count) in READ_WINDOWS {
            match tokio::time::timeout(request_timeout, ctx.read_holding_registers(start, count))
                .await
            {
                Err(_elapsed) => {
                    timeouts += 1;
                    failed_windows += 1;
                    debug!(start, count, "register window timed out");
                }
                Ok(Ok(Ok(words))) => copy_window(&mut image, start, &words),
                Ok(Ok(Err(err))) => {
                    failed_windows += 1;
                    last_error = Some(err.to_string());
                    debug!(start, count, error = %err, "register window failed");
                }
                Ok(Err(err)) => {
                    failed_windows += 1;
                    last_error = Some(err.to_string());
                    debug!(start, count, error = %err, "register window failed");
                }
            }
            if failed_windows >= self.cfg.max_window_errors_before_reopen {
                break;
            }
        }

        if failed_windows >= self.cfg.max_window_errors_before_reopen {
            if timeouts > 0 {
                PassOutcome::Timeout
            } else {
                PassOutcome::Transport(
                    last_error.unwrap_or_else(|| "all register windows failed".to_string()),
                )
            }
        } else {
            PassOutcome::Success(image)
        }
    }

    fn open_port(&self) -> Result<Context> {
        let builder = tokio_serial::new(self.cfg.port.as_str(), self.cfg.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .timeout(Duration::from_millis(self.cfg.request_timeout_ms));
        let port = SerialStream::open(&builder)?;
        Ok(rtu::attach_slave(port, Slave(self.cfg.slave_id)))
    }

    /// Raise `METER_STALE` (rate-limited) once the snapshot is too old and
    /// the port has been up long enough to blame the meter.
    fn check_staleness(&self, now: i64) {
        let snap = self.snapshot.latest();
        let effective_age = if snap.is_acquired() {
            snap.age_ms(now)
        } else {
            now - self.started_at_ms
        };

        if effective_age <= self.cfg.meter_stale_ms {
            if snap.is_acquired() {
                self.alerts.resolve(ALERT_METER_STALE);
            }
            return;
        }

        let last_open = self.last_open_at_ms.load(Ordering::SeqCst);
        let past_warmup = last_open > 0 && now - last_open >= self.cfg.warmup_ms as i64;
        if !past_warmup {
            return;
        }

        let last_alert = self.last_stale_alert_ms.load(Ordering::SeqCst);
        if now - last_alert >= self.cfg.stale_alert_min_period_ms {
            self.last_stale_alert_ms.store(now, Ordering::SeqCst);
            self.alerts.raise(
                ALERT_METER_STALE,
                Severity::Error,
                format!("no meter data for {effective_age} ms"),
            );
        }
    }

    fn enter_backoff(&self, now: i64, state: PortState) {
        self.backoff_until_ms
            .store(now + self.cfg.reopen_backoff_ms as i64, Ordering::SeqCst);
        *self.state.lock() = state;
    }

    /// Close the port quietly; used on shutdown.
    pub async fn shutdown(&self) {
        let mut guard = self.master.lock().await;
        *guard = None;
        *self.state.lock() = PortState::Closed;
    }
}

fn copy_window(image: &mut [u16], start: u16, words: &[u16]) {
    let start = start as usize;
    let end = (start + words.len()).min(image.len());
    if start < end {
        image[start..end].copy_from_slice(&words[..end - start]);
    }
}
