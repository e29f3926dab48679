//! Process wiring: build the singletons, put every periodic job on the
//! schedule, tear everything down in reverse order on shutdown.

use anyhow::{Context as _, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::alerts::sink::{AlertSink, CooldownSink, LogSink};
use crate::alerts::{AlertEngine, Severity};
use crate::cloud::CloudPoller;
use crate::config::AppConfig;
use crate::feeder::{InverterFeeder, ALERT_INVERTER_WRITE_FAIL};
use crate::meter::MeterReader;
use crate::scheduler::Scheduler;
use crate::snapshot::SharedSnapshot;
use crate::status::{self, Health, StatusInputs, StatusReport};
use crate::util::now_ms;

const CLOUD_INITIAL_DELAY: Duration = Duration::from_secs(5);
const ENSURE_OPEN_INITIAL_DELAY: Duration = Duration::from_secs(1);
const ENSURE_OPEN_PERIOD: Duration = Duration::from_secs(5);
const FEEDER_TICK_PERIOD: Duration = Duration::from_secs(1);
const WATCHDOG_GRACE: Duration = Duration::from_secs(5);
const WATCHDOG_PERIOD: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AppState {
    pub cfg: AppConfig,
    pub alerts: Arc<AlertEngine>,
    pub scheduler: Arc<Scheduler>,
    pub meter: Arc<MeterReader>,
    pub cloud: Arc<CloudPoller>,
    pub feeder: Arc<InverterFeeder>,
}

impl AppState {
    pub fn new(cfg: AppConfig) -> Result<Self> {
        let alerts = Arc::new(AlertEngine::new());
        let transport: Arc<dyn AlertSink> = Arc::new(LogSink);
        alerts.add_sink(Arc::new(CooldownSink::new(
            transport,
            cfg.alerts.cooldown_ms,
        )));

        let scheduler = Arc::new(Scheduler::new(alerts.clone()));
        let snapshot = SharedSnapshot::new();
        let meter = Arc::new(MeterReader::new(
            cfg.meter.clone(),
            alerts.clone(),
            snapshot.clone(),
        ));
        let cloud = Arc::new(
            CloudPoller::new(cfg.cloud.clone(), alerts.clone())
                .context("failed to build cloud client")?,
        );
        let feeder = Arc::new(InverterFeeder::new(
            cfg.inverter.clone(),
            cfg.transform.clone(),
            alerts.clone(),
            snapshot,
            cloud.clone(),
        ));

        Ok(Self {
            cfg,
            alerts,
            scheduler,
            meter,
            cloud,
            feeder,
        })
    }

    /// Put all periodic jobs on the schedule and hook up the crash signal.
    pub fn start(&self) {
        if self.cfg.alerts.startup_ping {
            self.alerts
                .raise("STARTUP", Severity::Info, "controller started");
            self.alerts.resolve("STARTUP");
        }

        let mut crashed = self.scheduler.modbus_crashed();
        let meter = self.meter.clone();
        tokio::spawn(async move {
            while crashed.recv().await.is_ok() {
                meter.request_reopen();
            }
        });

        let meter = self.meter.clone();
        self.scheduler.spawn_fixed_delay(
            "meter-poll",
            Duration::from_millis(self.cfg.meter.initial_open_delay_ms),
            Duration::from_millis(self.cfg.meter.poll_interval_ms),
            move || {
                let meter = meter.clone();
                async move { meter.poll_once().await.context("modbus master poll escaped") }
            },
        );

        let cloud = self.cloud.clone();
        self.scheduler.spawn_fixed_delay(
            "cloud-poll",
            CLOUD_INITIAL_DELAY,
            Duration::from_secs(self.cfg.cloud.fetch_period_s),
            move || {
                let cloud = cloud.clone();
                async move { cloud.poll_once().await }
            },
        );

        let feeder = self.feeder.clone();
        let alerts = self.alerts.clone();
        self.scheduler.spawn_fixed_delay(
            "inverter-ensure-open",
            ENSURE_OPEN_INITIAL_DELAY,
            ENSURE_OPEN_PERIOD,
            move || {
                let feeder = feeder.clone();
                let alerts = alerts.clone();
                async move {
                    if let Err(err) = feeder.ensure_open().await {
                        alerts.raise(
                            ALERT_INVERTER_WRITE_FAIL,
                            Severity::Warn,
                            format!("{err:#}"),
                        );
                        feeder.close();
                    }
                    Ok(())
                }
            },
        );

        let feeder = self.feeder.clone();
        let alerts = self.alerts.clone();
        self.scheduler.spawn_fixed_rate(
            "inverter-tick",
            FEEDER_TICK_PERIOD,
            FEEDER_TICK_PERIOD,
            move || {
                let feeder = feeder.clone();
                let alerts = alerts.clone();
                async move {
                    if let Err(err) = feeder.tick() {
                        alerts.raise(
                            ALERT_INVERTER_WRITE_FAIL,
                            Severity::Warn,
                            format!("{err:#}"),
                        );
                        feeder.close();
                    }
                    Ok(())
                }
            },
        );

        let feeder = self.feeder.clone();
        self.scheduler.spawn_fixed_delay(
            "inverter-watchdog",
            WATCHDOG_GRACE,
            WATCHDOG_PERIOD,
            move || {
                let feeder = feeder.clone();
                async move { feeder.watch_output_staleness() }
            },
        );

        let summary_state = self.clone();
        self.scheduler.spawn_fixed_rate(
            "status-summary",
            Duration::from_secs(self.cfg.scheduler.summary_interval_s),
            Duration::from_secs(self.cfg.scheduler.summary_interval_s),
            move || {
                let state = summary_state.clone();
                async move {
                    let report = state.status_report();
                    info!(
                        delta_kw = report.delta_kw,
                        grid_import_kw = report.grid_import_kw,
                        meter_total_power_w = report.meter_total_power_w,
                        sm_age = %report.sm_age,
                        out_age = %report.out_age,
                        cloud_state = %report.cloud_state,
                        "status"
                    );
                    Ok(())
                }
            },
        );

        if self.cfg.alerts.heartbeat_enabled {
            let alerts = self.alerts.clone();
            self.scheduler.spawn_daily(
                "daily-heartbeat",
                self.cfg.alerts.heartbeat_hour,
                move || {
                    let alerts = alerts.clone();
                    async move {
                        alerts.raise("HEARTBEAT", Severity::Info, "daily heartbeat");
                        alerts.resolve("HEARTBEAT");
                        Ok(())
                    }
                },
            );
        }

        info!("all periodic jobs scheduled");
    }

    pub fn status_report(&self) -> StatusReport {
        let snapshot = self.meter.latest_snapshot();
        let output = self.feeder.last_output_image();
        let reading = self.cloud.last_reading();
        status::assemble(StatusInputs {
            snapshot: &snapshot,
            meter_port_state: self.meter.port_state().to_string(),
            output: output.as_deref(),
            last_write_at_ms: self.feeder.last_write_at_ms(),
            inverter_up: self.feeder.is_up(),
            reading: reading.as_ref(),
            delta_kw: self.cloud.current_delta_kw(),
            override_enabled: self.cloud.override_enabled(),
            min_import_kw: self.cloud.min_import_kw(),
            transform: &self.cfg.transform,
            now_ms: now_ms(),
        })
    }

    pub fn health(&self) -> Health {
        let snapshot = self.meter.latest_snapshot();
        let reading = self.cloud.last_reading();
        status::health(reading.as_ref(), snapshot.age_ms(now_ms()))
    }

    /// Reverse of boot: ping, stop the schedule, close both buses.
    pub async fn shutdown(&self) {
        if self.cfg.alerts.shutdown_ping {
            self.alerts
                .raise("SHUTDOWN", Severity::Info, "controller stopping");
            self.alerts.resolve("SHUTDOWN");
        }
        self.alerts.set_stopping();
        self.scheduler.shutdown().await;
        self.feeder.shutdown().await;
        self.meter.shutdown().await;
        info!("controller stopped");
    }
}
