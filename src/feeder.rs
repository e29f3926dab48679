//! Inverter feeder: Modbus RTU slave on the inverter-facing bus.
//!
//! Owns the second serial port and a single process image the inverter
//! polls. Holding (03) and input (04) registers answer identically over the
//! same index range, because inverter firmwares disagree on which function
//! they use for "the grid meter". A 1 Hz tick composes the next frame from
//! the latest meter snapshot and the compensation set-point; a slower
//! `ensure_open` heals the port and a watchdog barks when publishing stops.

use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use std::future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_modbus::prelude::*;
use tokio_modbus::server::rtu::Server;
use tokio_serial::SerialStream;
use tracing::{debug, info, warn};

use crate::alerts::{AlertEngine, Severity};
use crate::cloud::CloudPoller;
use crate::config::{InverterConfig, TransformConfig};
use crate::registers::IMAGE_LEN;
use crate::snapshot::SharedSnapshot;
use crate::transform;
use crate::util::now_ms;

pub const ALERT_INVERTER_RTU_DOWN: &str = "INVERTER_RTU_DOWN";
pub const ALERT_FEEDER_WAITING: &str = "INVERTER_FEEDER_WAITING_FOR_METER";
pub const ALERT_FEEDER_STALE_INPUT: &str = "INVERTER_FEEDER_STALE_INPUT";
pub const ALERT_INVERTER_WRITE_FAIL: &str = "INVERTER_WRITE_FAIL";
pub const ALERT_INVERTER_OUTPUT_STALE: &str = "INVERTER_OUTPUT_STALE";

/// Register banks served to the inverter. Function 03 and 04 carry the
/// same data over the same index range.
struct RegisterBank {
    holding: Vec<u16>,
    input: Vec<u16>,
}

impl RegisterBank {
    fn zeroed(len: usize) -> Self {
        Self {
            holding: vec![0; len],
            input: vec![0; len],
        }
    }
}

/// Serves the bank to the bus. Requests for other slave ids are ignored
/// without a response, as RS-485 multi-drop requires.
#[derive(Clone)]
struct FeederService {
    bank: Arc<Mutex<RegisterBank>>,
    slave_id: u8,
}

impl tokio_modbus::server::Service for FeederService {
    type Request = SlaveRequest<'static>;
    type Response = Option<Response>;
    type Exception = ExceptionCode;
    type Future = future::Ready<std::result::Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        if req.slave != self.slave_id {
            return future::ready(Ok(None));
        }
        let res = match req.request {
            Request::ReadHoldingRegisters(addr, cnt) => {
                bank_read(&self.bank.lock().holding, addr, cnt)
                    .map(|words| Some(Response::ReadHoldingRegisters(words)))
            }
            Request::ReadInputRegisters(addr, cnt) => {
                bank_read(&self.bank.lock().input, addr, cnt)
                    .map(|words| Some(Response::ReadInputRegisters(words)))
            }
            _ => Err(ExceptionCode::IllegalFunction),
        };
        future::ready(res)
    }
}

fn bank_read(
    registers: &[u16],
    addr: u16,
    cnt: u16,
) -> std::result::Result<Vec<u16>, ExceptionCode> {
    let start = addr as usize;
    let end = start + cnt as usize;
    if end > registers.len() {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(registers[start..end].to_vec())
}

pub struct InverterFeeder {
    cfg: InverterConfig,
    transform_cfg: TransformConfig,
    alerts: Arc<AlertEngine>,
    snapshot: SharedSnapshot,
    cloud: Arc<CloudPoller>,
    bank: Arc<Mutex<RegisterBank>>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    up: AtomicBool,
    last_output: Mutex<Option<Vec<u16>>>,
    last_write_at_ms: AtomicI64,
}

impl InverterFeeder {
    pub fn new(
        cfg: InverterConfig,
        transform_cfg: TransformConfig,
        alerts: Arc<AlertEngine>,
        snapshot: SharedSnapshot,
        cloud: Arc<CloudPoller>,
    ) -> Self {
        let bank_len = cfg.init_registers.max(IMAGE_LEN);
        Self {
            cfg,
            transform_cfg,
            alerts,
            snapshot,
            cloud,
            bank: Arc::new(Mutex::new(RegisterBank::zeroed(bank_len))),
            serve_task: Mutex::new(None),
            up: AtomicBool::new(false),
            last_output: Mutex::new(None),
            last_write_at_ms: AtomicI64::new(0),
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    pub fn last_output_image(&self) -> Option<Vec<u16>> {
        self.last_output.lock().clone()
    }

    pub fn last_write_at_ms(&self) -> i64 {
        self.last_write_at_ms.load(Ordering::SeqCst)
    }

    /// Bring the slave up if it is down, tear it down if its device went
    /// away. Runs every few seconds.
    pub async fn ensure_open(&self) -> Result<()> {
        if self.is_up() {
            let device_gone = !Path::new(&self.cfg.port).exists();
            let task_dead = self
                .serve_task
                .lock()
                .as_ref()
                .map(|task| task.is_finished())
                .unwrap_or(true);
            if device_gone || task_dead {
                self.close();
                self.alerts.raise(
                    ALERT_INVERTER_RTU_DOWN,
                    Severity::Error,
                    if device_gone {
                        format!("inverter port {} is gone", self.cfg.port)
                    } else {
                        "inverter slave task exited".to_string()
                    },
                );
            }
            return Ok(());
        }

        if self.cfg.defer_open_until_first_frame && !self.snapshot.latest().is_acquired() {
            debug!("deferring inverter port open until the meter delivers");
            self.alerts.raise(
                ALERT_FEEDER_WAITING,
                Severity::Warn,
                "no meter snapshot yet",
            );
            return Ok(());
        }

        let builder = tokio_serial::new(self.cfg.port.as_str(), self.cfg.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One);
        let port = match SerialStream::open(&builder) {
            Ok(port) => port,
            Err(err) => {
                self.alerts.raise(
                    ALERT_INVERTER_RTU_DOWN,
                    Severity::Error,
                    format!("failed to open inverter port: {err}"),
                );
                return Ok(());
            }
        };

        {
            let mut bank = self.bank.lock();
            *bank = RegisterBank::zeroed(self.cfg.init_registers.max(IMAGE_LEN));
        }

        let service = FeederService {
            bank: self.bank.clone(),
            slave_id: self.cfg.slave_id,
        };
        let server = Server::new(port);
        let handle = tokio::spawn(async move {
            if let Err(err) = server.serve_forever(service).await {
                warn!(error = %err, "inverter slave stopped serving");
            }
        });
        *self.serve_task.lock() = Some(handle);
        self.up.store(true, Ordering::SeqCst);
        self.alerts.resolve(ALERT_INVERTER_RTU_DOWN);
        info!(port = %self.cfg.port, slave_id = self.cfg.slave_id, "inverter slave up");

        // First frame right away so the inverter never reads a blank bank
        // longer than necessary.
        self.tick()
            .context("initial publish after inverter open failed")?;
        Ok(())
    }

    /// Compose and publish the next frame from the latest meter snapshot.
    pub fn tick(&self) -> Result<()> {
        if !self.is_up() {
            return Ok(());
        }
        let now = now_ms();
        let snap = self.snapshot.latest();

        if !snap.is_acquired() {
            self.alerts.raise(
                ALERT_FEEDER_WAITING,
                Severity::Warn,
                "no meter snapshot yet",
            );
            if self.cfg.republish_on_stale {
                self.republish(now);
            }
            return Ok(());
        }

        let age = snap.age_ms(now);
        if age > self.cfg.max_sm_age_for_write_ms {
            self.alerts.raise(
                ALERT_FEEDER_STALE_INPUT,
                Severity::Error,
                format!("meter snapshot is {age} ms old"),
            );
            if self.cfg.republish_on_stale {
                self.republish(now);
            }
            return Ok(());
        }

        self.alerts.resolve(ALERT_FEEDER_WAITING);
        self.alerts.resolve(ALERT_FEEDER_STALE_INPUT);

        let delta_kw = self.cloud.current_delta_kw();
        let frame = transform::prepare(Some(&snap), delta_kw, &self.transform_cfg, now);
        self.publish(frame, now);
        Ok(())
    }

    /// Keep the inverter fed with the previous output while input is bad.
    fn republish(&self, now: i64) {
        let previous = self.last_output.lock().clone();
        if let Some(frame) = previous {
            self.publish(frame, now);
        }
    }

    /// Write a frame into both banks under the image lock. Indices past the
    /// frame are zeroed so stale tail data can never linger.
    fn publish(&self, frame: Vec<u16>, now: i64) {
        {
            let mut bank = self.bank.lock();
            let len = self.cfg.init_registers.max(frame.len()).max(IMAGE_LEN);
            bank.holding.resize(len, 0);
            bank.input.resize(len, 0);
            for index in 0..len {
                let word = frame.get(index).copied().unwrap_or(0);
                bank.holding[index] = word;
                bank.input[index] = word;
            }
        }
        *self.last_output.lock() = Some(frame);
        self.last_write_at_ms.store(now, Ordering::SeqCst);
    }

    /// Raise once publishing has stopped for too long after the first
    /// successful publish.
    pub fn watch_output_staleness(&self) -> Result<()> {
        let last = self.last_write_at_ms();
        if last == 0 {
            return Ok(());
        }
        let age = now_ms() - last;
        if age > self.cfg.out_stale_ms {
            self.alerts.raise(
                ALERT_INVERTER_OUTPUT_STALE,
                Severity::Error,
                format!("no frame published for {age} ms"),
            );
        } else {
            self.alerts.resolve(ALERT_INVERTER_OUTPUT_STALE);
        }
        Ok(())
    }

    /// Tear the slave down; `ensure_open` will bring it back.
    pub fn close(&self) {
        if let Some(task) = self.serve_task.lock().take() {
            task.abort();
        }
        self.up.store(false, Ordering::SeqCst);
    }

    pub async fn shutdown(&self) {
        self.close();
    }

    #[cfg(test)]
    fn bank_words(&self, holding: bool, start: usize, len: usize) -> Vec<u16> {
        let bank = self.bank.lock();
        let regs = if holding { &bank.holding } else { &bank.input };
        regs[start..start + len].to_vec()
    }

    #[cfg(test)]
    fn force_up(&self) {
        self.up.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::write_u16;
    use crate::config::CloudConfig;
    use crate::registers::{REG_CURRENT_L1, REG_VOLTAGE_L1};
    use crate::snapshot::MeterSnapshot;
    use tokio_modbus::server::Service as _;

    fn test_inverter_cfg() -> InverterConfig {
        InverterConfig {
            port: "/dev/does-not-exist-inverter".to_string(),
            baud_rate: 9600,
            slave_id: 1,
            init_registers: 400,
            max_sm_age_for_write_ms: 60_000,
            out_stale_ms: 30_000,
            defer_open_until_first_frame: true,
            republish_on_stale: true,
        }
    }

    fn test_transform_cfg() -> TransformConfig {
        TransformConfig {
            scale_pt: 1.0,
            scale_ct: 1.0,
            min_power_factor: 0.95,
            stale_to_zero_ms: 300_000,
            phase_min_volt: 100.0,
            safe_div_min_volt: 100.0,
        }
    }

    fn test_cloud_cfg() -> CloudConfig {
        CloudConfig {
            api_id: String::new(),
            api_secret: String::new(),
            base_uri: "http://localhost:1".to_string(),
            sn: String::new(),
            fetch_period_s: 10,
            min_import_kw: 0.2,
            max_data_age_ms: 300_000,
            smoothing_factor: 0.8,
            clamp_max_kw: 50.0,
            delta_max_kw_per_sec: 2.0,
            override_enabled: false,
            request_timeout_ms: 1000,
            max_clock_skew_ms: 90_000,
        }
    }

    fn feeder() -> (InverterFeeder, SharedSnapshot, Arc<AlertEngine>) {
        let alerts = Arc::new(AlertEngine::new());
        let snapshot = SharedSnapshot::new();
        let cloud =
            Arc::new(CloudPoller::new(test_cloud_cfg(), alerts.clone()).expect("cloud poller"));
        let feeder = InverterFeeder::new(
            test_inverter_cfg(),
            test_transform_cfg(),
            alerts.clone(),
            snapshot.clone(),
            cloud,
        );
        (feeder, snapshot, alerts)
    }

    fn live_image() -> Vec<u16> {
        let mut image = vec![0u16; IMAGE_LEN];
        for (phase, raw) in [2300u32, 2310, 2290].into_iter().enumerate() {
            write_u16(&mut image, REG_VOLTAGE_L1 + phase, raw);
        }
        for (phase, raw) in [50u32, 60, 40].into_iter().enumerate() {
            write_u16(&mut image, REG_CURRENT_L1 + phase, raw);
        }
        image
    }

    #[test]
    fn bank_read_bounds() {
        let regs = vec![1u16, 2, 3, 4];
        assert_eq!(bank_read(&regs, 1, 2).unwrap(), vec![2, 3]);
        assert_eq!(bank_read(&regs, 0, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(bank_read(&regs, 3, 2).is_err());
        assert!(bank_read(&regs, 4, 1).is_err());
    }

    #[test]
    fn service_answers_both_functions_identically() {
        let bank = Arc::new(Mutex::new(RegisterBank::zeroed(8)));
        bank.lock().holding[2] = 42;
        bank.lock().input[2] = 42;
        let service = FeederService { bank, slave_id: 7 };

        let holding = service.call(SlaveRequest {
            slave: 7,
            request: Request::ReadHoldingRegisters(2, 1),
        });
        let input = service.call(SlaveRequest {
            slave: 7,
            request: Request::ReadInputRegisters(2, 1),
        });
        assert_eq!(
            futures::executor::block_on(holding).unwrap(),
            Some(Response::ReadHoldingRegisters(vec![42]))
        );
        assert_eq!(
            futures::executor::block_on(input).unwrap(),
            Some(Response::ReadInputRegisters(vec![42]))
        );
    }

    #[test]
    fn service_ignores_other_slaves_and_rejects_writes() {
        let bank = Arc::new(Mutex::new(RegisterBank::zeroed(8)));
        let service = FeederService { bank, slave_id: 7 };

        let other = service.call(SlaveRequest {
            slave: 9,
            request: Request::ReadHoldingRegisters(0, 1),
        });
        assert_eq!(futures::executor::block_on(other).unwrap(), None);

        let write = service.call(SlaveRequest {
            slave: 7,
            request: Request::WriteSingleRegister(0, 1),
        });
        assert_eq!(
            futures::executor::block_on(write).unwrap_err(),
            ExceptionCode::IllegalFunction
        );
    }

    #[test]
    fn tick_without_snapshot_raises_waiting() {
        let (feeder, _snapshot, alerts) = feeder();
        feeder.force_up();
        feeder.tick().unwrap();

        assert!(alerts.is_active(ALERT_FEEDER_WAITING));
        // Nothing was ever published: bank stays zero, no write recorded.
        assert!(feeder.bank_words(true, 0, 8).iter().all(|w| *w == 0));
        assert_eq!(feeder.last_write_at_ms(), 0);
    }

    #[test]
    fn tick_publishes_pass_through_frame() {
        let (feeder, snapshot, alerts) = feeder();
        feeder.force_up();
        snapshot.publish(MeterSnapshot::new(live_image(), now_ms()));
        feeder.tick().unwrap();

        assert!(!alerts.is_active(ALERT_FEEDER_WAITING));
        assert!(feeder.last_write_at_ms() > 0);
        // Override is disabled in tests: the bank mirrors the meter image.
        assert_eq!(
            feeder.bank_words(true, REG_VOLTAGE_L1, 3),
            vec![2300, 2310, 2290]
        );
        assert_eq!(
            feeder.bank_words(false, REG_CURRENT_L1, 3),
            vec![50, 60, 40]
        );
        let output = feeder.last_output_image().expect("output recorded");
        assert_eq!(output[REG_VOLTAGE_L1], 2300);
    }

    #[test]
    fn stale_snapshot_republishes_last_output() {
        let (feeder, snapshot, alerts) = feeder();
        feeder.force_up();
        snapshot.publish(MeterSnapshot::new(live_image(), now_ms()));
        feeder.tick().unwrap();
        let first_write = feeder.last_write_at_ms();
        let first_output = feeder.last_output_image().unwrap();

        // Next snapshot arrives already ancient.
        snapshot.publish(MeterSnapshot::new(live_image(), now_ms() - 70_000));
        std::thread::sleep(std::time::Duration::from_millis(5));
        feeder.tick().unwrap();

        assert!(alerts.is_active(ALERT_FEEDER_STALE_INPUT));
        assert_eq!(feeder.last_output_image().unwrap(), first_output);
        assert!(feeder.last_write_at_ms() >= first_write);
        assert_eq!(
            feeder.bank_words(true, REG_VOLTAGE_L1, 3),
            vec![2300, 2310, 2290]
        );
    }

    #[test]
    fn fresh_snapshot_resolves_stale_input() {
        let (feeder, snapshot, alerts) = feeder();
        feeder.force_up();
        snapshot.publish(MeterSnapshot::new(live_image(), now_ms() - 70_000));
        feeder.tick().unwrap();
        assert!(alerts.is_active(ALERT_FEEDER_STALE_INPUT));

        snapshot.publish(MeterSnapshot::new(live_image(), now_ms()));
        feeder.tick().unwrap();
        assert!(!alerts.is_active(ALERT_FEEDER_STALE_INPUT));
    }

    #[test]
    fn publish_zeroes_past_frame_end() {
        let (feeder, _snapshot, _alerts) = feeder();
        {
            let mut bank = feeder.bank.lock();
            bank.holding[399] = 77;
            bank.input[399] = 77;
        }
        feeder.publish(vec![9u16; 10], now_ms());
        assert_eq!(feeder.bank_words(true, 0, 1), vec![9]);
        assert_eq!(feeder.bank_words(true, 399, 1), vec![0]);
        assert_eq!(feeder.bank_words(false, 399, 1), vec![0]);
    }

    #[test]
    fn watchdog_waits_for_first_publish() {
        let (feeder, _snapshot, alerts) = feeder();
        feeder.watch_output_staleness().unwrap();
        assert!(!alerts.is_active(ALERT_INVERTER_OUTPUT_STALE));

        feeder
            .last_write_at_ms
            .store(now_ms() - 31_000, Ordering::SeqCst);
        feeder.watch_output_staleness().unwrap();
        assert!(alerts.is_active(ALERT_INVERTER_OUTPUT_STALE));

        feeder.last_write_at_ms.store(now_ms(), Ordering::SeqCst);
        feeder.watch_output_staleness().unwrap();
        assert!(!alerts.is_active(ALERT_INVERTER_OUTPUT_STALE));
    }

    #[tokio::test]
    async fn ensure_open_defers_until_first_frame() {
        let (feeder, snapshot, alerts) = feeder();
        feeder.ensure_open().await.unwrap();
        assert!(!feeder.is_up());
        assert!(!alerts.is_active(ALERT_INVERTER_RTU_DOWN));
        assert!(alerts.is_active(ALERT_FEEDER_WAITING));

        // With a snapshot present the open is attempted; the port does not
        // exist in tests so the down alert fires.
        snapshot.publish(MeterSnapshot::new(live_image(), now_ms()));
        feeder.ensure_open().await.unwrap();
        assert!(!feeder.is_up());
        assert!(alerts.is_active(ALERT_INVERTER_RTU_DOWN));
    }
}
