//! Read-side aggregation of everything an operator wants on one screen.
//!
//! Pure functions over the latest snapshot, output frame and cloud fields;
//! nothing here holds locks beyond cloning the inputs out.

use serde::Serialize;

use crate::cloud::CloudReading;
use crate::config::TransformConfig;
use crate::registers::{
    decode_current, decode_frequency_hz, decode_phase_power_w, decode_total_power_w,
    decode_voltage,
};
use crate::snapshot::MeterSnapshot;
use crate::util::format_age;

/// Meter freshness bound for reporting the system UP.
const HEALTHY_METER_AGE_MS: i64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Health {
    Up,
    Degraded,
}

/// Flat record consumed by the UI and health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub meter_volts: [f64; 3],
    pub meter_amps: [f64; 3],
    pub meter_phase_power_w: [f64; 3],
    pub meter_total_power_w: f64,
    pub meter_frequency_hz: f64,
    pub meter_port_state: String,
    pub sm_age_ms: i64,
    pub sm_age: String,

    pub out_amps: [f64; 3],
    pub out_total_power_w: f64,
    pub out_age_ms: i64,
    pub out_age: String,
    pub inverter_up: bool,

    pub delta_kw: f64,
    pub psum_kw: Option<f64>,
    pub min_import_kw: f64,
    pub grid_import_kw: f64,
    pub override_enabled: bool,
    pub compensating: bool,

    pub pv_kw: Option<f64>,
    pub load_kw: Option<f64>,
    pub cloud_state: String,
    pub cloud_alarm: bool,
}

pub struct StatusInputs<'a> {
    pub snapshot: &'a MeterSnapshot,
    pub meter_port_state: String,
    pub output: Option<&'a [u16]>,
    pub last_write_at_ms: i64,
    pub inverter_up: bool,
    pub reading: Option<&'a CloudReading>,
    pub delta_kw: f64,
    pub override_enabled: bool,
    pub min_import_kw: f64,
    pub transform: &'a TransformConfig,
    pub now_ms: i64,
}

pub fn assemble(inputs: StatusInputs<'_>) -> StatusReport {
    let StatusInputs {
        snapshot,
        meter_port_state,
        output,
        last_write_at_ms,
        inverter_up,
        reading,
        delta_kw,
        override_enabled,
        min_import_kw,
        transform,
        now_ms,
    } = inputs;

    let pt = transform.scale_pt;
    let ct = transform.scale_ct;

    let meter_volts = [0, 1, 2].map(|phase| decode_voltage(&snapshot.image, phase, pt));
    let meter_amps = [0, 1, 2].map(|phase| decode_current(&snapshot.image, phase, ct));
    let meter_phase_power_w =
        [0, 1, 2].map(|phase| decode_phase_power_w(&snapshot.image, phase, pt, ct));
    let meter_total_power_w = decode_total_power_w(&snapshot.image, pt, ct);
    let meter_frequency_hz = decode_frequency_hz(&snapshot.image);
    let sm_age_ms = snapshot.age_ms(now_ms);

    let (out_amps, out_total_power_w) = match output {
        Some(frame) => (
            [0, 1, 2].map(|phase| decode_current(frame, phase, ct)),
            decode_total_power_w(frame, pt, ct),
        ),
        None => ([0.0; 3], 0.0),
    };
    let out_age_ms = if last_write_at_ms > 0 {
        (now_ms - last_write_at_ms).max(0)
    } else {
        -1
    };

    let psum_kw = reading.map(|r| r.psum_kw);
    let grid_import_kw = psum_kw.map(|psum| (-psum).max(0.0)).unwrap_or(0.0);
    let cloud_state = match reading.and_then(|r| r.state) {
        Some(1) => "ONLINE",
        Some(2) => "OFFLINE",
        Some(3) => "ALARM",
        _ => "-",
    }
    .to_string();
    let cloud_alarm = reading.is_some_and(|r| {
        r.state.is_some_and(|state| state == 3) || r.warning_info.is_some_and(|w| w != 0)
    });

    StatusReport {
        meter_volts,
        meter_amps,
        meter_phase_power_w,
        meter_total_power_w,
        meter_frequency_hz,
        meter_port_state,
        sm_age_ms,
        sm_age: format_age(sm_age_ms),
        out_amps,
        out_total_power_w,
        out_age_ms,
        out_age: format_age(out_age_ms),
        inverter_up,
        delta_kw,
        psum_kw,
        min_import_kw,
        grid_import_kw,
        override_enabled,
        compensating: delta_kw > 0.0,
        pv_kw: reading.and_then(|r| r.pv_kw),
        load_kw: reading.and_then(|r| r.load_kw),
        cloud_state,
        cloud_alarm,
    }
}

/// UP only while the cloud sees the inverter online and the meter image is
/// fresh; everything else is DEGRADED.
pub fn health(reading: Option<&CloudReading>, sm_age_ms: i64) -> Health {
    let cloud_online = reading.is_some_and(|r| r.state == Some(1));
    let meter_fresh = (0..=HEALTHY_METER_AGE_MS).contains(&sm_age_ms);
    if cloud_online && meter_fresh {
        Health::Up
    } else {
        Health::Degraded
    }
}
