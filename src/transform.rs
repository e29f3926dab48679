//! Power-control transform.
//!
//! Takes the latest meter image and the compensation set-point and produces
//! the image published to the inverter. Compensation is expressed as extra
//! load: the requested kilowatts are split across the phases that carry a
//! live voltage and added to their current and active-power registers, so
//! the inverter sees the site drawing more than the meter measured.
//!
//! The function is pure. Indices other than the three currents and four
//! power pairs are never touched, so everything else passes through from
//! the meter unchanged.

use crate::codec::{read_i32be, read_u16, write_i32be, write_u16};
use crate::config::TransformConfig;
use crate::registers::{
    MIN_OUTPUT_LEN, REG_CURRENT_L1, REG_POWER_L1, REG_POWER_TOTAL, REG_VOLTAGE_L1,
};
use crate::snapshot::MeterSnapshot;

/// Build the output image for one publish cycle.
///
/// `delta_kw <= 0` (or a non-finite value) yields the meter image verbatim,
/// padded to the minimum output length. A positive set-point against a stale
/// or voltage-dead image zeroes the compensation target registers instead of
/// inventing load the grid cannot see.
pub fn prepare(
    snapshot: Option<&MeterSnapshot>,
    delta_kw: f64,
    cfg: &TransformConfig,
    now_ms: i64,
) -> Vec<u16> {
    let mut out = match snapshot {
        Some(snap) => snap.image.clone(),
        None => Vec::new(),
    };
    if out.len() < MIN_OUTPUT_LEN {
        out.resize(MIN_OUTPUT_LEN, 0);
    }

    if !delta_kw.is_finite() || delta_kw <= 0.0 {
        return out;
    }

    let age_ms = snapshot.map(|s| s.age_ms(now_ms)).unwrap_or(-1);
    let stale = age_ms < 0 || age_ms > cfg.stale_to_zero_ms;

    let volts: Vec<f64> = (0..3)
        .map(|phase| read_u16(&out, REG_VOLTAGE_L1 + phase) as f64 * 0.1 * cfg.scale_pt)
        .collect();
    let meter_dead = volts.iter().all(|v| *v < 1.0);

    if stale || meter_dead {
        zero_compensation_targets(&mut out);
        return out;
    }

    let alive: Vec<usize> = (0..3)
        .filter(|phase| volts[*phase] >= cfg.phase_min_volt)
        .collect();
    if alive.is_empty() {
        zero_compensation_targets(&mut out);
        return out;
    }

    let watts_per_phase = delta_kw * 1000.0 / alive.len() as f64;
    let power_factor = cfg.min_power_factor.clamp(0.1, 1.0);
    let current_lsb = 0.01 * cfg.scale_ct;
    let power_lsb = cfg.scale_pt * cfg.scale_ct;

    for &phase in &alive {
        let amps = read_u16(&out, REG_CURRENT_L1 + phase) as f64 * current_lsb;
        let extra_amps =
            watts_per_phase.abs() / (volts[phase] * power_factor).max(cfg.safe_div_min_volt);
        let raw_amps = ((amps + extra_amps) / current_lsb)
            .round()
            .clamp(0.0, u16::MAX as f64);
        write_u16(&mut out, REG_CURRENT_L1 + phase, raw_amps as u32);

        let watts = read_i32be(&out, REG_POWER_L1 + 2 * phase) as f64 * power_lsb;
        let raw_watts = ((watts + watts_per_phase) / power_lsb)
            .round()
            .clamp(i32::MIN as f64, i32::MAX as f64);
        write_i32be(&mut out, REG_POWER_L1 + 2 * phase, raw_watts as i32);
    }

    let total_extra = watts_per_phase * alive.len() as f64;
    let total_watts = read_i32be(&out, REG_POWER_TOTAL) as f64 * power_lsb;
    let raw_total = ((total_watts + total_extra) / power_lsb)
        .round()
        .clamp(i32::MIN as f64, i32::MAX as f64);
    write_i32be(&mut out, REG_POWER_TOTAL, raw_total as i32);

    out
}

/// Zero the registers compensation would otherwise have written.
fn zero_compensation_targets(out: &mut [u16]) {
    for phase in 0..3 {
        write_u16(out, REG_CURRENT_L1 + phase, 0);
        write_i32be(out, REG_POWER_L1 + 2 * phase, 0);
    }
    write_i32be(out, REG_POWER_TOTAL, 0);
}
