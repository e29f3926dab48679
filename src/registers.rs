//! Register map of the Acrel three-phase meter, in native units.
//!
//! The register image mirrors the meter's own addressing: index N of the
//! image holds register N, so untouched indices pass upstream values through
//! unchanged. Scalings follow the meter datasheet; PT/CT ratios are applied
//! on top of the raw word.

use crate::codec::{read_i32be, read_u16};

/// Phase voltages L1..L3, u16, 0.1 V per LSB (before PT).
pub const REG_VOLTAGE_L1: usize = 97;
/// Phase currents L1..L3, u16, 0.01 A per LSB (before CT).
pub const REG_CURRENT_L1: usize = 100;
/// Grid frequency, u16, 0.01 Hz per LSB.
pub const REG_FREQUENCY: usize = 119;
/// Per-phase active power L1..L3, signed 32-bit big-endian pairs at
/// 356/357, 358/359, 360/361; raw value is W / (PT * CT).
pub const REG_POWER_L1: usize = 356;
/// Total active power, same encoding, at 362/363.
pub const REG_POWER_TOTAL: usize = 362;

/// Working length of the mirrored image.
pub const IMAGE_LEN: usize = 400;
/// Smallest image an augmented output frame may have; covers the last
/// power pair at 362/363.
pub const MIN_OUTPUT_LEN: usize = 364;

pub fn decode_voltage(image: &[u16], phase: usize, scale_pt: f64) -> f64 {
    read_u16(image, REG_VOLTAGE_L1 + phase) as f64 * 0.1 * scale_pt
}

pub fn decode_current(image: &[u16], phase: usize, scale_ct: f64) -> f64 {
    read_u16(image, REG_CURRENT_L1 + phase) as f64 * 0.01 * scale_ct
}

pub fn decode_phase_power_w(image: &[u16], phase: usize, scale_pt: f64, scale_ct: f64) -> f64 {
    read_i32be(image, REG_POWER_L1 + 2 * phase) as f64 * scale_pt * scale_ct
}

pub fn decode_total_power_w(image: &[u16], scale_pt: f64, scale_ct: f64) -> f64 {
    read_i32be(image, REG_POWER_TOTAL) as f64 * scale_pt * scale_ct
}

pub fn decode_frequency_hz(image: &[u16]) -> f64 {
    read_u16(image, REG_FREQUENCY) as f64 * 0.01
}
