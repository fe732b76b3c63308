//! Power and current derivation from shunt measurements.

use serde::{Deserialize, Serialize};

/// Shunt resistance used when neither the user nor the device provides one.
pub const DEFAULT_RSHUNT_MOHM: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerMode {
    /// mW = mV × mV / mΩ
    #[default]
    Power,
    /// mA = mV × 1000 / mΩ
    Current,
}

impl PowerMode {
    pub fn label(self) -> &'static str {
        match self {
            PowerMode::Power => "Power (mW)",
            PowerMode::Current => "Ishunt (mA)",
        }
    }
}

/// Where the battery voltage comes from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum VbatSource {
    Measured,
    /// Constant value in millivolts.
    Fixed(f64),
}

/// Convert a user-supplied battery voltage (V) to millivolts, whole millivolts only.
pub fn fixed_vbat_mv(volts: f64) -> f64 {
    (volts * 1000.0).round()
}

/// `rshunt_mohm` must be non-zero; configuration guarantees it.
#[inline]
pub fn compute(vshunt_mv: f64, vbat_mv: f64, rshunt_mohm: u32, mode: PowerMode) -> f64 {
    let rshunt = f64::from(rshunt_mohm);
    match mode {
        PowerMode::Current => vshunt_mv * 1000.0 / rshunt,
        PowerMode::Power => vshunt_mv * vbat_mv / rshunt,
    }
}

/// Element-wise [`compute`] over a block.
pub fn compute_block(vshunt_mv: &[f64], vbat_mv: &[f64], rshunt_mohm: u32, mode: PowerMode) -> Vec<f64> {
    vshunt_mv
        .iter()
        .zip(vbat_mv)
        .map(|(&vs, &vb)| compute(vs, vb, rshunt_mohm, mode))
        .collect()
}
