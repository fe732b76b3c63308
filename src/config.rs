//! Typed capture configuration.

use serde::{Deserialize, Serialize};

use crate::power::{self, PowerMode, VbatSource};
use crate::scaler::VshuntScalePolicy;

/// Experimental sampling limit of the shared I2C bus, split across all probes.
pub const DEFAULT_BUS_LIMIT_HZ: f64 = 800.0;
pub const DEFAULT_MIN_BLOCK_SIZE: usize = 64;
/// Gap, in nominal sample periods, above which sample loss is suspected.
pub const DEFAULT_LOSS_THRESHOLD_PERIODS: f64 = 6.0;
pub const DEFAULT_TIMING_WINDOW: usize = 10;
pub const DEFAULT_INTEGRATION_TIME: &str = "0.000588";
pub const DEFAULT_OVERSAMPLING_RATIO: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub bus_limit_hz: f64,
    pub min_block_size: usize,
    pub loss_threshold_periods: f64,
    pub timing_window: usize,
    pub integration_time: String,
    pub oversampling_ratio: u32,
    /// Rebase timestamps so each capture starts at zero.
    pub relative_time: bool,
    pub mode: PowerMode,
    /// Use this battery voltage (V) instead of measuring it.
    pub fixed_vbat_volts: Option<f64>,
    /// Per-device shunt override (mΩ), by device index; `None` or 0 means no override.
    pub shunt_overrides_mohm: Vec<Option<u32>>,
    pub vshunt_scale: VshuntScalePolicy,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            bus_limit_hz: DEFAULT_BUS_LIMIT_HZ,
            min_block_size: DEFAULT_MIN_BLOCK_SIZE,
            loss_threshold_periods: DEFAULT_LOSS_THRESHOLD_PERIODS,
            timing_window: DEFAULT_TIMING_WINDOW,
            integration_time: DEFAULT_INTEGRATION_TIME.to_string(),
            oversampling_ratio: DEFAULT_OVERSAMPLING_RATIO,
            relative_time: true,
            mode: PowerMode::default(),
            fixed_vbat_volts: None,
            shunt_overrides_mohm: Vec::new(),
            vshunt_scale: VshuntScalePolicy::default(),
        }
    }
}

impl AcquisitionConfig {
    pub fn shunt_override(&self, index: usize) -> Option<u32> {
        self.shunt_overrides_mohm
            .get(index)
            .copied()
            .flatten()
            .filter(|&mohm| mohm > 0)
    }

    /// Measured Vbat unless a fixed voltage was given.
    pub fn vbat_source(&self) -> VbatSource {
        match self.fixed_vbat_volts {
            None => VbatSource::Measured,
            Some(volts) => VbatSource::Fixed(power::fixed_vbat_mv(volts)),
        }
    }
}

/// Parse a comma separated list of shunt values (mΩ), one per device starting at index 0.
///
/// Empty entries and zeros leave that device without an override.
pub fn parse_shunt_list(list: &str) -> Result<Vec<Option<u32>>, std::num::ParseIntError> {
    list.split(',')
        .map(str::trim)
        .map(|entry| {
            if entry.is_empty() {
                Ok(None)
            } else {
                entry.parse::<u32>().map(|v| Some(v).filter(|&v| v > 0))
            }
        })
        .collect()
}
