//! Raw sample decoding and unit scaling.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{ConfigurationError, HardwareError};

/// Expected Vshunt scale (mV per LSB). Anything else points at a firmware/file-system problem.
pub const REFERENCE_VSHUNT_SCALE: f64 = 0.0025;

const NS_PER_MS: f64 = 1_000_000.0;
const SCALE_TOLERANCE: f64 = 1e-12;

/// What to do with the device-reported Vshunt scale.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum VshuntScalePolicy {
    /// Refuse to start on anything but the reference scale.
    #[default]
    Strict,
    /// Keep whatever the device reports, warning on a mismatch.
    AcceptDevice,
    /// Replace the device scale with this value.
    Force(f64),
}

/// Multiply every raw sample by `factor`.
pub fn scale<T: Copy + Into<f64>>(raw: &[T], factor: f64) -> Vec<f64> {
    raw.iter().map(|&v| v.into() * factor).collect()
}

/// Decide the Vshunt scale to use, once, at configuration time.
pub fn validate_vshunt_scale(
    device_scale: f64,
    policy: VshuntScalePolicy,
) -> Result<f64, ConfigurationError> {
    let matches = (device_scale - REFERENCE_VSHUNT_SCALE).abs() < SCALE_TOLERANCE;
    match policy {
        VshuntScalePolicy::Strict if matches => Ok(device_scale),
        VshuntScalePolicy::Strict => Err(ConfigurationError::ScaleMismatch {
            found: device_scale,
            expected: REFERENCE_VSHUNT_SCALE,
        }),
        VshuntScalePolicy::AcceptDevice => {
            if !matches {
                warn!(
                    "suspicious Vshunt scale {} (expected {}), using it anyway; measurements may be wrong",
                    device_scale, REFERENCE_VSHUNT_SCALE
                );
            }
            Ok(device_scale)
        }
        VshuntScalePolicy::Force(forced) => {
            if matches {
                info!("forcing Vshunt scale to {}", forced);
            } else {
                warn!(
                    "suspicious Vshunt scale {} (expected {}), forcing {}",
                    device_scale, REFERENCE_VSHUNT_SCALE, forced
                );
            }
            Ok(forced)
        }
    }
}

fn check_alignment(bytes: &[u8], width: usize) -> Result<(), HardwareError> {
    if bytes.len() % width != 0 {
        return Err(HardwareError::Misaligned {
            len: bytes.len(),
            width,
        });
    }
    Ok(())
}

/// Decode little-endian 2-byte signed voltage samples.
pub fn decode_i16_le(bytes: &[u8]) -> Result<Vec<i16>, HardwareError> {
    check_alignment(bytes, 2)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// Decode little-endian 8-byte signed timestamp samples.
pub fn decode_i64_le(bytes: &[u8]) -> Result<Vec<i64>, HardwareError> {
    check_alignment(bytes, 8)?;
    Ok(bytes
        .chunks_exact(8)
        .map(|c| {
            let mut word = [0u8; 8];
            word.copy_from_slice(c);
            i64::from_le_bytes(word)
        })
        .collect())
}

/// Convert a nanosecond timestamp, already rebased on `origin_ns`, to milliseconds.
///
/// The subtraction happens on integers so absolute device timestamps keep their precision.
/// Garbage timestamps saturate instead of overflowing.
#[inline]
pub fn ns_to_ms(time_ns: i64, origin_ns: i64) -> f64 {
    time_ns.saturating_sub(origin_ns) as f64 / NS_PER_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_raw_samples() {
        let raw: [i16; 3] = [0, 400, -400];
        assert_eq!(scale(&raw, 0.0025), vec![0.0, 1.0, -1.0]);
    }

    #[test]
    fn reference_scale_is_accepted() {
        let scale = validate_vshunt_scale(0.0025, VshuntScalePolicy::Strict).unwrap();
        assert_eq!(scale, 0.0025);
    }

    #[test]
    fn mismatched_scale_fails_without_override() {
        let err = validate_vshunt_scale(0.0030, VshuntScalePolicy::Strict).unwrap_err();
        assert!(matches!(err, ConfigurationError::ScaleMismatch { .. }));
    }

    #[test]
    fn forced_scale_replaces_mismatch() {
        let scale = validate_vshunt_scale(0.0030, VshuntScalePolicy::Force(0.0025)).unwrap();
        assert_eq!(scale, 0.0025);
    }

    #[test]
    fn accept_device_keeps_reported_scale() {
        let scale = validate_vshunt_scale(0.0030, VshuntScalePolicy::AcceptDevice).unwrap();
        assert_eq!(scale, 0.0030);
    }

    #[test]
    fn decodes_little_endian_words() {
        let bytes = [0x01, 0x00, 0xff, 0xff, 0x00, 0x80];
        assert_eq!(decode_i16_le(&bytes).unwrap(), vec![1, -1, i16::MIN]);

        let mut ts = Vec::new();
        ts.extend_from_slice(&1_000_000i64.to_le_bytes());
        ts.extend_from_slice(&(-5i64).to_le_bytes());
        assert_eq!(decode_i64_le(&ts).unwrap(), vec![1_000_000, -5]);
    }

    #[test]
    fn rejects_misaligned_buffers() {
        assert!(matches!(
            decode_i16_le(&[0, 1, 2]),
            Err(HardwareError::Misaligned { len: 3, width: 2 })
        ));
        assert!(decode_i64_le(&[0; 12]).is_err());
    }

    #[test]
    fn rebased_time_keeps_precision() {
        let origin = 1_700_000_000_000_000_000i64;
        assert_eq!(ns_to_ms(origin + 2_500_000, origin), 2.5);
        assert_eq!(ns_to_ms(3_000_000, 0), 3.0);
    }

    #[test]
    fn out_of_range_timestamps_saturate() {
        assert_eq!(ns_to_ms(i64::MIN, 1), i64::MIN as f64 / NS_PER_MS);
        assert_eq!(ns_to_ms(i64::MAX, -1), i64::MAX as f64 / NS_PER_MS);
    }
}
