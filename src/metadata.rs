//! Probe metadata not exposed through the hardware channel interface
//! (display name, serial number, power switch).
//!
//! The info service answers with a free-form text per probe, e.g.
//! `PowerProbe JACK (ACME v2)\nSerial Number: 12345\nHas Power Switch`. Its transport is
//! outside this crate; resolvers hand the text to [`parse_probe_info`].

use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::MetadataError;

const NAME_PREFIX: &str = "PowerProbe ";
const SERIAL_PREFIX: &str = "Serial Number: ";
const POWER_SWITCH_MARKER: &str = "Has Power Switch";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProbeMetadata {
    /// Empty when unknown.
    pub name: String,
    pub serial: Option<String>,
    pub has_power_switch: bool,
}

pub trait MetadataResolver: Send + Sync {
    /// Metadata of the probe at `index` (0-based, in enumeration order).
    fn info(&self, index: usize) -> Result<ProbeMetadata, MetadataError>;
}

/// Resolver for setups without an info service.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetadata;

impl MetadataResolver for NoMetadata {
    fn info(&self, _index: usize) -> Result<ProbeMetadata, MetadataError> {
        Err(MetadataError::Unavailable("no info service configured".into()))
    }
}

/// Resolver over info texts collected ahead of time, one per probe.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    infos: Vec<String>,
}

impl StaticMetadata {
    pub fn new(infos: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            infos: infos.into_iter().map(Into::into).collect(),
        }
    }
}

impl MetadataResolver for StaticMetadata {
    fn info(&self, index: usize) -> Result<ProbeMetadata, MetadataError> {
        self.infos
            .get(index)
            .map(|text| parse_probe_info(text))
            .ok_or(MetadataError::UnknownIndex(index))
    }
}

/// Query `resolver`, falling back to empty metadata when it fails.
pub fn resolve_or_default(resolver: &dyn MetadataResolver, index: usize) -> ProbeMetadata {
    match resolver.info(index) {
        Ok(meta) => meta,
        Err(e) => {
            debug!("no metadata for device {}: {}", index, e);
            ProbeMetadata::default()
        }
    }
}

/// Extract name, serial number and power switch capability from an info text.
pub fn parse_probe_info(text: &str) -> ProbeMetadata {
    let name = text
        .lines()
        .next()
        .and_then(|line| line.strip_prefix(NAME_PREFIX))
        .and_then(|rest| {
            // name runs up to the last " (" of the line
            let end = rest.rfind(" (")?;
            (end > 0).then(|| rest[..end].to_string())
        })
        .unwrap_or_default();

    let serial = text.find(SERIAL_PREFIX).and_then(|pos| {
        text[pos + SERIAL_PREFIX.len()..]
            .split_whitespace()
            .next()
            .map(str::to_string)
    });

    ProbeMetadata {
        name,
        serial,
        has_power_switch: text.contains(POWER_SWITCH_MARKER),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_INFO: &str =
        "PowerProbe USB (ACME)\nShunt: 100 mOhm\nSerial Number: 0A1B2C\nHas Power Switch\n";

    #[test]
    fn parses_full_info() {
        let meta = parse_probe_info(FULL_INFO);
        assert_eq!(meta.name, "USB");
        assert_eq!(meta.serial.as_deref(), Some("0A1B2C"));
        assert!(meta.has_power_switch);
    }

    #[test]
    fn name_runs_to_last_parenthesis() {
        let meta = parse_probe_info("PowerProbe Jack (A) rev (B)");
        assert_eq!(meta.name, "Jack (A) rev");
        assert_eq!(meta.serial, None);
        assert!(!meta.has_power_switch);
    }

    #[test]
    fn unrelated_text_yields_defaults() {
        assert_eq!(parse_probe_info("probe offline"), ProbeMetadata::default());
    }

    #[test]
    fn unavailable_service_degrades() {
        assert_eq!(resolve_or_default(&NoMetadata, 0), ProbeMetadata::default());

        let resolver = StaticMetadata::new([FULL_INFO]);
        assert_eq!(resolve_or_default(&resolver, 0).name, "USB");
        assert_eq!(resolve_or_default(&resolver, 3), ProbeMetadata::default());
    }
}
