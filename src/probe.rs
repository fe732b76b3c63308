//! Hardware channel interface of a power probe.
//!
//! A probe exposes named device attributes, a fixed set of measurement channels and a
//! buffered readout: `refill()` captures one block of samples for every enabled channel,
//! after which `read_channel()` hands out the raw little-endian bytes of each channel.
//! Timestamps are 8-byte signed integers (nanoseconds), voltages 2-byte signed integers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::HardwareError;

/// Device attribute names understood by the acquisition loop.
pub mod attrs {
    pub const SAMPLING_FREQUENCY: &str = "in_sampling_frequency";
    pub const OVERSAMPLING_RATIO: &str = "in_oversampling_ratio";
    pub const ALLOW_ASYNC_READOUT: &str = "in_allow_async_readout";
    pub const SHUNT_RESISTOR: &str = "in_shunt_resistor";
    pub const ACTIVE: &str = "in_active";
    pub const INTEGRATION_TIME_AVAILABLE: &str = "integration_time_available";

    // channel attributes
    pub const SCALE: &str = "scale";
    pub const INTEGRATION_TIME: &str = "integration_time";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Vshunt,
    Vbat,
    Time,
    Ishunt,
    Power,
}

impl ChannelKind {
    /// Channel identifier on the device side.
    pub fn hw_name(self) -> &'static str {
        match self {
            ChannelKind::Vshunt => "voltage0",
            ChannelKind::Vbat => "voltage1",
            ChannelKind::Time => "timestamp",
            ChannelKind::Ishunt => "current3",
            ChannelKind::Power => "power2",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChannelKind::Vshunt => "Vshunt",
            ChannelKind::Vbat => "Vbat",
            ChannelKind::Time => "Time",
            ChannelKind::Ishunt => "Ishunt",
            ChannelKind::Power => "Power",
        };
        write!(f, "{} ({})", label, self.hw_name())
    }
}

/// One physical probe (channel group).
///
/// Implementations must be `Send`: each probe is moved into its own acquisition thread.
pub trait Probe: Send {
    fn id(&self) -> &str;
    fn name(&self) -> &str;

    fn attr(&self, name: &str) -> Option<String>;
    fn write_attr(&mut self, name: &str, value: &str) -> Result<(), HardwareError>;

    fn has_channel(&self, channel: ChannelKind) -> bool;
    fn channel_attr(&self, channel: ChannelKind, name: &str) -> Option<String>;
    fn write_channel_attr(
        &mut self,
        channel: ChannelKind,
        name: &str,
        value: &str,
    ) -> Result<(), HardwareError>;
    fn enable_channel(&mut self, channel: ChannelKind) -> Result<(), HardwareError>;

    /// Block until `samples` samples are captured on every enabled channel.
    fn refill(&mut self, samples: usize) -> Result<(), HardwareError>;
    /// Raw bytes of the last refilled block for `channel`.
    fn read_channel(&mut self, channel: ChannelKind) -> Result<Vec<u8>, HardwareError>;
}

impl<P: Probe + ?Sized> Probe for Box<P> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn attr(&self, name: &str) -> Option<String> {
        (**self).attr(name)
    }

    fn write_attr(&mut self, name: &str, value: &str) -> Result<(), HardwareError> {
        (**self).write_attr(name, value)
    }

    fn has_channel(&self, channel: ChannelKind) -> bool {
        (**self).has_channel(channel)
    }

    fn channel_attr(&self, channel: ChannelKind, name: &str) -> Option<String> {
        (**self).channel_attr(channel, name)
    }

    fn write_channel_attr(
        &mut self,
        channel: ChannelKind,
        name: &str,
        value: &str,
    ) -> Result<(), HardwareError> {
        (**self).write_channel_attr(channel, name, value)
    }

    fn enable_channel(&mut self, channel: ChannelKind) -> Result<(), HardwareError> {
        (**self).enable_channel(channel)
    }

    fn refill(&mut self, samples: usize) -> Result<(), HardwareError> {
        (**self).refill(samples)
    }

    fn read_channel(&mut self, channel: ChannelKind) -> Result<Vec<u8>, HardwareError> {
        (**self).read_channel(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_hw_name() {
        assert_eq!(ChannelKind::Vshunt.to_string(), "Vshunt (voltage0)");
        assert_eq!(ChannelKind::Time.to_string(), "Time (timestamp)");
    }
}
