//! Simulated ACME probe, for demos and tests without hardware.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::trace;

use crate::errors::HardwareError;
use crate::probe::{attrs, ChannelKind, Probe};

const DEFAULT_FREQUENCY: &str = "800";
const DEFAULT_SHUNT_UOHM: &str = "100000";
const INTEGRATION_TIMES: &str =
    "0.000140 0.000204 0.000332 0.000588 0.001100 0.002116 0.004156 0.008244";

/// 10 mV at the reference scale.
const VSHUNT_RAW_BASE: i16 = 4000;
/// 3700 mV at 1.25 mV/LSB.
const VBAT_RAW: i16 = 2960;

#[derive(Debug, Default)]
struct Block {
    time_ns: Vec<i64>,
    vshunt: Vec<i16>,
    vbat: Vec<i16>,
}

/// Deterministic probe producing evenly spaced samples.
///
/// Timestamps advance by one sample period per sample; a gap can be injected after a given
/// block, and the probe can be told to fail once a number of blocks were emitted.
#[derive(Debug)]
pub struct SimulatedProbe {
    id: String,
    name: String,
    attrs: HashMap<String, String>,
    channel_attrs: HashMap<(ChannelKind, String), String>,
    channels: HashSet<ChannelKind>,
    enabled: HashSet<ChannelKind>,
    rate_hz: Option<f64>,
    next_ns: i64,
    sample_index: u64,
    pace: Option<Duration>,
    gap: Option<(usize, u64)>,
    fail_after: Option<usize>,
    emitted: Arc<AtomicUsize>,
    block: Block,
}

impl SimulatedProbe {
    /// A probe shaped like an ACME INA226 channel, `index` giving its enumeration slot.
    pub fn acme(index: usize) -> Self {
        let attrs = [
            (attrs::SAMPLING_FREQUENCY, DEFAULT_FREQUENCY),
            (attrs::OVERSAMPLING_RATIO, "4"),
            (attrs::ALLOW_ASYNC_READOUT, "1"),
            (attrs::SHUNT_RESISTOR, DEFAULT_SHUNT_UOHM),
            (attrs::ACTIVE, "1"),
            (attrs::INTEGRATION_TIME_AVAILABLE, INTEGRATION_TIMES),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut channel_attrs = HashMap::new();
        channel_attrs.insert((ChannelKind::Vshunt, attrs::SCALE.to_string()), "0.0025".to_string());
        channel_attrs.insert((ChannelKind::Vbat, attrs::SCALE.to_string()), "1.25".to_string());
        channel_attrs.insert((ChannelKind::Ishunt, attrs::SCALE.to_string()), "1".to_string());
        channel_attrs.insert((ChannelKind::Power, attrs::SCALE.to_string()), "25".to_string());
        for ch in [ChannelKind::Vshunt, ChannelKind::Vbat] {
            channel_attrs.insert((ch, attrs::INTEGRATION_TIME.to_string()), "0.001100".to_string());
        }

        let channels = [
            ChannelKind::Vshunt,
            ChannelKind::Vbat,
            ChannelKind::Time,
            ChannelKind::Ishunt,
            ChannelKind::Power,
        ]
        .into_iter()
        .collect();

        Self {
            id: format!("iio:device{}", index),
            name: "ina226".to_string(),
            attrs,
            channel_attrs,
            channels,
            enabled: HashSet::new(),
            rate_hz: None,
            next_ns: 1_000_000_000 * (1 + index as i64),
            sample_index: 0,
            pace: None,
            gap: None,
            fail_after: None,
            emitted: Arc::new(AtomicUsize::new(0)),
            block: Block::default(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }

    pub fn without_attr(mut self, name: &str) -> Self {
        self.attrs.remove(name);
        self
    }

    pub fn with_channel_attr(mut self, channel: ChannelKind, name: &str, value: &str) -> Self {
        self.channel_attrs
            .insert((channel, name.to_string()), value.to_string());
        self
    }

    pub fn without_channel(mut self, channel: ChannelKind) -> Self {
        self.channels.remove(&channel);
        self
    }

    /// Spacing of the generated timestamps; defaults to the reported sampling frequency.
    pub fn with_rate(mut self, rate_hz: f64) -> Self {
        self.rate_hz = Some(rate_hz);
        self
    }

    /// Sleep this long in every refill, standing in for the hardware wait.
    pub fn with_pacing(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Skip `missing` samples worth of time right after block number `after_block` (1-based).
    pub fn with_gap(mut self, after_block: usize, missing: u64) -> Self {
        self.gap = Some((after_block, missing));
        self
    }

    /// Fail every refill once `blocks` blocks were emitted.
    pub fn fail_after(mut self, blocks: usize) -> Self {
        self.fail_after = Some(blocks);
        self
    }

    /// Shared count of blocks handed out by `refill`.
    pub fn emitted_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.emitted)
    }

    pub fn is_enabled(&self, channel: ChannelKind) -> bool {
        self.enabled.contains(&channel)
    }

    fn period_ns(&self) -> i64 {
        let rate = self.rate_hz.unwrap_or_else(|| {
            self.attrs
                .get(attrs::SAMPLING_FREQUENCY)
                .and_then(|v| v.parse().ok())
                .unwrap_or(800.0)
        });
        (1e9 / rate.max(1.0)) as i64
    }
}

impl Probe for SimulatedProbe {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn attr(&self, name: &str) -> Option<String> {
        self.attrs.get(name).cloned()
    }

    fn write_attr(&mut self, name: &str, value: &str) -> Result<(), HardwareError> {
        match self.attrs.get_mut(name) {
            Some(slot) => {
                trace!("{}: {} = {}", self.id, name, value);
                *slot = value.to_string();
                Ok(())
            }
            None => Err(HardwareError::Attribute {
                name: name.to_string(),
                reason: "no such attribute".into(),
            }),
        }
    }

    fn has_channel(&self, channel: ChannelKind) -> bool {
        self.channels.contains(&channel)
    }

    fn channel_attr(&self, channel: ChannelKind, name: &str) -> Option<String> {
        self.channel_attrs.get(&(channel, name.to_string())).cloned()
    }

    fn write_channel_attr(
        &mut self,
        channel: ChannelKind,
        name: &str,
        value: &str,
    ) -> Result<(), HardwareError> {
        match self.channel_attrs.get_mut(&(channel, name.to_string())) {
            Some(slot) => {
                *slot = value.to_string();
                Ok(())
            }
            None => Err(HardwareError::Attribute {
                name: format!("{}/{}", channel.hw_name(), name),
                reason: "no such attribute".into(),
            }),
        }
    }

    fn enable_channel(&mut self, channel: ChannelKind) -> Result<(), HardwareError> {
        if !self.channels.contains(&channel) {
            return Err(HardwareError::Attribute {
                name: channel.hw_name().to_string(),
                reason: "no such channel".into(),
            });
        }
        self.enabled.insert(channel);
        Ok(())
    }

    fn refill(&mut self, samples: usize) -> Result<(), HardwareError> {
        let emitted = self.emitted.load(Ordering::SeqCst);
        if self.fail_after.is_some_and(|limit| emitted >= limit) {
            return Err(HardwareError::Disconnected(format!(
                "{} stopped responding",
                self.id
            )));
        }
        if let Some(pace) = self.pace {
            thread::sleep(pace);
        }

        let period = self.period_ns();
        let mut block = Block {
            time_ns: Vec::with_capacity(samples),
            vshunt: Vec::with_capacity(samples),
            vbat: Vec::with_capacity(samples),
        };
        for _ in 0..samples {
            block.time_ns.push(self.next_ns);
            block.vshunt.push(VSHUNT_RAW_BASE + (self.sample_index % 32) as i16);
            block.vbat.push(VBAT_RAW);
            self.next_ns += period;
            self.sample_index += 1;
        }
        self.block = block;

        let emitted = self.emitted.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, missing)) = self.gap {
            if after == emitted {
                self.next_ns += period * missing as i64;
            }
        }
        Ok(())
    }

    fn read_channel(&mut self, channel: ChannelKind) -> Result<Vec<u8>, HardwareError> {
        if !self.enabled.contains(&channel) {
            return Err(HardwareError::NotEnabled(channel));
        }
        let bytes = match channel {
            ChannelKind::Time => self
                .block
                .time_ns
                .iter()
                .flat_map(|t| t.to_le_bytes())
                .collect(),
            ChannelKind::Vshunt => self.block.vshunt.iter().flat_map(|v| v.to_le_bytes()).collect(),
            ChannelKind::Vbat => self.block.vbat.iter().flat_map(|v| v.to_le_bytes()).collect(),
            ChannelKind::Ishunt | ChannelKind::Power => vec![0u8; self.block.time_ns.len() * 2],
        };
        Ok(bytes)
    }
}
