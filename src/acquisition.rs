//! Per-device acquisition: one-off configuration, then the block loop.
//!
//! # Lifecycle
//!
//! `Configuring → Running → Stopping → Stopped`. [`configure_device`] runs once on the
//! caller's thread and turns a probe into a [`DeviceConfig`]; [`DeviceLoop::run`] then
//! repeats, on the device's own thread:
//!
//! 1. apply pending [`DeviceCommand`]s (shunt, fixed Vbat, power switch)
//! 2. refill one block and read every enabled channel
//! 3. scale the raw samples and compute power or current
//! 4. under the buffer lock: rebase time, check the gap with the previous block, append
//! 5. update timing statistics and the published [`DeviceStatus`]
//!
//! The stop flag is checked before each block only, so a block being read is always
//! completed and appended.
//!
//! # Timing
//!
//! Device timestamps are nanoseconds. Rebasing on the capture origin is done on integers
//! before converting to milliseconds; absolute timestamps do not fit an `f64` exactly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use log::{debug, error, info, trace, warn};
use serde::Serialize;

use crate::buffer::{SampleBuffer, SampleRow};
use crate::config::AcquisitionConfig;
use crate::errors::{AcquisitionError, ConfigurationError, HardwareError, Result};
use crate::metadata::{resolve_or_default, MetadataResolver, ProbeMetadata};
use crate::power::{self, PowerMode, VbatSource, DEFAULT_RSHUNT_MOHM};
use crate::probe::{attrs, ChannelKind, Probe};
use crate::scaler::{self, decode_i16_le, decode_i64_le, ns_to_ms};
use crate::timing::{estimate_frequency, TimingStats};

// ============================================================================
// Device configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShuntSource {
    /// Supplied by the user for this device.
    Override,
    /// Read from the device's shunt resistor attribute.
    Device,
    Default,
}

/// Everything the loop needs to know about one configured probe.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceConfig {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub metadata: ProbeMetadata,
    /// Rate reported by the device, before clipping.
    pub device_freq_hz: f64,
    /// Rate expected once the bus limit is shared across devices.
    pub sampling_freq_hz: u32,
    pub block_size: usize,
    pub rshunt_mohm: u32,
    pub shunt_source: ShuntSource,
    pub vshunt_scale: f64,
    pub vbat_scale: f64,
    pub vbat: VbatSource,
    pub mode: PowerMode,
    pub relative_time: bool,
    pub loss_threshold_periods: f64,
    pub timing_window: usize,
    pub integration_time: String,
    pub oversampling_ratio: u32,
    pub has_power_switch: bool,
    pub power_switch_on: Option<bool>,
}

impl DeviceConfig {
    /// Metadata name when known, device name otherwise.
    pub fn display_name(&self) -> &str {
        if self.metadata.name.is_empty() {
            &self.name
        } else {
            &self.metadata.name
        }
    }

    /// Channels read on every block.
    pub fn enabled_channels(&self) -> Vec<ChannelKind> {
        required_channels(self.vbat)
    }
}

/// Time and Vshunt always, Vbat only when it is measured.
pub fn required_channels(vbat: VbatSource) -> Vec<ChannelKind> {
    let mut channels = vec![ChannelKind::Time, ChannelKind::Vshunt];
    if vbat == VbatSource::Measured {
        channels.push(ChannelKind::Vbat);
    }
    channels
}

/// `floor(min(device_hz, bus_limit_hz) / device_count)`
pub fn effective_frequency(device_hz: f64, bus_limit_hz: f64, device_count: usize) -> u32 {
    (device_hz.min(bus_limit_hz) / device_count.max(1) as f64).floor() as u32
}

/// Samples per block: about half a second of data, never below `min_block`.
pub fn block_size_for(sampling_freq_hz: u32, min_block: usize) -> usize {
    min_block.max((sampling_freq_hz / 2) as usize).max(1)
}

fn parse_attr<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
) -> std::result::Result<Option<T>, ConfigurationError> {
    match value {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigurationError::InvalidAttribute { name, value: raw }),
    }
}

fn resolve_shunt<P: Probe + ?Sized>(
    probe: &P,
    override_mohm: Option<u32>,
) -> std::result::Result<(u32, ShuntSource), ConfigurationError> {
    if let Some(mohm) = override_mohm {
        return Ok((mohm, ShuntSource::Override));
    }
    // the device reports micro-ohms
    let reported: Option<u64> = parse_attr(attrs::SHUNT_RESISTOR, probe.attr(attrs::SHUNT_RESISTOR))?;
    match reported.map(|uohm| uohm / 1000) {
        Some(mohm) if mohm > 0 => Ok((
            u32::try_from(mohm).unwrap_or(u32::MAX),
            ShuntSource::Device,
        )),
        _ => Ok((DEFAULT_RSHUNT_MOHM, ShuntSource::Default)),
    }
}

fn channel_scale<P: Probe + ?Sized>(
    probe: &P,
    channel: ChannelKind,
) -> std::result::Result<f64, ConfigurationError> {
    Ok(parse_attr(attrs::SCALE, probe.channel_attr(channel, attrs::SCALE))?.unwrap_or(1.0))
}

/// Configure `probe` (device `index` of `device_count`) for acquisition.
///
/// Any error here must abort the whole capture: a probe running with a wrong scale or a
/// missing channel silently produces wrong measurements.
pub fn configure_device<P: Probe + ?Sized>(
    probe: &mut P,
    index: usize,
    device_count: usize,
    cfg: &AcquisitionConfig,
    resolver: &dyn MetadataResolver,
) -> std::result::Result<DeviceConfig, ConfigurationError> {
    info!(
        "configuring device {} of {}: name {}, id {}",
        index + 1,
        device_count,
        probe.name(),
        probe.id()
    );

    probe.write_attr(attrs::OVERSAMPLING_RATIO, &cfg.oversampling_ratio.to_string())?;
    // synchronous reads only
    probe.write_attr(attrs::ALLOW_ASYNC_READOUT, "0")?;

    if let Some(available) = probe.attr(attrs::INTEGRATION_TIME_AVAILABLE) {
        if !available
            .split_whitespace()
            .any(|t| t == cfg.integration_time)
        {
            return Err(ConfigurationError::UnsupportedIntegrationTime {
                requested: cfg.integration_time.clone(),
                available,
            });
        }
    }

    let vbat = cfg.vbat_source();
    let channels = required_channels(vbat);
    if let Some(&missing) = channels.iter().find(|&&ch| !probe.has_channel(ch)) {
        return Err(ConfigurationError::MissingChannel(missing));
    }

    let mut vshunt_scale = 1.0;
    let mut vbat_scale = 1.0;
    for &channel in &channels {
        match channel {
            ChannelKind::Time => {
                if probe.channel_attr(channel, attrs::SCALE).is_some() {
                    warn!("{}: scale attribute on Time channel, ignoring it", probe.id());
                }
            }
            ChannelKind::Vshunt => {
                let reported = channel_scale(probe, channel)?;
                vshunt_scale = scaler::validate_vshunt_scale(reported, cfg.vshunt_scale)?;
            }
            ChannelKind::Vbat => vbat_scale = channel_scale(probe, channel)?,
            ChannelKind::Ishunt | ChannelKind::Power => {}
        }
        if probe.channel_attr(channel, attrs::INTEGRATION_TIME).is_some() {
            probe.write_channel_attr(channel, attrs::INTEGRATION_TIME, &cfg.integration_time)?;
        }
        debug!("{}: enabling {}", probe.id(), channel);
        probe.enable_channel(channel)?;
    }

    let device_freq_hz: f64 = parse_attr(
        attrs::SAMPLING_FREQUENCY,
        probe.attr(attrs::SAMPLING_FREQUENCY),
    )?
    .ok_or(ConfigurationError::MissingAttribute(attrs::SAMPLING_FREQUENCY))?;
    // NaN and inf parse fine but would silently clip to the bus limit
    if !device_freq_hz.is_finite() || device_freq_hz <= 0.0 {
        return Err(ConfigurationError::InvalidAttribute {
            name: attrs::SAMPLING_FREQUENCY,
            value: device_freq_hz.to_string(),
        });
    }
    let sampling_freq_hz = effective_frequency(device_freq_hz, cfg.bus_limit_hz, device_count);
    if sampling_freq_hz == 0 {
        return Err(ConfigurationError::ZeroFrequency {
            device_hz: device_freq_hz,
            devices: device_count,
        });
    }
    let block_size = block_size_for(sampling_freq_hz, cfg.min_block_size);
    debug!(
        "{}: sampling frequency {} Hz (device: {} Hz), block size {} samples",
        probe.id(),
        sampling_freq_hz,
        device_freq_hz,
        block_size
    );

    let (rshunt_mohm, shunt_source) = resolve_shunt(probe, cfg.shunt_override(index))?;
    debug!("{}: shunt {} mOhm ({:?})", probe.id(), rshunt_mohm, shunt_source);

    let metadata = resolve_or_default(resolver, index);
    let switch_state = probe.attr(attrs::ACTIVE).map(|v| v.trim() != "0");
    let has_power_switch = metadata.has_power_switch && switch_state.is_some();
    if !metadata.name.is_empty() || metadata.serial.is_some() {
        debug!(
            "{}: probe {:?}, serial {:?}, power switch {}",
            probe.id(),
            metadata.name,
            metadata.serial,
            has_power_switch
        );
    }

    Ok(DeviceConfig {
        index,
        id: probe.id().to_string(),
        name: probe.name().to_string(),
        metadata,
        device_freq_hz,
        sampling_freq_hz,
        block_size,
        rshunt_mohm,
        shunt_source,
        vshunt_scale,
        vbat_scale,
        vbat,
        mode: cfg.mode,
        relative_time: cfg.relative_time,
        loss_threshold_periods: cfg.loss_threshold_periods,
        timing_window: cfg.timing_window,
        integration_time: cfg.integration_time.clone(),
        oversampling_ratio: cfg.oversampling_ratio,
        has_power_switch,
        power_switch_on: switch_state.filter(|_| has_power_switch),
    })
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopState {
    Configuring,
    Running,
    Stopping,
    Stopped,
}

/// Live view of a device loop, published after every block.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub state: LoopState,
    pub blocks: usize,
    /// Mean wall-clock time between blocks over the timing window.
    pub period_mean_ms: Option<f64>,
    pub estimated_freq_hz: f64,
    pub rshunt_mohm: u32,
    pub vbat: VbatSource,
    pub power_switch_on: Option<bool>,
    pub losses: usize,
    pub missed_samples: u64,
    /// Why the loop stopped, when it stopped on an error.
    pub error: Option<String>,
}

impl DeviceStatus {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            state: LoopState::Configuring,
            blocks: 0,
            period_mean_ms: None,
            estimated_freq_hz: 0.0,
            rshunt_mohm: config.rshunt_mohm,
            vbat: config.vbat,
            power_switch_on: config.power_switch_on,
            losses: 0,
            missed_samples: 0,
            error: None,
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// State shared between a device loop and its consumers.
#[derive(Debug)]
pub struct DeviceShared {
    buffer: Mutex<SampleBuffer>,
    status: Mutex<DeviceStatus>,
}

impl DeviceShared {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            buffer: Mutex::new(SampleBuffer::new()),
            status: Mutex::new(DeviceStatus::new(config)),
        }
    }

    /// Appends are single `extend` calls, so a poisoned buffer is still consistent.
    pub fn lock_buffer(&self) -> MutexGuard<'_, SampleBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_status(&self) -> MutexGuard<'_, DeviceStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Vec<SampleRow> {
        self.lock_buffer().snapshot()
    }

    pub fn reset(&self) {
        self.lock_buffer().reset();
    }

    pub fn status(&self) -> DeviceStatus {
        self.lock_status().clone()
    }

    fn update_status<F: FnOnce(&mut DeviceStatus)>(&self, f: F) {
        f(&mut self.lock_status());
    }
}

/// Live settings changes, applied by the loop before its next block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCommand {
    SetShunt(u32),
    /// Battery voltage in millivolts.
    SetFixedVbat(f64),
    SetPowerSwitch(bool),
}

// ============================================================================
// Block processing
// ============================================================================

/// Suspected sample loss between two consecutive blocks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LossReport {
    pub last_ms: f64,
    pub next_ms: f64,
    pub gap_ms: f64,
    pub period_ms: f64,
    pub missed_samples: u64,
}

/// Report a loss when the gap between `last_ms` and `next_ms` exceeds
/// `threshold_periods` nominal sample periods.
pub fn detect_loss(
    last_ms: f64,
    next_ms: f64,
    freq_hz: f64,
    threshold_periods: f64,
) -> Option<LossReport> {
    let gap_ms = next_ms - last_ms;
    let period_ms = 1000.0 / freq_hz;
    if gap_ms > threshold_periods * period_ms {
        Some(LossReport {
            last_ms,
            next_ms,
            gap_ms,
            period_ms,
            missed_samples: (gap_ms * freq_hz / 1000.0).floor() as u64,
        })
    } else {
        None
    }
}

/// Decoded samples of one block, straight from the device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBlock {
    pub time_ns: Vec<i64>,
    pub vshunt: Vec<i16>,
    /// `None` when a fixed Vbat is used.
    pub vbat: Option<Vec<i16>>,
}

/// One block in physical units, timestamps still absolute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvertedBlock {
    pub time_ns: Vec<i64>,
    pub values: Vec<f64>,
    pub vbat_mv: Vec<f64>,
}

impl ConvertedBlock {
    pub fn len(&self) -> usize {
        self.time_ns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_ns.is_empty()
    }

    /// Rows with time rebased on `origin_ns` and converted to milliseconds.
    pub fn to_rows(&self, origin_ns: i64) -> Vec<SampleRow> {
        self.time_ns
            .iter()
            .zip(&self.values)
            .zip(&self.vbat_mv)
            .map(|((&t, &value), &vbat)| SampleRow::new(ns_to_ms(t, origin_ns), value, vbat))
            .collect()
    }

    /// Time covered by the block, in milliseconds.
    pub fn span_ms(&self) -> Option<(f64, f64)> {
        let first = *self.time_ns.first()?;
        let last = *self.time_ns.last()?;
        Some((0.0, ns_to_ms(last, first)))
    }
}

/// Scale a raw block and compute power or current with `config`'s current settings.
pub fn convert_block(raw: &RawBlock, config: &DeviceConfig) -> ConvertedBlock {
    let vshunt_mv = scaler::scale(&raw.vshunt, config.vshunt_scale);
    let vbat_mv = match (&raw.vbat, config.vbat) {
        (Some(vbat), VbatSource::Measured) => scaler::scale(vbat, config.vbat_scale),
        (_, VbatSource::Fixed(mv)) => vec![mv; vshunt_mv.len()],
        // measured Vbat without samples never leaves read_block
        (None, VbatSource::Measured) => vec![0.0; vshunt_mv.len()],
    };
    let values = power::compute_block(&vshunt_mv, &vbat_mv, config.rshunt_mohm, config.mode);
    ConvertedBlock {
        time_ns: raw.time_ns.clone(),
        values,
        vbat_mv,
    }
}

/// Result of appending one block to a device buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CommitOutcome {
    pub rows: usize,
    /// Set when the gap with the previous block is suspicious.
    pub loss: Option<LossReport>,
    /// The buffer was empty: first block since start or since the last reinit.
    pub first_block: bool,
}

/// Append `block` to `buffer`; the caller holds the buffer lock.
pub fn commit_block(
    buffer: &mut SampleBuffer,
    block: &ConvertedBlock,
    config: &DeviceConfig,
) -> CommitOutcome {
    let Some(&first_ns) = block.time_ns.first() else {
        return CommitOutcome::default();
    };
    let first_block = buffer.is_empty();
    let origin_ns = if config.relative_time {
        buffer.origin_or_insert(first_ns)
    } else {
        0
    };
    let rows = block.to_rows(origin_ns);
    let loss = buffer.last_time().and_then(|last_ms| {
        detect_loss(
            last_ms,
            rows[0].time_ms,
            f64::from(config.sampling_freq_hz),
            config.loss_threshold_periods,
        )
    });
    buffer.append(&rows);
    CommitOutcome {
        rows: rows.len(),
        loss,
        first_block,
    }
}

// ============================================================================
// Device loop
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopSummary {
    pub blocks: usize,
    pub rows: usize,
    pub losses: usize,
}

/// The RUNNING/STOPPING part of a device's lifecycle; owns its probe.
pub struct DeviceLoop<P: Probe> {
    probe: P,
    config: DeviceConfig,
    shared: Arc<DeviceShared>,
    commands: Receiver<DeviceCommand>,
    running: Arc<AtomicBool>,
    timing: TimingStats,
}

impl<P: Probe> DeviceLoop<P> {
    pub fn new(
        probe: P,
        config: DeviceConfig,
        shared: Arc<DeviceShared>,
        commands: Receiver<DeviceCommand>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let timing = TimingStats::with_capacity(config.timing_window);
        Self {
            probe,
            config,
            shared,
            commands,
            running,
            timing,
        }
    }

    /// Acquire blocks until the stop flag is cleared or the hardware fails.
    pub fn run(mut self) -> Result<LoopSummary> {
        let id = self.config.id.clone();
        info!(
            "<{}> starting {} ({} Hz, {} samples per block)",
            id, self.config.name, self.config.sampling_freq_hz, self.config.block_size
        );
        self.shared.update_status(|s| s.state = LoopState::Running);

        let mut summary = LoopSummary::default();
        let mut last_start: Option<Instant> = None;
        let outcome = loop {
            if !self.running.load(Ordering::SeqCst) {
                self.shared.update_status(|s| s.state = LoopState::Stopping);
                break Ok(());
            }
            self.apply_commands();

            let started = Instant::now();
            match self.step(started, last_start, &mut summary) {
                Ok(()) => last_start = Some(started),
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(()) => {
                info!(
                    "<{}> stopped after {} blocks ({} rows)",
                    id, summary.blocks, summary.rows
                );
                self.shared.update_status(|s| s.state = LoopState::Stopped);
                Ok(summary)
            }
            Err(source) => {
                error!("<{}> acquisition stopped: {}", id, source);
                let message = source.to_string();
                self.shared.update_status(|s| {
                    s.state = LoopState::Stopped;
                    s.error = Some(message);
                });
                Err(AcquisitionError::HardwareRead { device: id, source })
            }
        }
    }

    fn step(
        &mut self,
        started: Instant,
        last_start: Option<Instant>,
        summary: &mut LoopSummary,
    ) -> std::result::Result<(), HardwareError> {
        let raw = self.read_block()?;
        let refilled = Instant::now();
        let block = convert_block(&raw, &self.config);

        let outcome = {
            let mut buffer = self.shared.lock_buffer();
            commit_block(&mut buffer, &block, &self.config)
        };
        let loss = outcome.loss;
        let committed = Instant::now();

        if let Some(loss) = loss {
            warn!(
                "<{}> data overflow (and loss - {} samples) suspected: last {:.3} ms, next {:.3} ms, gap {:.3} ms, period {:.3} ms",
                self.config.id, loss.missed_samples, loss.last_ms, loss.next_ms, loss.gap_ms, loss.period_ms
            );
            summary.losses += 1;
        }
        summary.blocks += 1;
        summary.rows += outcome.rows;

        // the first block after start or reinit only seeds the statistics
        let estimated = if outcome.first_block {
            None
        } else {
            if let Some(previous) = last_start {
                self.timing
                    .push(started.duration_since(previous).as_secs_f64() * 1000.0);
            }
            block
                .span_ms()
                .and_then(|(first, last)| estimate_frequency(self.config.block_size, first, last))
        };
        trace!(
            "<{}> refill: {:?}; convert+commit: {:?}; freq: {:?} Hz",
            self.config.id,
            refilled.duration_since(started),
            committed.duration_since(refilled),
            estimated
        );

        let period_mean = self.timing.mean();
        let blocks = summary.blocks;
        self.shared.update_status(|s| {
            s.blocks = blocks;
            s.period_mean_ms = period_mean;
            if let Some(freq) = estimated {
                s.estimated_freq_hz = freq;
            }
            if let Some(loss) = loss {
                s.losses += 1;
                s.missed_samples += loss.missed_samples;
            }
        });
        Ok(())
    }

    fn read_block(&mut self) -> std::result::Result<RawBlock, HardwareError> {
        let expected = self.config.block_size;
        self.probe.refill(expected)?;

        let mut raw = RawBlock::default();
        for channel in self.config.enabled_channels() {
            let bytes = self.probe.read_channel(channel)?;
            let len = match channel {
                ChannelKind::Time => {
                    raw.time_ns = decode_i64_le(&bytes)?;
                    raw.time_ns.len()
                }
                ChannelKind::Vshunt => {
                    raw.vshunt = decode_i16_le(&bytes)?;
                    raw.vshunt.len()
                }
                ChannelKind::Vbat => {
                    let vbat = decode_i16_le(&bytes)?;
                    let len = vbat.len();
                    raw.vbat = Some(vbat);
                    len
                }
                ChannelKind::Ishunt | ChannelKind::Power => continue,
            };
            check_len(channel, expected, len)?;
        }
        Ok(raw)
    }

    fn apply_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.apply(command),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn apply(&mut self, command: DeviceCommand) {
        let id = &self.config.id;
        match command {
            DeviceCommand::SetShunt(mohm) => {
                debug!("<{}> shunt set to {} mOhm", id, mohm);
                self.config.rshunt_mohm = mohm;
                self.config.shunt_source = ShuntSource::Override;
                self.shared.update_status(|s| s.rshunt_mohm = mohm);
            }
            DeviceCommand::SetFixedVbat(mv) => {
                if self.config.vbat == VbatSource::Measured {
                    warn!("<{}> measures Vbat, ignoring fixed value {} mV", id, mv);
                    return;
                }
                debug!("<{}> fixed Vbat set to {} mV", id, mv);
                self.config.vbat = VbatSource::Fixed(mv);
                self.shared.update_status(|s| s.vbat = VbatSource::Fixed(mv));
            }
            DeviceCommand::SetPowerSwitch(on) => {
                let value = if on { "1" } else { "0" };
                match self.probe.write_attr(attrs::ACTIVE, value) {
                    Ok(()) => {
                        debug!("<{}> power switch {}", id, if on { "on" } else { "off" });
                        self.config.power_switch_on = Some(on);
                        self.shared.update_status(|s| s.power_switch_on = Some(on));
                    }
                    Err(e) => warn!("<{}> failed to set power switch: {}", id, e),
                }
            }
        }
    }
}

fn check_len(
    channel: ChannelKind,
    expected: usize,
    actual: usize,
) -> std::result::Result<(), HardwareError> {
    if actual != expected {
        return Err(HardwareError::ShortRead {
            channel,
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::metadata::{NoMetadata, StaticMetadata};
    use crate::scaler::VshuntScalePolicy;
    use crate::sim::SimulatedProbe;

    fn configure(probe: &mut SimulatedProbe, cfg: &AcquisitionConfig) -> DeviceConfig {
        configure_device(probe, 0, 1, cfg, &NoMetadata).unwrap()
    }

    #[test]
    fn frequency_is_shared_across_devices() {
        assert_eq!(effective_frequency(800.0, 800.0, 2), 400);
        assert_eq!(effective_frequency(1200.0, 800.0, 3), 266);
        assert_eq!(effective_frequency(100.0, 800.0, 1), 100);
        assert_eq!(block_size_for(400, 64), 200);
        assert_eq!(block_size_for(100, 64), 64);
    }

    #[test]
    fn two_devices_get_200_sample_blocks() {
        let cfg = AcquisitionConfig::default();
        for index in 0..2 {
            let mut probe = SimulatedProbe::acme(index);
            let dev = configure_device(&mut probe, index, 2, &cfg, &NoMetadata).unwrap();
            assert_eq!(dev.sampling_freq_hz, 400);
            assert_eq!(dev.block_size, 200);
        }
    }

    #[test]
    fn configuration_enables_channels_and_sync_readout() {
        let mut probe = SimulatedProbe::acme(0);
        let dev = configure(&mut probe, &AcquisitionConfig::default());
        assert!(probe.is_enabled(ChannelKind::Time));
        assert!(probe.is_enabled(ChannelKind::Vshunt));
        assert!(probe.is_enabled(ChannelKind::Vbat));
        assert!(!probe.is_enabled(ChannelKind::Power));
        assert_eq!(probe.attr(attrs::ALLOW_ASYNC_READOUT).as_deref(), Some("0"));
        assert_eq!(probe.attr(attrs::OVERSAMPLING_RATIO).as_deref(), Some("1"));
        assert_eq!(
            probe
                .channel_attr(ChannelKind::Vshunt, attrs::INTEGRATION_TIME)
                .as_deref(),
            Some("0.000588")
        );
        assert_eq!(dev.vshunt_scale, 0.0025);
        assert_eq!(dev.vbat_scale, 1.25);
    }

    #[test]
    fn fixed_vbat_skips_vbat_channel() {
        let cfg = AcquisitionConfig {
            fixed_vbat_volts: Some(3.3),
            ..Default::default()
        };
        let mut probe = SimulatedProbe::acme(0).without_channel(ChannelKind::Vbat);
        let dev = configure(&mut probe, &cfg);
        assert_eq!(dev.vbat, VbatSource::Fixed(3300.0));
        assert_eq!(dev.enabled_channels(), vec![ChannelKind::Time, ChannelKind::Vshunt]);
    }

    #[test]
    fn missing_channel_is_fatal() {
        let mut probe = SimulatedProbe::acme(0).without_channel(ChannelKind::Time);
        let err = configure_device(&mut probe, 0, 1, &AcquisitionConfig::default(), &NoMetadata)
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingChannel(ChannelKind::Time)));
    }

    #[test]
    fn vshunt_scale_scenarios() {
        let mut probe = SimulatedProbe::acme(0);
        let cfg = AcquisitionConfig::default();
        assert_eq!(configure(&mut probe, &cfg).vshunt_scale, 0.0025);

        let mut probe =
            SimulatedProbe::acme(0).with_channel_attr(ChannelKind::Vshunt, attrs::SCALE, "0.0030");
        let err = configure_device(&mut probe, 0, 1, &cfg, &NoMetadata).unwrap_err();
        assert!(matches!(err, ConfigurationError::ScaleMismatch { .. }));

        let forced = AcquisitionConfig {
            vshunt_scale: VshuntScalePolicy::Force(0.0025),
            ..Default::default()
        };
        let mut probe =
            SimulatedProbe::acme(0).with_channel_attr(ChannelKind::Vshunt, attrs::SCALE, "0.0030");
        assert_eq!(configure(&mut probe, &forced).vshunt_scale, 0.0025);
    }

    #[test]
    fn shunt_resolution_order() {
        let mut probe = SimulatedProbe::acme(0);
        let dev = configure(&mut probe, &AcquisitionConfig::default());
        assert_eq!((dev.rshunt_mohm, dev.shunt_source), (100, ShuntSource::Device));

        let mut probe = SimulatedProbe::acme(0).with_attr(attrs::SHUNT_RESISTOR, "50000");
        let overridden = AcquisitionConfig {
            shunt_overrides_mohm: vec![Some(250)],
            ..Default::default()
        };
        let dev = configure(&mut probe, &overridden);
        assert_eq!((dev.rshunt_mohm, dev.shunt_source), (250, ShuntSource::Override));

        let mut probe = SimulatedProbe::acme(0).without_attr(attrs::SHUNT_RESISTOR);
        let dev = configure(&mut probe, &AcquisitionConfig::default());
        assert_eq!((dev.rshunt_mohm, dev.shunt_source), (100, ShuntSource::Default));

        let mut probe = SimulatedProbe::acme(0).with_attr(attrs::SHUNT_RESISTOR, "0");
        let dev = configure(&mut probe, &AcquisitionConfig::default());
        assert_eq!(dev.rshunt_mohm, 100);
    }

    #[test]
    fn non_finite_device_frequency_is_rejected() {
        for bad in ["NaN", "inf", "-800", "0"] {
            let mut probe = SimulatedProbe::acme(0).with_attr(attrs::SAMPLING_FREQUENCY, bad);
            let err = configure_device(&mut probe, 0, 1, &AcquisitionConfig::default(), &NoMetadata)
                .unwrap_err();
            assert!(
                matches!(
                    err,
                    ConfigurationError::InvalidAttribute {
                        name: attrs::SAMPLING_FREQUENCY,
                        ..
                    }
                ),
                "{bad}: {err}"
            );
        }
    }

    #[test]
    fn unsupported_integration_time_is_rejected() {
        let cfg = AcquisitionConfig {
            integration_time: "0.5".into(),
            ..Default::default()
        };
        let mut probe = SimulatedProbe::acme(0);
        assert!(matches!(
            configure_device(&mut probe, 0, 1, &cfg, &NoMetadata),
            Err(ConfigurationError::UnsupportedIntegrationTime { .. })
        ));
    }

    #[test]
    fn metadata_drives_power_switch() {
        let resolver = StaticMetadata::new(["PowerProbe USB (ACME)\nHas Power Switch"]);
        let mut probe = SimulatedProbe::acme(0);
        let dev =
            configure_device(&mut probe, 0, 1, &AcquisitionConfig::default(), &resolver).unwrap();
        assert!(dev.has_power_switch);
        assert_eq!(dev.power_switch_on, Some(true));
        assert_eq!(dev.display_name(), "USB");

        let mut probe = SimulatedProbe::acme(0);
        let dev = configure(&mut probe, &AcquisitionConfig::default());
        assert!(!dev.has_power_switch);
        assert_eq!(dev.display_name(), "ina226");
    }

    #[test]
    fn loss_threshold_is_exclusive() {
        // 400 Hz: period 2.5 ms, threshold 15 ms
        assert_eq!(detect_loss(100.0, 115.0, 400.0, 6.0), None);
        let loss = detect_loss(100.0, 115.5, 400.0, 6.0).unwrap();
        assert_eq!(loss.missed_samples, 6);
        assert_eq!(loss.gap_ms, 15.5);
    }

    fn dev_config(relative_time: bool) -> DeviceConfig {
        let mut probe = SimulatedProbe::acme(0);
        let cfg = AcquisitionConfig {
            relative_time,
            ..Default::default()
        };
        let mut dev = configure(&mut probe, &cfg);
        dev.sampling_freq_hz = 400;
        dev
    }

    fn block(start_ns: i64, n: usize) -> ConvertedBlock {
        ConvertedBlock {
            time_ns: (0..n as i64).map(|i| start_ns + i * 2_500_000).collect(),
            values: vec![1.0; n],
            vbat_mv: vec![3700.0; n],
        }
    }

    #[test]
    fn commit_rebases_on_first_block() {
        let dev = dev_config(true);
        let mut buffer = SampleBuffer::new();
        let start = 5_000_000_000;
        let outcome = commit_block(&mut buffer, &block(start, 4), &dev);
        assert_eq!((outcome.rows, outcome.loss), (4, None));
        assert!(outcome.first_block);
        assert_eq!(buffer.first_time(), Some(0.0));
        assert_eq!(buffer.last_time(), Some(7.5));

        let outcome = commit_block(&mut buffer, &block(start + 4 * 2_500_000, 4), &dev);
        assert_eq!(outcome.loss, None);
        assert!(!outcome.first_block);
        assert_eq!(buffer.len(), 8);

        buffer.reset();
        let outcome = commit_block(&mut buffer, &block(start + 100 * 2_500_000, 4), &dev);
        assert!(outcome.first_block);
        assert_eq!(outcome.loss, None);
        assert_eq!(buffer.first_time(), Some(0.0));
    }

    #[test]
    fn commit_keeps_absolute_time() {
        let dev = dev_config(false);
        let mut buffer = SampleBuffer::new();
        commit_block(&mut buffer, &block(5_000_000, 2), &dev);
        assert_eq!(buffer.first_time(), Some(5.0));
    }

    #[test]
    fn commit_reports_gap() {
        let dev = dev_config(true);
        let mut buffer = SampleBuffer::new();
        commit_block(&mut buffer, &block(0, 4), &dev);
        // last row at 7.5 ms, next at 7.5 + 11 periods
        let outcome = commit_block(&mut buffer, &block(35_000_000, 4), &dev);
        assert_eq!(outcome.rows, 4);
        assert_eq!(outcome.loss.unwrap().missed_samples, 11);
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn converts_power_and_current() {
        let mut dev = dev_config(true);
        let raw = RawBlock {
            time_ns: vec![0, 2_500_000],
            vshunt: vec![4000, 400],
            vbat: Some(vec![2960, 2960]),
        };
        let block = convert_block(&raw, &dev);
        // 10 mV * 3700 mV / 100 mOhm
        assert_eq!(block.values[0], 10.0 * 3700.0 / 100.0);
        assert_eq!(block.vbat_mv, vec![3700.0, 3700.0]);

        dev.mode = PowerMode::Current;
        dev.vbat = VbatSource::Fixed(3300.0);
        let block = convert_block(&raw, &dev);
        assert_eq!(block.values[1], 1.0 * 1000.0 / 100.0);
        assert_eq!(block.vbat_mv, vec![3300.0, 3300.0]);
    }

    #[test]
    fn loop_appends_every_emitted_block() {
        let mut probe = SimulatedProbe::acme(0).fail_after(3);
        let dev = configure(&mut probe, &AcquisitionConfig::default());
        let block_size = dev.block_size;
        let shared = Arc::new(DeviceShared::new(&dev));
        let (_tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));

        let result = DeviceLoop::new(probe, dev, Arc::clone(&shared), rx, running).run();
        assert!(matches!(result, Err(AcquisitionError::HardwareRead { .. })));
        assert_eq!(shared.snapshot().len(), 3 * block_size);

        let status = shared.status();
        assert_eq!(status.state, LoopState::Stopped);
        assert_eq!(status.blocks, 3);
        assert!(status.failed());
        assert!(status.estimated_freq_hz > 0.0);
    }

    #[test]
    fn first_block_only_seeds_statistics() {
        let mut probe = SimulatedProbe::acme(0).fail_after(1);
        let dev = configure(&mut probe, &AcquisitionConfig::default());
        let shared = Arc::new(DeviceShared::new(&dev));
        let (_tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));

        let _ = DeviceLoop::new(probe, dev, Arc::clone(&shared), rx, running).run();
        let status = shared.status();
        assert_eq!(status.blocks, 1);
        assert_eq!(status.estimated_freq_hz, 0.0);
        assert_eq!(status.period_mean_ms, None);
    }

    #[test]
    fn stopped_loop_reads_nothing() {
        let mut probe = SimulatedProbe::acme(0);
        let counter = probe.emitted_counter();
        let dev = configure(&mut probe, &AcquisitionConfig::default());
        let shared = Arc::new(DeviceShared::new(&dev));
        let (_tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(false));

        let summary = DeviceLoop::new(probe, dev, Arc::clone(&shared), rx, running)
            .run()
            .unwrap();
        assert_eq!(summary, LoopSummary::default());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(shared.status().state, LoopState::Stopped);
    }

    #[test]
    fn commands_apply_before_next_block() {
        let mut probe = SimulatedProbe::acme(0).fail_after(1);
        let dev = configure(&mut probe, &AcquisitionConfig::default());
        let shared = Arc::new(DeviceShared::new(&dev));
        let (tx, rx) = mpsc::channel();
        tx.send(DeviceCommand::SetShunt(50)).unwrap();
        let running = Arc::new(AtomicBool::new(true));

        let _ = DeviceLoop::new(probe, dev, Arc::clone(&shared), rx, running).run();
        let rows = shared.snapshot();
        // first raw Vshunt sample is 4000 LSB = 10 mV, Vbat 3700 mV
        assert_eq!(rows[0].value, 10.0 * 3700.0 / 50.0);
        assert_eq!(shared.status().rshunt_mohm, 50);
    }
}
