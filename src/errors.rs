use std::io;
use thiserror::Error;

use crate::probe::ChannelKind;

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("configuration error on {device}: {source}")]
    Configuration {
        device: String,
        #[source]
        source: ConfigurationError,
    },
    #[error("hardware read failed on {device}: {source}")]
    HardwareRead {
        device: String,
        #[source]
        source: HardwareError,
    },
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("invalid shunt resistance: {0} mOhm")]
    InvalidShunt(u32),
    #[error("invalid fixed vbat: {0} V")]
    InvalidVbat(f64),
    #[error("device {0} measures vbat, a fixed value does not apply")]
    VbatMeasured(String),
    #[error("device {0} has no power switch")]
    NoPowerSwitch(String),
    #[error("acquisition already started")]
    AlreadyStarted,
    #[error("worker for {0} panicked")]
    WorkerPanicked(String),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("could not find {0} channel")]
    MissingChannel(ChannelKind),
    #[error("missing device attribute: {0}")]
    MissingAttribute(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    InvalidAttribute { name: &'static str, value: String },
    #[error(
        "suspicious scale value on Vshunt channel (found {found} instead of {expected} expected)"
    )]
    ScaleMismatch { found: f64, expected: f64 },
    #[error("unsupported integration time {requested} (available: {available})")]
    UnsupportedIntegrationTime { requested: String, available: String },
    #[error("effective sampling frequency is zero (device: {device_hz} Hz, devices: {devices})")]
    ZeroFrequency { device_hz: f64, devices: usize },
    #[error("no devices to configure")]
    NoDevices,
    #[error("hardware error: {0}")]
    Hardware(#[from] HardwareError),
}

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("attribute {name} rejected: {reason}")]
    Attribute { name: String, reason: String },
    #[error("channel {0} is not enabled")]
    NotEnabled(ChannelKind),
    #[error("short read on {channel}: expected {expected} samples, got {actual}")]
    ShortRead {
        channel: ChannelKind,
        expected: usize,
        actual: usize,
    },
    #[error("buffer of {len} bytes is not a multiple of the {width}-byte sample width")]
    Misaligned { len: usize, width: usize },
    #[error("device disconnected: {0}")]
    Disconnected(String),
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata service unavailable: {0}")]
    Unavailable(String),
    #[error("no metadata for device index {0}")]
    UnknownIndex(usize),
}

#[derive(Debug, Error)]
#[error("unknown histogram bin rule: {0}")]
pub struct UnknownBinRule(pub String);

pub type Result<T> = std::result::Result<T, AcquisitionError>;
