//! Multi-probe capture pipeline for ACME power probes.
//!
//! Every probe gets its own acquisition thread: it reads fixed-size blocks of Vshunt, Vbat
//! and timestamp samples, converts them to power (mW) or current (mA), and appends them to
//! a per-device buffer that consumers snapshot for plotting and analysis.
//!
//! # Timing and Synchronization
//!
//! Probes share one I2C bus, so the sampling rate is capped (800 Hz by default) and split
//! evenly between them. Block size follows the rate, about half a second per block. Sample
//! loss shows up as a gap between two blocks; gaps over 6 sample periods are logged with
//! an estimate of the missed samples.
//!
//! 1. Configure all probes with [`AcquisitionSupervisor::configure`]
//! 2. Start the workers with [`AcquisitionSupervisor::start_all`]
//! 3. Read with [`AcquisitionSupervisor::snapshot`], restart time with
//!    [`AcquisitionSupervisor::reinit_all`]
//! 4. Stop and join with [`AcquisitionSupervisor::stop_all`]

pub mod acquisition;
pub mod analysis;
pub mod buffer;
pub mod config;
mod errors;
pub mod logging;
pub mod metadata;
pub mod power;
pub mod probe;
pub mod scaler;
pub mod sim;
pub mod supervisor;
pub mod timing;

pub use acquisition::{DeviceConfig, DeviceStatus, LoopState, LossReport};
pub use analysis::{histogram, window_mean, BinRule, Column, Histogram};
pub use buffer::{SampleBuffer, SampleRow};
pub use config::AcquisitionConfig;
pub use errors::*;
pub use logging::{init_logging, init_logging_with};
pub use metadata::{MetadataResolver, NoMetadata, ProbeMetadata, StaticMetadata};
pub use power::{PowerMode, VbatSource};
pub use probe::{ChannelKind, Probe};
pub use scaler::VshuntScalePolicy;
pub use sim::SimulatedProbe;
pub use supervisor::{AcquisitionSupervisor, DeviceCapture, DeviceHandle, WorkerReport};
