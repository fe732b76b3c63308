//! Owner of every device loop: configuration, worker threads and the consumer interface.
//!
//! ```no_run
//! use acme_capture::{AcquisitionConfig, AcquisitionSupervisor, NoMetadata, Probe, SimulatedProbe};
//!
//! let probes: Vec<Box<dyn Probe>> = vec![Box::new(SimulatedProbe::acme(0))];
//! let mut sup = AcquisitionSupervisor::configure(probes, &AcquisitionConfig::default(), &NoMetadata)?;
//! sup.start_all()?;
//! // ... plot from sup.snapshot("iio:device0") ...
//! for report in sup.stop_all() {
//!     println!("{}: {} blocks", report.device_id, report.blocks);
//! }
//! # Ok::<(), acme_capture::AcquisitionError>(())
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use serde::Serialize;

use crate::acquisition::{
    configure_device, DeviceCommand, DeviceConfig, DeviceLoop, DeviceShared, DeviceStatus,
    LoopSummary,
};
use crate::buffer::SampleRow;
use crate::config::AcquisitionConfig;
use crate::errors::{AcquisitionError, ConfigurationError, Result};
use crate::metadata::MetadataResolver;
use crate::power::{self, VbatSource};
use crate::probe::Probe;

/// Identification of a configured device, as handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceHandle {
    pub index: usize,
    pub id: String,
    pub display_name: String,
    pub sampling_freq_hz: u32,
    pub block_size: usize,
    pub has_power_switch: bool,
}

impl DeviceHandle {
    fn new(config: &DeviceConfig) -> Self {
        Self {
            index: config.index,
            id: config.id.clone(),
            display_name: config.display_name().to_string(),
            sampling_freq_hz: config.sampling_freq_hz,
            block_size: config.block_size,
            has_power_switch: config.has_power_switch,
        }
    }
}

/// Outcome of one worker, collected when it is joined.
#[derive(Debug)]
pub struct WorkerReport {
    pub device_id: String,
    pub blocks: usize,
    pub outcome: Result<LoopSummary>,
}

/// What gets persisted of a device's capture.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceCapture {
    pub device_id: String,
    pub display_name: String,
    pub rows: Vec<SampleRow>,
}

struct DeviceSlot {
    config: DeviceConfig,
    shared: Arc<DeviceShared>,
    commands: Sender<DeviceCommand>,
    // handed over to the worker by start_all
    probe: Option<Box<dyn Probe>>,
    inbox: Option<Receiver<DeviceCommand>>,
    worker: Option<JoinHandle<Result<LoopSummary>>>,
}

impl DeviceSlot {
    fn send(&self, command: DeviceCommand) {
        // a finished worker drops its receiver; nothing left to apply the command to
        if self.commands.send(command).is_err() {
            debug!("<{}> worker gone, dropping {:?}", self.config.id, command);
        }
    }
}

pub struct AcquisitionSupervisor {
    slots: Vec<DeviceSlot>,
    running: Arc<AtomicBool>,
    started: bool,
}

impl AcquisitionSupervisor {
    /// Configure every probe; the first configuration error aborts and nothing is started.
    pub fn configure(
        probes: Vec<Box<dyn Probe>>,
        cfg: &AcquisitionConfig,
        resolver: &dyn MetadataResolver,
    ) -> Result<Self> {
        if probes.is_empty() {
            return Err(AcquisitionError::Configuration {
                device: "-".into(),
                source: ConfigurationError::NoDevices,
            });
        }
        let count = probes.len();
        info!("{} devices to configure", count);

        let mut slots = Vec::with_capacity(count);
        for (index, mut probe) in probes.into_iter().enumerate() {
            let config = configure_device(&mut probe, index, count, cfg, resolver).map_err(
                |source| AcquisitionError::Configuration {
                    device: probe.id().to_string(),
                    source,
                },
            )?;
            let (commands, inbox) = mpsc::channel();
            slots.push(DeviceSlot {
                shared: Arc::new(DeviceShared::new(&config)),
                config,
                commands,
                probe: Some(probe),
                inbox: Some(inbox),
                worker: None,
            });
        }

        Ok(Self {
            slots,
            running: Arc::new(AtomicBool::new(false)),
            started: false,
        })
    }

    /// Spawn one named worker thread per device.
    pub fn start_all(&mut self) -> Result<Vec<DeviceHandle>> {
        if self.started {
            return Err(AcquisitionError::AlreadyStarted);
        }
        self.started = true;
        self.running.store(true, Ordering::SeqCst);

        for i in 0..self.slots.len() {
            if let Err(e) = self.spawn(i) {
                warn!("failed to start acquisition: {}", e);
                self.stop_all();
                return Err(e);
            }
        }
        info!("acquisition started on {} devices", self.slots.len());
        Ok(self.devices())
    }

    fn spawn(&mut self, i: usize) -> Result<()> {
        let slot = &mut self.slots[i];
        let (Some(probe), Some(inbox)) = (slot.probe.take(), slot.inbox.take()) else {
            return Err(AcquisitionError::AlreadyStarted);
        };
        let device_loop = DeviceLoop::new(
            probe,
            slot.config.clone(),
            Arc::clone(&slot.shared),
            inbox,
            Arc::clone(&self.running),
        );
        let handle = thread::Builder::new()
            .name(format!("acme-{}", slot.config.id))
            .spawn(move || device_loop.run())?;
        slot.worker = Some(handle);
        Ok(())
    }

    /// Ask every worker to stop after its current block, without waiting.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop every worker and wait for all of them.
    ///
    /// A worker blocked in a hardware read keeps this call waiting.
    pub fn stop_all(&mut self) -> Vec<WorkerReport> {
        self.stop();
        let mut reports = Vec::new();
        for slot in &mut self.slots {
            let Some(worker) = slot.worker.take() else {
                continue;
            };
            let outcome = worker
                .join()
                .unwrap_or_else(|_| Err(AcquisitionError::WorkerPanicked(slot.config.id.clone())));
            let blocks = slot.shared.status().blocks;
            debug!("<{}> joined after {} blocks", slot.config.id, blocks);
            reports.push(WorkerReport {
                device_id: slot.config.id.clone(),
                blocks,
                outcome,
            });
        }
        reports
    }

    /// Whether workers were started and not yet joined.
    pub fn is_running(&self) -> bool {
        self.slots.iter().any(|slot| slot.worker.is_some())
    }

    /// Empty every buffer and restart relative time from the next block of each device.
    pub fn reinit_all(&self) {
        for slot in &self.slots {
            slot.shared.reset();
        }
        info!("capture reinitialised");
    }

    pub fn reinit(&self, id: &str) -> Result<()> {
        self.slot(id)?.shared.reset();
        Ok(())
    }

    pub fn snapshot(&self, id: &str) -> Result<Vec<SampleRow>> {
        Ok(self.slot(id)?.shared.snapshot())
    }

    pub fn status(&self, id: &str) -> Result<DeviceStatus> {
        Ok(self.slot(id)?.shared.status())
    }

    pub fn config(&self, id: &str) -> Result<&DeviceConfig> {
        Ok(&self.slot(id)?.config)
    }

    pub fn devices(&self) -> Vec<DeviceHandle> {
        self.slots
            .iter()
            .map(|slot| DeviceHandle::new(&slot.config))
            .collect()
    }

    /// Replace the shunt resistance (mΩ) used for the device's next blocks.
    pub fn set_shunt(&mut self, id: &str, rshunt_mohm: u32) -> Result<()> {
        if rshunt_mohm == 0 {
            return Err(AcquisitionError::InvalidShunt(rshunt_mohm));
        }
        let slot = self.slot_mut(id)?;
        slot.config.rshunt_mohm = rshunt_mohm;
        slot.send(DeviceCommand::SetShunt(rshunt_mohm));
        Ok(())
    }

    /// Replace the fixed battery voltage (V) of a device not measuring Vbat.
    pub fn set_fixed_vbat(&mut self, id: &str, volts: f64) -> Result<()> {
        if !volts.is_finite() || volts <= 0.0 {
            return Err(AcquisitionError::InvalidVbat(volts));
        }
        let slot = self.slot_mut(id)?;
        if slot.config.vbat == VbatSource::Measured {
            return Err(AcquisitionError::VbatMeasured(id.to_string()));
        }
        let mv = power::fixed_vbat_mv(volts);
        slot.config.vbat = VbatSource::Fixed(mv);
        slot.send(DeviceCommand::SetFixedVbat(mv));
        Ok(())
    }

    pub fn set_power_switch(&mut self, id: &str, on: bool) -> Result<()> {
        let slot = self.slot_mut(id)?;
        if !slot.config.has_power_switch {
            return Err(AcquisitionError::NoPowerSwitch(id.to_string()));
        }
        slot.config.power_switch_on = Some(on);
        slot.send(DeviceCommand::SetPowerSwitch(on));
        Ok(())
    }

    /// Sum of the per-device estimated sampling rates (Hz).
    pub fn total_estimated_freq(&self) -> f64 {
        self.slots
            .iter()
            .map(|slot| slot.shared.status().estimated_freq_hz)
            .sum()
    }

    /// Ids of the devices whose worker stopped on an error.
    pub fn failed_devices(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|slot| slot.shared.status().failed())
            .map(|slot| slot.config.id.clone())
            .collect()
    }

    pub fn captures(&self) -> Vec<DeviceCapture> {
        self.slots
            .iter()
            .map(|slot| DeviceCapture {
                device_id: slot.config.id.clone(),
                display_name: slot.config.display_name().to_string(),
                rows: slot.shared.snapshot(),
            })
            .collect()
    }

    fn slot(&self, id: &str) -> Result<&DeviceSlot> {
        self.slots
            .iter()
            .find(|slot| slot.config.id == id)
            .ok_or_else(|| AcquisitionError::UnknownDevice(id.to_string()))
    }

    fn slot_mut(&mut self, id: &str) -> Result<&mut DeviceSlot> {
        self.slots
            .iter_mut()
            .find(|slot| slot.config.id == id)
            .ok_or_else(|| AcquisitionError::UnknownDevice(id.to_string()))
    }
}

impl Drop for AcquisitionSupervisor {
    fn drop(&mut self) {
        if self.is_running() {
            debug!("supervisor dropped with running workers, stopping them");
            self.stop_all();
        }
    }
}
