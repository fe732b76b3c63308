use std::process::exit;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use acme_capture::acquisition::{block_size_for, effective_frequency};
use acme_capture::config::parse_shunt_list;
use acme_capture::logging::{init_logging_with, verbosity_level};
use acme_capture::{
    analysis, histogram, window_mean, AcquisitionConfig, AcquisitionSupervisor, BinRule, Column, NoMetadata,
    PowerMode, Probe, SimulatedProbe, VshuntScalePolicy,
};

#[derive(Parser, Debug)]
#[command(
    name = "acme-capture",
    about = "Capture power from ACME probes (simulated) and report live statistics"
)]
struct Args {
    /// Number of simulated probes
    #[arg(long, default_value_t = 2)]
    devices: usize,
    /// Shunt values in mOhm, comma separated, one per probe (0 or empty keeps the probe's)
    #[arg(long, value_name = "LIST")]
    shunts: Option<String>,
    /// Use this battery voltage (V) instead of measuring Vbat
    #[arg(long, value_name = "VOLTS")]
    vbat: Option<f64>,
    /// Capture current (mA) instead of power (mW)
    #[arg(long)]
    ishunt: bool,
    /// Keep absolute device timestamps
    #[arg(long)]
    norelatime: bool,
    /// Start even on a suspicious Vshunt scale; with a value, use that scale instead
    #[arg(long, value_name = "SCALE", num_args = 0..=1)]
    forcevshuntscale: Option<Option<f64>>,
    /// Oversampling ratio written to each probe
    #[arg(long, default_value_t = 1)]
    oversmplrt: u32,
    /// Integration time written to each voltage channel
    #[arg(long, default_value = "0.000588")]
    inttime: String,
    /// Capture duration
    #[arg(long, default_value_t = 5)]
    seconds: u64,
    /// Interval between status reports
    #[arg(long, default_value_t = 500)]
    plot_rate_ms: u64,
    /// Histogram bin rule (auto, fd, doane, scott, rice, sturges, sqrt)
    #[arg(long, default_value = "auto")]
    bins: BinRule,
    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn config(&self) -> Result<AcquisitionConfig> {
        let shunt_overrides_mohm = match &self.shunts {
            Some(list) => parse_shunt_list(list).context("invalid --shunts list")?,
            None => Vec::new(),
        };
        let vshunt_scale = match self.forcevshuntscale {
            None => VshuntScalePolicy::Strict,
            Some(None) => VshuntScalePolicy::AcceptDevice,
            Some(Some(scale)) => VshuntScalePolicy::Force(scale),
        };
        Ok(AcquisitionConfig {
            oversampling_ratio: self.oversmplrt,
            integration_time: self.inttime.clone(),
            relative_time: !self.norelatime,
            mode: if self.ishunt {
                PowerMode::Current
            } else {
                PowerMode::Power
            },
            fixed_vbat_volts: self.vbat,
            shunt_overrides_mohm,
            vshunt_scale,
            ..Default::default()
        })
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn simulated_probes(count: usize, cfg: &AcquisitionConfig) -> Vec<Box<dyn Probe>> {
    (0..count)
        .map(|index| {
            let probe = SimulatedProbe::acme(index);
            let device_hz = probe
                .attr(acme_capture::probe::attrs::SAMPLING_FREQUENCY)
                .and_then(|v| v.parse().ok())
                .unwrap_or(cfg.bus_limit_hz);
            // pace refills like real hardware at the shared bus rate
            let freq = effective_frequency(device_hz, cfg.bus_limit_hz, count).max(1);
            let block = block_size_for(freq, cfg.min_block_size);
            let pace = Duration::from_secs_f64(block as f64 / f64::from(freq));
            Box::new(probe.with_rate(f64::from(freq)).with_pacing(pace)) as Box<dyn Probe>
        })
        .collect()
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging_with(Some(verbosity_level(args.verbose)));

    let cfg = args.config()?;
    let probes = simulated_probes(args.devices, &cfg);
    let mut supervisor = AcquisitionSupervisor::configure(probes, &cfg, &NoMetadata)
        .context("probe configuration failed")?;

    for device in supervisor.start_all()? {
        info!(
            "{} ({}): {} Hz, {} samples per block",
            device.id, device.display_name, device.sampling_freq_hz, device.block_size
        );
    }

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let plot_rate = Duration::from_millis(args.plot_rate_ms.max(1));
    while Instant::now() < deadline {
        thread::sleep(plot_rate);
        for device in supervisor.devices() {
            let status = supervisor.status(&device.id)?;
            let period = status
                .period_mean_ms
                .map(|p| format!("{p:.1} ms"))
                .unwrap_or_else(|| "-".into());
            println!(
                "{:<14} blocks {:>4} | period {:>9} | {:>7.1} samples/s | losses {}",
                device.id, status.blocks, period, status.estimated_freq_hz, status.losses
            );
        }
        println!("Total samples/s: {:.1}", supervisor.total_estimated_freq());
        for failed in supervisor.failed_devices() {
            warn!("{} stopped on an error", failed);
        }
    }

    for report in supervisor.stop_all() {
        match report.outcome {
            Ok(summary) => info!(
                "{}: {} blocks, {} rows, {} suspected losses",
                report.device_id, summary.blocks, summary.rows, summary.losses
            ),
            Err(e) => warn!("{}: {}", report.device_id, e),
        }
    }

    let unit = cfg.mode.label();
    for capture in supervisor.captures() {
        let Some(last) = capture.rows.last().map(|r| r.time_ms) else {
            println!("{}: no data", capture.display_name);
            continue;
        };
        let first = capture.rows[0].time_ms;
        let mean = window_mean(&capture.rows, first, last + 1.0, Column::Value).unwrap_or(0.0);
        let vbat = window_mean(&capture.rows, first, last + 1.0, Column::Vbat).unwrap_or(0.0);
        println!(
            "{} ({}): {} rows over {:.1} ms, mean {} {:.3}, mean Vbat {:.1} mV",
            capture.display_name,
            capture.device_id,
            capture.rows.len(),
            last - first,
            unit,
            mean,
            vbat
        );

        let values = analysis::column(&capture.rows, Column::Value);
        let hist = histogram(&values, args.bins);
        println!("  distribution ({}, {} bins):", args.bins, hist.bins());
        for (i, count) in hist.counts.iter().enumerate().filter(|(_, c)| **c > 0) {
            println!(
                "    [{:>10.3}, {:>10.3}) {}",
                hist.edges[i],
                hist.edges[i + 1],
                count
            );
        }
    }
    Ok(())
}
