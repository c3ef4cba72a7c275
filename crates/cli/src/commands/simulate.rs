//! Run a full flash against a simulated device

use agnos_flash::sim::{DeviceCall, SimulatedDevice};
use agnos_flash::{
    DirectoryImageSource, EventReceiver, FlashConfig, FlashEvent, FlashManager, FlashOptions,
    FlashPlan, FlashStatus, ImageSource, MemoryImageSource, StaticManifestSource, Step,
};
use agnos_progress::is_indeterminate;
use anyhow::Result;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::commands::{SimulateArgs, load_manifest};
use crate::error::CliError;
use crate::output;

const PLACEHOLDER_PROGRAMMER: &[u8] = b"agnosctl simulated programmer";

/// Outcome of a simulated run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub manifest: String,
    pub status: FlashStatus,
    pub plan: Option<FlashPlan>,
    pub written: BTreeMap<String, usize>,
    pub calls: Vec<DeviceCall>,
    pub elapsed_ms: u64,
}

/// Execute the simulate command
pub async fn execute(args: &SimulateArgs, catalog: Option<&Path>, json: bool) -> Result<()> {
    let (url, manifest) = load_manifest(&args.source, catalog).await?;
    let programmer = match &args.programmer {
        Some(path) => tokio::fs::read(path).await.map_err(CliError::from)?,
        None => PLACEHOLDER_PROGRAMMER.to_vec(),
    };

    let images: Arc<dyn ImageSource> = match &args.images {
        Some(dir) => Arc::new(
            DirectoryImageSource::new(dir.clone()).with_hash_verification(!args.no_hash_check),
        ),
        None => Arc::new(MemoryImageSource::synthetic(&manifest, args.max_image_bytes)),
    };

    let device = SimulatedDevice::ufs(args.total_blocks);
    if let Some(point) = args.fail {
        match &args.fail_target {
            Some(target) => device.fail_on(point, args.fail_mode.into(), target),
            None => device.fail(point, args.fail_mode.into()),
        }
        info!("Injecting {:?} failure at {}", args.fail_mode, point);
    }

    let options = FlashOptions {
        flash_userdata: !args.keep_userdata,
        verify_writes: args.verify,
    };
    let config = FlashConfig::new(url.clone(), programmer).with_options(options);
    let source = Arc::new(StaticManifestSource::new(manifest.images().to_vec()));
    let mut manager = FlashManager::new(config, device.transport(), device.usb(), source);

    let pb = if json {
        ProgressBar::hidden()
    } else {
        progress_bar()?
    };
    let watcher = tokio::spawn(watch_events(manager.subscribe(), pb.clone()));

    let started = Instant::now();
    manager.initialize(images).await;
    manager.start().await;
    let elapsed = started.elapsed();

    // Dropping the manager closes the channel and ends the watcher.
    let status = manager.status();
    let plan = manager.plan();
    drop(manager);
    if let Err(e) = watcher.await {
        debug!("Progress watcher ended abnormally: {}", e);
    }
    finish_bar(&pb, &status);

    let report = SimulationReport {
        manifest: url,
        status,
        plan,
        written: device.written(),
        calls: device.calls(),
        elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
    };
    output::print_simulation(&report, args.calls, json);

    match (report.status.error, report.status.step) {
        (Some(kind), _) => Err(CliError::FlashFailed(kind).into()),
        (None, Step::Done) => Ok(()),
        (None, step) => Err(CliError::Incomplete(step.to_string()).into()),
    }
}

fn progress_bar() -> Result<ProgressBar> {
    let pb = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")?
        .progress_chars("█▓░");
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

async fn watch_events(mut rx: EventReceiver, pb: ProgressBar) {
    while let Some(event) = rx.recv().await {
        match event {
            FlashEvent::Step(step) => pb.set_message(step.to_string()),
            FlashEvent::Message(message) if !message.is_empty() => pb.set_message(message),
            FlashEvent::Progress(value) if !is_indeterminate(value) => {
                pb.set_position(percent(value));
            }
            _ => {}
        }
    }
}

fn finish_bar(pb: &ProgressBar, status: &FlashStatus) {
    match status.error {
        Some(kind) => pb.abandon_with_message(format!("{} {}", "✗".red(), kind)),
        None if status.step == Step::Done => {
            pb.set_position(100);
            pb.finish_with_message(format!("{} Flash completed", "✓".green()));
        }
        None => pb.abandon_with_message(status.step.to_string()),
    }
}

/// Whole percent for a progress fraction, clamped to `0..=100`.
fn percent(value: f64) -> u64 {
    let scaled = value.clamp(0.0, 1.0) * 100.0;
    (0u32..=100)
        .rev()
        .find(|n| f64::from(*n) <= scaled + 0.5)
        .map_or(0, u64::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_rounds_and_clamps() {
        assert_eq!(percent(0.0), 0);
        assert_eq!(percent(0.254), 25);
        assert_eq!(percent(0.256), 26);
        assert_eq!(percent(1.0), 100);
        assert_eq!(percent(3.0), 100);
        assert_eq!(percent(-2.0), 0);
    }
}
