//! Flash orchestrator
//!
//! [`FlashManager`] sequences the irreversible device operations of a run:
//!
//! ```text
//! Initializing -> Ready -> Connecting -> RepairingPartitionTables
//!     -> ErasingDevice -> FlashingSystem -> Finalizing -> Done
//! ```
//!
//! Errors are sticky. When a stage fails the step stays where it failed, the
//! error kind is published, and every later stage returns without touching
//! the device. Nothing is retried automatically.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use agnos_progress::{INDETERMINATE, ProgressHandle, create_step_array, monotonic, with_progress};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::classifier::{PartitionVariant, classify};
use crate::config::FlashConfig;
use crate::error::{ErrorKind, ImageSourceError, TransportError};
use crate::events::{EventEmitter, EventReceiver, FlashEvent, FlashStatus};
use crate::image::ImageSource;
use crate::manifest::{Manifest, ManifestImage, ManifestSource};
use crate::plan::{
    BOOT_SLOT, EXPECTED_PERSIST, FlashPlan, PERSIST, USERDATA, preserve_set, target_partitions,
    userdata_selection,
};
use crate::transport::{DeviceTransport, StorageInfo, UsbAccess};

/// Stage of a run
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Waiting for [`FlashManager::initialize`]
    #[default]
    Initializing,
    /// Ready to start
    Ready,
    /// Opening a session with the device
    Connecting,
    /// Rewriting partition tables
    RepairingPartitionTables,
    /// Erasing logical units
    ErasingDevice,
    /// Writing system images
    FlashingSystem,
    /// Activating the boot slot and rebooting
    Finalizing,
    /// Run finished
    Done,
}

impl Step {
    /// Numeric code in run order.
    pub fn code(self) -> u8 {
        match self {
            Step::Initializing => 0,
            Step::Ready => 1,
            Step::Connecting => 2,
            Step::RepairingPartitionTables => 3,
            Step::ErasingDevice => 4,
            Step::FlashingSystem => 5,
            Step::Finalizing => 6,
            Step::Done => 7,
        }
    }

    /// Short user-facing description.
    pub fn description(self) -> &'static str {
        match self {
            Step::Initializing => "Initializing",
            Step::Ready => "Ready",
            Step::Connecting => "Connecting",
            Step::RepairingPartitionTables => "Repairing partition tables",
            Step::ErasingDevice => "Erasing device",
            Step::FlashingSystem => "Flashing system",
            Step::Finalizing => "Finalizing",
            Step::Done => "Done",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Mutable record of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlashSession {
    /// Current stage
    pub step: Step,
    /// Sticky error
    pub error: Option<ErrorKind>,
    /// Whether a device session is open
    pub connected: bool,
    /// Device serial as 8 hex digits
    pub serial: Option<String>,
    /// Classified userdata layout
    pub variant: Option<PartitionVariant>,
    /// Storage facts read after connecting
    pub storage: Option<StorageInfo>,
}

/// Failure inside a stage, mapped to the stage's [`ErrorKind`]
#[derive(Error, Debug)]
enum StageError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Image(#[from] ImageSourceError),

    #[error("{0}")]
    Rejected(String),
}

/// Orchestrates a flashing run against one device
pub struct FlashManager<T, U>
where
    T: DeviceTransport,
    U: UsbAccess<Handle = T::Handle>,
{
    config: FlashConfig,
    transport: T,
    usb: U,
    manifest_source: Arc<dyn ManifestSource>,
    images: Option<Arc<dyn ImageSource>>,
    manifest: Option<Arc<Manifest>>,
    session: FlashSession,
    events: EventEmitter,
}

impl<T, U> FlashManager<T, U>
where
    T: DeviceTransport,
    U: UsbAccess<Handle = T::Handle>,
{
    /// Create an orchestrator in [`Step::Initializing`].
    pub fn new(
        config: FlashConfig,
        transport: T,
        usb: U,
        manifest_source: Arc<dyn ManifestSource>,
    ) -> Self {
        Self {
            config,
            transport,
            usb,
            manifest_source,
            images: None,
            manifest: None,
            session: FlashSession::default(),
            events: EventEmitter::new(),
        }
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Current session record.
    pub fn session(&self) -> &FlashSession {
        &self.session
    }

    /// Snapshot of observable state.
    pub fn status(&self) -> FlashStatus {
        FlashStatus {
            step: self.session.step,
            error: self.session.error,
            message: self.events.last_message(),
            progress: self.events.last_progress(),
            connected: self.session.connected,
            serial: self.session.serial.clone(),
        }
    }

    /// Run configuration.
    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    /// Loaded manifest, if any.
    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_deref()
    }

    /// What a run would do given the current manifest and device variant.
    pub fn plan(&self) -> Option<FlashPlan> {
        self.manifest
            .as_deref()
            .map(|m| FlashPlan::build(m, self.session.variant, &self.config.options))
    }

    /// Check host requirements, prepare `images` and load the manifest.
    ///
    /// Clears a previous error and the previous device's serial, variant and
    /// storage facts so a run can be retried. A manifest loaded by an earlier
    /// call is kept.
    pub async fn initialize(&mut self, images: Arc<dyn ImageSource>) {
        self.images = Some(Arc::clone(&images));
        if self.session.error.take().is_some() {
            self.events.emit(FlashEvent::Error(None));
        }
        self.set_connected(false);
        self.session.serial = None;
        self.session.variant = None;
        self.session.storage = None;
        self.events.progress(INDETERMINATE);
        self.events.message("");

        if !self.usb.is_supported() {
            error!("USB access not supported on this host");
            self.set_error(ErrorKind::RequirementsNotMet);
            return;
        }

        if let Err(e) = images.init().await {
            error!("Failed to initialize image source: {}", e);
            match &e {
                ImageSourceError::StorageSpace(_) => {
                    self.set_error(ErrorKind::StorageSpace);
                    self.events.message(e.to_string());
                }
                _ => self.set_error(ErrorKind::Unknown),
            }
            return;
        }

        if self.manifest.is_none() {
            match Manifest::load(self.manifest_source.as_ref(), &self.config.manifest_url).await {
                Ok(manifest) => self.manifest = Some(Arc::new(manifest)),
                Err(e) => {
                    error!("Failed to load manifest: {}", e);
                    self.set_error(ErrorKind::Unknown);
                    return;
                }
            }
        }

        self.set_step(Step::Ready);
    }

    /// Acquire the device, open a session and classify its storage.
    ///
    /// If no device can be acquired the run goes back to [`Step::Ready`]
    /// without an error.
    pub async fn connect(&mut self) {
        if self.has_error() {
            return;
        }
        self.set_step(Step::Connecting);
        self.events.progress(INDETERMINATE);

        let handle = match self.usb.acquire().await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("No device acquired: {}", e);
                self.set_step(Step::Ready);
                self.set_connected(false);
                return;
            }
        };

        if let Err(e) = self.transport.connect(handle, &self.config.programmer).await {
            error!("Connection error: {}", e);
            self.set_error(ErrorKind::LostConnection);
            self.set_connected(false);
            return;
        }
        info!("Connected");

        let storage = match self.transport.storage_info().await {
            Ok(storage) => storage,
            Err(e) => {
                error!("Connection lost: {}", e);
                self.set_error(ErrorKind::LostConnection);
                self.set_connected(false);
                return;
            }
        };
        self.set_connected(true);

        let variant = match classify(&storage) {
            Ok(variant) => variant,
            Err(e) => {
                error!(?storage, "Could not identify device: {}", e);
                self.session.storage = Some(storage);
                self.set_error(ErrorKind::UnrecognizedDevice);
                return;
            }
        };

        let serial = storage.serial_string();
        info!(
            serial = %serial,
            variant = %variant,
            capacity = variant.capacity_label(),
            total_blocks = storage.total_blocks,
            "Device info"
        );
        self.session.variant = Some(variant);
        self.session.storage = Some(storage);
        self.session.serial = Some(serial.clone());
        self.events.emit(FlashEvent::Serial(serial));
    }

    /// Rewrite the partition table of every logical unit with a GPT image.
    pub async fn repair_partition_tables(&mut self) {
        if self.has_error() {
            return;
        }
        self.set_step(Step::RepairingPartitionTables);
        self.events.progress(0.0);

        if let Err(e) = self.run_repair().await {
            error!("An error occurred while repairing partition tables: {}", e);
            self.set_error(ErrorKind::RepairPartitionTablesFailed);
        }
    }

    async fn run_repair(&mut self) -> Result<(), StageError> {
        let (manifest, images) = self.resources()?;
        let gpt_images: Vec<&ManifestImage> = manifest.gpt_images().collect();
        if gpt_images.is_empty() {
            return Err(StageError::Rejected(
                "No GPT images found in manifest".to_string(),
            ));
        }

        let root = self.progress_root();
        for (image, on_progress) in with_progress(gpt_images, &root) {
            let Some(gpt) = image.gpt else {
                continue;
            };
            let [on_download, on_repair] = create_step_array([2, 1], &on_progress);

            images
                .download_image(image, &|f: f64| on_download.report(f))
                .await?;
            let blob = images.get_image(image).await?;

            if !self.transport.repair_gpt(gpt.lun, &blob).await? {
                return Err(StageError::Rejected(format!(
                    "Repairing LUN {} failed",
                    gpt.lun
                )));
            }
            debug!(lun = gpt.lun, image = %image.name, "Partition table repaired");
            on_repair.complete();
        }
        Ok(())
    }

    /// Erase every logical unit, keeping partition tables, `persist`, and
    /// `userdata` when it is preserved.
    ///
    /// Nothing is erased unless `persist` sits exactly where expected.
    pub async fn erase_device(&mut self) {
        if self.has_error() {
            return;
        }
        self.set_step(Step::ErasingDevice);
        self.events.progress(INDETERMINATE);

        if let Err(e) = self.run_erase().await {
            error!("An error occurred while erasing device: {}", e);
            self.set_error(ErrorKind::EraseFailed);
        }
    }

    async fn run_erase(&mut self) -> Result<(), StageError> {
        let num_luns = self
            .session
            .storage
            .as_ref()
            .map(|s| s.num_physical)
            .ok_or_else(|| StageError::Rejected("Storage info unavailable".to_string()))?;

        let persist = match self.transport.detect_partition(PERSIST).await? {
            Some(location) if location.lun < num_luns => location,
            other => {
                return Err(StageError::Rejected(format!(
                    "Could not find \"{PERSIST}\" partition: {other:?}"
                )));
            }
        };
        if persist != EXPECTED_PERSIST {
            return Err(StageError::Rejected(format!(
                "Partition \"{PERSIST}\" does not have expected properties: {persist:?}"
            )));
        }
        info!("\"{}\" partition located in LUN {}", PERSIST, persist.lun);

        let userdata_lun = if self.config.options.flash_userdata {
            None
        } else {
            match self.transport.detect_partition(USERDATA).await? {
                Some(location) if location.lun < num_luns => {
                    info!(
                        "\"{}\" partition located in LUN {}, will be preserved",
                        USERDATA, location.lun
                    );
                    Some(location.lun)
                }
                _ => {
                    warn!(
                        "\"{}\" partition not found, cannot preserve it (will be created during flash)",
                        USERDATA
                    );
                    None
                }
            }
        };

        for lun in 0..num_luns {
            let preserve = preserve_set(lun, persist.lun, userdata_lun);
            let names: Vec<String> = preserve.iter().map(|p| format!("\"{p}\"")).collect();
            info!(
                "Erasing LUN {} while preserving {} partitions",
                lun,
                names.join(", ")
            );
            if !self.transport.erase_lun(lun, &preserve).await? {
                return Err(StageError::Rejected(format!("Erasing LUN {lun} failed")));
            }
        }
        Ok(())
    }

    /// Download and write every system image, both slots for A/B images.
    pub async fn flash_system(&mut self) {
        if self.has_error() {
            return;
        }
        self.set_step(Step::FlashingSystem);
        self.events.progress(0.0);

        if let Err(e) = self.run_flash().await {
            error!("An error occurred while flashing system: {}", e);
            self.set_error(ErrorKind::FlashSystemFailed);
        }
    }

    async fn run_flash(&mut self) -> Result<(), StageError> {
        let (manifest, images) = self.resources()?;
        let selection = userdata_selection(self.session.variant, &self.config.options);
        let system_images = manifest.system_images(selection);
        let verify = self.config.options.verify_writes;

        let root = self.progress_root();
        for (image, on_image) in with_progress(system_images, &root) {
            let flash_weight = if image.has_ab { 2 } else { 1 };
            let [on_download, on_flash] = create_step_array([1, flash_weight], &on_image);

            self.events.message(format!("Downloading {}", image.name));
            images
                .download_image(image, &|f: f64| on_download.report(f))
                .await?;
            let blob = images.get_image(image).await?;
            on_download.complete();

            let size = image.size as f64;
            for (partition, on_slot) in with_progress(target_partitions(image), &on_flash) {
                self.events.message(format!("Flashing {partition}"));
                let on_bytes = |written: u64| on_slot.report(written as f64 / size);
                if !self
                    .transport
                    .flash_blob(&partition, &blob, &on_bytes, verify)
                    .await?
                {
                    return Err(StageError::Rejected(format!(
                        "Flashing partition \"{partition}\" failed"
                    )));
                }
                on_slot.complete();
            }
        }
        Ok(())
    }

    /// Activate the boot slot and reboot.
    ///
    /// Always ends in [`Step::Done`]. A slot failure is reported as
    /// [`ErrorKind::FinalizingFailed`] but the device is still reset.
    pub async fn finalize(&mut self) {
        if self.has_error() {
            return;
        }
        self.set_step(Step::Finalizing);
        self.events.progress(INDETERMINATE);
        self.events.message("Finalizing...");

        match self.transport.set_active_slot(BOOT_SLOT).await {
            Ok(true) => info!("Slot {} activated", BOOT_SLOT),
            Ok(false) => {
                error!("Failed to update slot");
                self.set_error(ErrorKind::FinalizingFailed);
            }
            Err(e) => {
                error!("Failed to update slot: {}", e);
                self.set_error(ErrorKind::FinalizingFailed);
            }
        }

        self.events.message("Rebooting");
        if let Err(e) = self.transport.reset().await {
            warn!("Reset failed: {}", e);
        }
        self.set_connected(false);
        self.set_step(Step::Done);
    }

    /// Run every stage in order. Does nothing unless the run is [`Step::Ready`].
    pub async fn start(&mut self) {
        if self.session.step != Step::Ready {
            debug!(step = %self.session.step, "Start ignored");
            return;
        }

        let started = Instant::now();
        self.connect().await;
        log_stage("Connected", started);
        if !self.can_continue() {
            return;
        }

        let started = Instant::now();
        self.repair_partition_tables().await;
        log_stage("Repaired partition tables", started);
        if !self.can_continue() {
            return;
        }

        let started = Instant::now();
        self.erase_device().await;
        log_stage("Erased device", started);
        if !self.can_continue() {
            return;
        }

        let started = Instant::now();
        self.flash_system().await;
        log_stage("Flashed system", started);
        if !self.can_continue() {
            return;
        }

        let started = Instant::now();
        self.finalize().await;
        log_stage("Finalized", started);
    }

    fn has_error(&self) -> bool {
        self.session.error.is_some()
    }

    fn can_continue(&self) -> bool {
        !self.has_error() && self.session.connected
    }

    fn resources(&self) -> Result<(Arc<Manifest>, Arc<dyn ImageSource>), StageError> {
        match (&self.manifest, &self.images) {
            (Some(manifest), Some(images)) => Ok((Arc::clone(manifest), Arc::clone(images))),
            _ => Err(StageError::Rejected("Not initialized".to_string())),
        }
    }

    fn progress_root(&self) -> ProgressHandle {
        ProgressHandle::new(monotonic(self.events.progress_sink()))
    }

    fn set_step(&mut self, step: Step) {
        debug!(step = %step, code = step.code(), "Step changed");
        self.session.step = step;
        self.events.emit(FlashEvent::Step(step));
    }

    fn set_error(&mut self, kind: ErrorKind) {
        error!(error = %kind, code = kind.code(), step = %self.session.step, "Flash error");
        self.session.error = Some(kind);
        self.events.emit(FlashEvent::Error(Some(kind)));
        self.events.progress(INDETERMINATE);
    }

    fn set_connected(&mut self, connected: bool) {
        self.session.connected = connected;
        self.events.emit(FlashEvent::Connection(connected));
    }
}

impl<T, U> fmt::Debug for FlashManager<T, U>
where
    T: DeviceTransport,
    U: UsbAccess<Handle = T::Handle>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashManager")
            .field("config", &self.config)
            .field("session", &self.session)
            .field("manifest_images", &self.manifest.as_ref().map(|m| m.len()))
            .finish_non_exhaustive()
    }
}

fn log_stage(label: &str, started: Instant) {
    let elapsed = started.elapsed();
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        "{} in {:.2}s",
        label,
        elapsed.as_secs_f64()
    );
}
