//! In-memory simulated device
//!
//! [`SimulatedDevice`] models a device in download mode: its storage facts,
//! its partition table, and every operation issued against it. The
//! [`SimulatedUsb`] and [`SimulatedTransport`] it hands out share that state,
//! so a test can drive the orchestrator and then inspect the call log.
//!
//! Failures can be injected at any operation, either as a rejection (the
//! device answers "no") or as a broken exchange (a transport error).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classifier::{BLOCK_SIZE, BLOCKS_128GB_A, MEM_TYPE, NUM_PHYSICAL, PAGE_SIZE};
use crate::error::{TransportError, UsbAccessError};
use crate::plan::{EXPECTED_PERSIST, PERSIST, USERDATA};
use crate::transport::{DeviceTransport, PartitionLocation, Slot, StorageInfo, UsbAccess};

/// Bytes reported per progress callback by `flash_blob`
pub const FLASH_CHUNK: usize = 64 * 1024;

/// Operation recorded by the simulated device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeviceCall {
    /// USB handle acquired
    Acquire,
    /// Programmer uploaded
    Connect {
        /// Programmer size in bytes
        programmer_len: usize,
    },
    /// Storage facts read
    StorageInfo,
    /// Partition looked up
    DetectPartition {
        /// Partition name
        name: String,
    },
    /// Partition table rewritten
    RepairGpt {
        /// Logical unit
        lun: u32,
        /// Image size in bytes
        len: usize,
    },
    /// Logical unit erased
    EraseLun {
        /// Logical unit
        lun: u32,
        /// Partitions kept
        preserve: Vec<String>,
    },
    /// Partition written
    FlashBlob {
        /// Partition name
        partition: String,
        /// Bytes written
        len: usize,
        /// Read-back requested
        verify: bool,
    },
    /// Boot slot activated
    SetActiveSlot {
        /// Slot
        slot: Slot,
    },
    /// Device rebooted
    Reset,
}

/// Operation at which a failure can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePoint {
    /// Protocol connect
    Connect,
    /// Storage info read
    StorageInfo,
    /// Partition lookup
    DetectPartition,
    /// Partition table repair
    RepairGpt,
    /// Logical unit erase
    EraseLun,
    /// Partition write
    FlashBlob,
    /// Slot activation
    SetActiveSlot,
    /// Reboot
    Reset,
}

impl FailurePoint {
    /// Every failure point, in run order.
    pub const ALL: [FailurePoint; 8] = [
        FailurePoint::Connect,
        FailurePoint::StorageInfo,
        FailurePoint::DetectPartition,
        FailurePoint::RepairGpt,
        FailurePoint::EraseLun,
        FailurePoint::FlashBlob,
        FailurePoint::SetActiveSlot,
        FailurePoint::Reset,
    ];

    /// Kebab-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            FailurePoint::Connect => "connect",
            FailurePoint::StorageInfo => "storage-info",
            FailurePoint::DetectPartition => "detect-partition",
            FailurePoint::RepairGpt => "repair-gpt",
            FailurePoint::EraseLun => "erase-lun",
            FailurePoint::FlashBlob => "flash-blob",
            FailurePoint::SetActiveSlot => "set-active-slot",
            FailurePoint::Reset => "reset",
        }
    }
}

impl fmt::Display for FailurePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailurePoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailurePoint::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown failure point: {s}"))
    }
}

/// How an injected failure manifests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// The device answers negatively; lookups find nothing
    Reject,
    /// The exchange breaks down with a transport error
    Error,
}

#[derive(Debug, Clone)]
struct Failure {
    point: FailurePoint,
    mode: FailureMode,
    target: Option<String>,
}

#[derive(Debug)]
struct SimState {
    storage: StorageInfo,
    partitions: BTreeMap<String, PartitionLocation>,
    calls: Vec<DeviceCall>,
    failures: Vec<Failure>,
    usb_supported: bool,
    usb_error: Option<UsbAccessError>,
    connected: bool,
    active_slot: Option<Slot>,
    written: BTreeMap<String, usize>,
    chunk_delay: Option<Duration>,
}

impl SimState {
    fn failure(&self, point: FailurePoint, target: &str) -> Option<FailureMode> {
        self.failures
            .iter()
            .find(|f| f.point == point && f.target.as_deref().is_none_or(|t| t == target))
            .map(|f| f.mode)
    }
}

/// Shared state of one simulated device
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    /// Device with the given storage and the stock partition layout.
    pub fn new(storage: StorageInfo) -> Self {
        let mut partitions = BTreeMap::new();
        partitions.insert(PERSIST.to_string(), EXPECTED_PERSIST);
        partitions.insert(
            USERDATA.to_string(),
            PartitionLocation {
                lun: 0,
                start: EXPECTED_PERSIST.start.saturating_add(EXPECTED_PERSIST.sectors),
                sectors: storage.total_blocks / 2,
            },
        );

        Self {
            state: Arc::new(Mutex::new(SimState {
                storage,
                partitions,
                calls: Vec::new(),
                failures: Vec::new(),
                usb_supported: true,
                usb_error: None,
                connected: false,
                active_slot: None,
                written: BTreeMap::new(),
                chunk_delay: None,
            })),
        }
    }

    /// Supported UFS device with `total_blocks` blocks.
    pub fn ufs(total_blocks: u64) -> Self {
        Self::new(StorageInfo {
            block_size: BLOCK_SIZE,
            page_size: PAGE_SIZE,
            num_physical: NUM_PHYSICAL,
            mem_type: MEM_TYPE.to_string(),
            total_blocks,
            serial_num: 0x1a2b_3c4d,
            prod_name: "SIMULATED".to_string(),
        })
    }

    /// 128 GB device matching the `userdata_89` layout.
    pub fn comma_3x() -> Self {
        Self::ufs(BLOCKS_128GB_A)
    }

    /// Place or move a partition.
    pub fn set_partition(&self, name: &str, location: PartitionLocation) {
        self.state
            .lock()
            .partitions
            .insert(name.to_string(), location);
    }

    /// Remove a partition from the table.
    pub fn remove_partition(&self, name: &str) {
        self.state.lock().partitions.remove(name);
    }

    /// Make every `point` operation fail.
    pub fn fail(&self, point: FailurePoint, mode: FailureMode) {
        self.push_failure(point, mode, None);
    }

    /// Make `point` fail only for `target`: a partition name, a logical unit
    /// number or a slot letter.
    pub fn fail_on(&self, point: FailurePoint, mode: FailureMode, target: &str) {
        self.push_failure(point, mode, Some(target.to_string()));
    }

    fn push_failure(&self, point: FailurePoint, mode: FailureMode, target: Option<String>) {
        self.state.lock().failures.push(Failure {
            point,
            mode,
            target,
        });
    }

    /// Make USB acquisition fail with `error`.
    pub fn deny_usb(&self, error: UsbAccessError) {
        self.state.lock().usb_error = Some(error);
    }

    /// Toggle host USB support.
    pub fn set_usb_supported(&self, supported: bool) {
        self.state.lock().usb_supported = supported;
    }

    /// Sleep this long after each reported write chunk.
    pub fn set_chunk_delay(&self, delay: Duration) {
        self.state.lock().chunk_delay = Some(delay);
    }

    /// Operations issued so far, in order.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    /// Bytes last written to each partition.
    pub fn written(&self) -> BTreeMap<String, usize> {
        self.state.lock().written.clone()
    }

    /// Slot activated, if any.
    pub fn active_slot(&self) -> Option<Slot> {
        self.state.lock().active_slot
    }

    /// Whether a protocol session is open.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// USB access backed by this device.
    pub fn usb(&self) -> SimulatedUsb {
        SimulatedUsb {
            device: self.clone(),
        }
    }

    /// Transport backed by this device.
    pub fn transport(&self) -> SimulatedTransport {
        SimulatedTransport {
            device: self.clone(),
        }
    }

    fn record(&self, call: DeviceCall) {
        debug!(?call, "Simulated device call");
        self.state.lock().calls.push(call);
    }

    fn require_connected(&self) -> Result<(), TransportError> {
        if self.state.lock().connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn check(&self, point: FailurePoint, target: &str) -> Result<bool, TransportError> {
        match self.state.lock().failure(point, target) {
            None => Ok(true),
            Some(FailureMode::Reject) => Ok(false),
            Some(FailureMode::Error) => Err(TransportError::Disconnected(format!(
                "simulated failure at {point}"
            ))),
        }
    }
}

/// Handle to a simulated device in download mode
#[derive(Debug)]
pub struct SimulatedHandle {
    serial_num: u32,
}

impl SimulatedHandle {
    /// Serial number of the device the handle was opened on.
    pub fn serial_num(&self) -> u32 {
        self.serial_num
    }
}

/// [`UsbAccess`] backed by a [`SimulatedDevice`]
#[derive(Debug, Clone)]
pub struct SimulatedUsb {
    device: SimulatedDevice,
}

#[async_trait]
impl UsbAccess for SimulatedUsb {
    type Handle = SimulatedHandle;

    fn is_supported(&self) -> bool {
        self.device.state.lock().usb_supported
    }

    async fn acquire(&self) -> Result<SimulatedHandle, UsbAccessError> {
        let state = self.device.state.lock();
        if let Some(error) = &state.usb_error {
            return Err(error.clone());
        }
        let serial_num = state.storage.serial_num;
        drop(state);
        self.device.record(DeviceCall::Acquire);
        Ok(SimulatedHandle { serial_num })
    }
}

/// [`DeviceTransport`] backed by a [`SimulatedDevice`]
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    device: SimulatedDevice,
}

#[async_trait]
impl DeviceTransport for SimulatedTransport {
    type Handle = SimulatedHandle;

    async fn connect(
        &mut self,
        handle: SimulatedHandle,
        programmer: &[u8],
    ) -> Result<(), TransportError> {
        self.device.record(DeviceCall::Connect {
            programmer_len: programmer.len(),
        });
        if programmer.is_empty() {
            return Err(TransportError::Protocol(
                "programmer image is empty".to_string(),
            ));
        }
        if !self.device.check(FailurePoint::Connect, "")? {
            return Err(TransportError::Protocol(
                "device rejected programmer".to_string(),
            ));
        }
        debug!(serial = handle.serial_num(), "Simulated session opened");
        self.device.state.lock().connected = true;
        Ok(())
    }

    async fn storage_info(&mut self) -> Result<StorageInfo, TransportError> {
        self.device.require_connected()?;
        self.device.record(DeviceCall::StorageInfo);
        if !self.device.check(FailurePoint::StorageInfo, "")? {
            return Err(TransportError::Timeout {
                operation: "storage_info".to_string(),
                timeout_ms: 0,
            });
        }
        Ok(self.device.state.lock().storage.clone())
    }

    async fn detect_partition(
        &mut self,
        name: &str,
    ) -> Result<Option<PartitionLocation>, TransportError> {
        self.device.require_connected()?;
        self.device.record(DeviceCall::DetectPartition {
            name: name.to_string(),
        });
        if !self.device.check(FailurePoint::DetectPartition, name)? {
            return Ok(None);
        }
        Ok(self.device.state.lock().partitions.get(name).copied())
    }

    async fn repair_gpt(&mut self, lun: u32, image: &[u8]) -> Result<bool, TransportError> {
        self.device.require_connected()?;
        self.device.record(DeviceCall::RepairGpt {
            lun,
            len: image.len(),
        });
        self.device.check(FailurePoint::RepairGpt, &lun.to_string())
    }

    async fn erase_lun(
        &mut self,
        lun: u32,
        preserve: &BTreeSet<String>,
    ) -> Result<bool, TransportError> {
        self.device.require_connected()?;
        self.device.record(DeviceCall::EraseLun {
            lun,
            preserve: preserve.iter().cloned().collect(),
        });
        if !self.device.check(FailurePoint::EraseLun, &lun.to_string())? {
            return Ok(false);
        }

        let mut state = self.device.state.lock();
        let erased: Vec<String> = state
            .partitions
            .iter()
            .filter(|(name, loc)| loc.lun == lun && !preserve.contains(*name))
            .map(|(name, _)| name.clone())
            .collect();
        for name in erased {
            state.written.remove(&name);
        }
        Ok(true)
    }

    async fn flash_blob(
        &mut self,
        partition: &str,
        data: &[u8],
        on_progress: &(dyn Fn(u64) + Send + Sync),
        verify: bool,
    ) -> Result<bool, TransportError> {
        self.device.require_connected()?;
        self.device.record(DeviceCall::FlashBlob {
            partition: partition.to_string(),
            len: data.len(),
            verify,
        });
        if !self.device.check(FailurePoint::FlashBlob, partition)? {
            return Ok(false);
        }

        let delay = self.device.state.lock().chunk_delay;
        let mut written = 0u64;
        for chunk in data.chunks(FLASH_CHUNK) {
            written = written.saturating_add(chunk.len() as u64);
            on_progress(written);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }

        self.device
            .state
            .lock()
            .written
            .insert(partition.to_string(), data.len());
        Ok(true)
    }

    async fn set_active_slot(&mut self, slot: Slot) -> Result<bool, TransportError> {
        self.device.require_connected()?;
        self.device.record(DeviceCall::SetActiveSlot { slot });
        if !self.device.check(FailurePoint::SetActiveSlot, slot.as_str())? {
            return Ok(false);
        }
        self.device.state.lock().active_slot = Some(slot);
        Ok(true)
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        self.device.require_connected()?;
        self.device.record(DeviceCall::Reset);
        self.device.check(FailurePoint::Reset, "")?;
        self.device.state.lock().connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected() -> Result<(SimulatedDevice, SimulatedTransport), Box<dyn std::error::Error>>
    {
        let device = SimulatedDevice::comma_3x();
        let handle = device.usb().acquire().await?;
        let mut transport = device.transport();
        transport.connect(handle, &[0xaa]).await?;
        Ok((device, transport))
    }

    #[tokio::test]
    async fn test_operations_require_connect() {
        let device = SimulatedDevice::comma_3x();
        let mut transport = device.transport();
        assert!(matches!(
            transport.storage_info().await,
            Err(TransportError::NotConnected)
        ));
        assert!(device.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_programmer_is_protocol_error() -> Result<(), UsbAccessError> {
        let device = SimulatedDevice::comma_3x();
        let handle = device.usb().acquire().await?;
        let result = device.transport().connect(handle, &[]).await;
        assert!(matches!(result, Err(TransportError::Protocol(_))));
        assert!(!device.is_connected());
        Ok(())
    }

    #[tokio::test]
    async fn test_flash_reports_bytes_in_chunks() -> Result<(), Box<dyn std::error::Error>> {
        let (device, mut transport) = connected().await?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let on_progress = {
            let seen = Arc::clone(&seen);
            move |n: u64| seen.lock().push(n)
        };

        let data = vec![0u8; FLASH_CHUNK * 2 + 10];
        assert!(transport.flash_blob("boot", &data, &on_progress, false).await?);
        assert_eq!(
            *seen.lock(),
            vec![FLASH_CHUNK as u64, (FLASH_CHUNK * 2) as u64, data.len() as u64]
        );
        assert_eq!(device.written().get("boot"), Some(&data.len()));
        Ok(())
    }

    #[tokio::test]
    async fn test_targeted_failure() -> Result<(), Box<dyn std::error::Error>> {
        let (device, mut transport) = connected().await?;
        device.fail_on(FailurePoint::EraseLun, FailureMode::Reject, "3");

        let preserve = BTreeSet::new();
        assert!(transport.erase_lun(2, &preserve).await?);
        assert!(!transport.erase_lun(3, &preserve).await?);

        device.fail(FailurePoint::SetActiveSlot, FailureMode::Error);
        assert!(transport.set_active_slot(Slot::A).await.is_err());
        assert_eq!(device.active_slot(), None);
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_closes_session() -> Result<(), Box<dyn std::error::Error>> {
        let (device, mut transport) = connected().await?;
        transport.reset().await?;
        assert!(!device.is_connected());
        assert_eq!(device.calls().last(), Some(&DeviceCall::Reset));
        Ok(())
    }

    #[tokio::test]
    async fn test_denied_usb() {
        let device = SimulatedDevice::comma_3x();
        device.deny_usb(UsbAccessError::PermissionDenied("udev".to_string()));
        assert_eq!(
            device.usb().acquire().await.map(|_| ()),
            Err(UsbAccessError::PermissionDenied("udev".to_string()))
        );
    }

    #[test]
    fn test_failure_point_names() {
        for point in FailurePoint::ALL {
            assert_eq!(point.as_str().parse::<FailurePoint>(), Ok(point));
        }
        assert!("bogus".parse::<FailurePoint>().is_err());
    }
}
