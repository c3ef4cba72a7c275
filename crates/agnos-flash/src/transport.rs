//! Collaborator seams towards the device
//!
//! [`UsbAccess`] hands out a raw handle to a device in download mode and
//! [`DeviceTransport`] speaks the download protocol over it. Neither is
//! implemented here for real hardware; [`crate::sim`] provides an in-memory
//! pair for tests and dry runs.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{TransportError, UsbAccessError};

/// Storage facts read from the device right after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    /// Erase block size in bytes
    pub block_size: u32,
    /// Page size in bytes
    pub page_size: u32,
    /// Number of logical units
    pub num_physical: u32,
    /// Memory technology, e.g. `"UFS"`
    pub mem_type: String,
    /// Total block count, used to tell capacity variants apart
    pub total_blocks: u64,
    /// Chip serial number
    pub serial_num: u32,
    /// Product name reported by the chip
    #[serde(default)]
    pub prod_name: String,
}

impl StorageInfo {
    /// Serial number as 8 lowercase hex digits.
    pub fn serial_string(&self) -> String {
        format!("{:08x}", self.serial_num)
    }
}

/// Where a named partition lives on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionLocation {
    /// Logical unit number
    pub lun: u32,
    /// First sector
    pub start: u64,
    /// Length in sectors
    pub sectors: u64,
}

/// Boot slot of a dual-slot partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    /// Slot A
    A,
    /// Slot B
    B,
}

impl Slot {
    /// Both slots in flashing order.
    pub const ALL: [Slot; 2] = [Slot::A, Slot::B];

    /// Partition name suffix, `_a` or `_b`.
    pub fn suffix(self) -> &'static str {
        match self {
            Slot::A => "_a",
            Slot::B => "_b",
        }
    }

    /// Bare slot letter.
    pub fn as_str(self) -> &'static str {
        match self {
            Slot::A => "a",
            Slot::B => "b",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access to USB devices in download mode
#[async_trait]
pub trait UsbAccess: Send + Sync {
    /// Opaque device handle passed on to the transport
    type Handle: Send;

    /// Whether this host can talk to USB devices at all.
    fn is_supported(&self) -> bool;

    /// Select and open a device.
    async fn acquire(&self) -> Result<Self::Handle, UsbAccessError>;
}

/// Download protocol client
///
/// Every operation is an await point. Boolean results report whether the
/// device accepted the operation; errors report that the exchange itself
/// broke down.
#[async_trait]
pub trait DeviceTransport: Send {
    /// Device handle accepted by [`connect`](Self::connect)
    type Handle: Send;

    /// Upload the programmer and open a session.
    async fn connect(&mut self, handle: Self::Handle, programmer: &[u8])
    -> Result<(), TransportError>;

    /// Read the storage description.
    async fn storage_info(&mut self) -> Result<StorageInfo, TransportError>;

    /// Look up a partition by name across all logical units.
    async fn detect_partition(
        &mut self,
        name: &str,
    ) -> Result<Option<PartitionLocation>, TransportError>;

    /// Rewrite the partition table of `lun` from a GPT image.
    async fn repair_gpt(&mut self, lun: u32, image: &[u8]) -> Result<bool, TransportError>;

    /// Erase every partition of `lun` except those named in `preserve`.
    async fn erase_lun(
        &mut self,
        lun: u32,
        preserve: &BTreeSet<String>,
    ) -> Result<bool, TransportError>;

    /// Write `data` to `partition`, reporting bytes written so far.
    async fn flash_blob(
        &mut self,
        partition: &str,
        data: &[u8],
        on_progress: &(dyn Fn(u64) + Send + Sync),
        verify: bool,
    ) -> Result<bool, TransportError>;

    /// Mark `slot` as the active boot slot.
    async fn set_active_slot(&mut self, slot: Slot) -> Result<bool, TransportError>;

    /// Reboot the device.
    async fn reset(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_is_zero_padded_hex() {
        let info = StorageInfo {
            block_size: 4096,
            page_size: 4096,
            num_physical: 6,
            mem_type: "UFS".to_string(),
            total_blocks: 29_605_888,
            serial_num: 0xbeef,
            prod_name: String::new(),
        };
        assert_eq!(info.serial_string(), "0000beef");
    }

    #[test]
    fn test_slot_suffixes() {
        assert_eq!(Slot::A.suffix(), "_a");
        assert_eq!(Slot::B.suffix(), "_b");
        assert_eq!(Slot::ALL, [Slot::A, Slot::B]);
        assert_eq!(Slot::A.to_string(), "a");
    }

    #[test]
    fn test_storage_info_without_prod_name() -> Result<(), serde_json::Error> {
        let info: StorageInfo = serde_json::from_str(
            r#"{"block_size":4096,"page_size":4096,"num_physical":6,"mem_type":"UFS",
                "total_blocks":16777216,"serial_num":1}"#,
        )?;
        assert!(info.prod_name.is_empty());
        Ok(())
    }
}
