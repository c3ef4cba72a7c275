//! Storage classification
//!
//! Maps the storage facts of a connected device onto the userdata image that
//! matches its capacity. Only one chip family is supported; everything else is
//! rejected before any write happens.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ClassifyError;
use crate::transport::StorageInfo;

/// Required erase block size
pub const BLOCK_SIZE: u32 = 4096;
/// Required page size
pub const PAGE_SIZE: u32 = 4096;
/// Required logical unit count
pub const NUM_PHYSICAL: u32 = 6;
/// Required memory type
pub const MEM_TYPE: &str = "UFS";

/// Largest block count of the 64 GB part
pub const BLOCKS_64GB: u64 = 16_777_216;
/// Block count of the first 128 GB part
pub const BLOCKS_128GB_A: u64 = 29_605_888;
/// Block count of the second 128 GB part
pub const BLOCKS_128GB_B: u64 = 29_775_872;

/// Userdata layout matching a device capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionVariant {
    /// 64 GB part
    Userdata30,
    /// First 128 GB part
    Userdata89,
    /// Second 128 GB part
    Userdata90,
}

impl PartitionVariant {
    /// Name of the manifest image carrying this layout.
    pub fn image_name(self) -> &'static str {
        match self {
            PartitionVariant::Userdata30 => "userdata_30",
            PartitionVariant::Userdata89 => "userdata_89",
            PartitionVariant::Userdata90 => "userdata_90",
        }
    }

    /// Marketing capacity of the part.
    pub fn capacity_label(self) -> &'static str {
        match self {
            PartitionVariant::Userdata30 => "64 GB",
            PartitionVariant::Userdata89 | PartitionVariant::Userdata90 => "128 GB",
        }
    }

    /// Parse a manifest image name back into a variant.
    pub fn from_image_name(name: &str) -> Option<Self> {
        match name {
            "userdata_30" => Some(PartitionVariant::Userdata30),
            "userdata_89" => Some(PartitionVariant::Userdata89),
            "userdata_90" => Some(PartitionVariant::Userdata90),
            _ => None,
        }
    }
}

impl fmt::Display for PartitionVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.image_name())
    }
}

/// Classify a device by its storage facts.
///
/// Geometry is checked first; a mismatch fails regardless of capacity.
pub fn classify(info: &StorageInfo) -> Result<PartitionVariant, ClassifyError> {
    if info.block_size != BLOCK_SIZE
        || info.page_size != PAGE_SIZE
        || info.num_physical != NUM_PHYSICAL
        || info.mem_type != MEM_TYPE
    {
        return Err(ClassifyError::GeometryMismatch {
            block_size: info.block_size,
            page_size: info.page_size,
            num_physical: info.num_physical,
            mem_type: info.mem_type.clone(),
        });
    }

    match info.total_blocks {
        blocks if blocks <= BLOCKS_64GB => Ok(PartitionVariant::Userdata30),
        BLOCKS_128GB_A => Ok(PartitionVariant::Userdata89),
        BLOCKS_128GB_B => Ok(PartitionVariant::Userdata90),
        total_blocks => Err(ClassifyError::UnrecognizedDevice { total_blocks }),
    }
}
