//! Partition policy and flash planning
//!
//! Pure decisions shared by the orchestrator and by dry runs: which
//! partitions survive an erase, which images are written, and where.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::classifier::PartitionVariant;
use crate::config::FlashOptions;
use crate::manifest::{Manifest, ManifestImage};
use crate::transport::{PartitionLocation, Slot};

/// Calibration partition that must survive every erase
pub const PERSIST: &str = "persist";
/// User data partition
pub const USERDATA: &str = "userdata";
/// Partitions preserved on every logical unit
pub const ALWAYS_PRESERVED: [&str; 2] = ["mbr", "gpt"];

/// The only `persist` layout accepted before erasing
pub const EXPECTED_PERSIST: PartitionLocation = PartitionLocation {
    lun: 0,
    start: 8,
    sectors: 8192,
};

/// Slot activated when finalizing
pub const BOOT_SLOT: Slot = Slot::A;

/// Partitions to keep when erasing `lun`.
pub fn preserve_set(lun: u32, persist_lun: u32, userdata_lun: Option<u32>) -> BTreeSet<String> {
    let mut preserve: BTreeSet<String> = ALWAYS_PRESERVED.iter().map(|s| s.to_string()).collect();
    if lun == persist_lun {
        preserve.insert(PERSIST.to_string());
    }
    if userdata_lun == Some(lun) {
        preserve.insert(USERDATA.to_string());
    }
    preserve
}

/// Userdata image to write, if any.
///
/// Nothing is written when userdata is preserved or the device was not
/// classified.
pub fn userdata_selection(
    variant: Option<PartitionVariant>,
    options: &FlashOptions,
) -> Option<PartitionVariant> {
    if !options.flash_userdata {
        return None;
    }
    if variant.is_none() {
        warn!("Device variant unknown, no userdata image will be written");
    }
    variant
}

/// Partitions written by `image`, in write order.
pub fn target_partitions(image: &ManifestImage) -> Vec<String> {
    let base = image.partition_name();
    if image.has_ab {
        Slot::ALL
            .iter()
            .map(|slot| format!("{base}{}", slot.suffix()))
            .collect()
    } else {
        vec![base.to_string()]
    }
}

/// One partition table repair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GptRepair {
    /// Manifest image name
    pub image: String,
    /// Logical unit repaired
    pub lun: u32,
}

/// One system image and the partitions it is written to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageWrite {
    /// Manifest image name
    pub image: String,
    /// Raw size in bytes
    pub size: u64,
    /// Target partitions in write order
    pub targets: Vec<String>,
}

/// Everything a run would do to a device, given its variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashPlan {
    /// Classified variant, if known
    pub variant: Option<PartitionVariant>,
    /// Whether the userdata partition is kept during erase
    pub preserve_userdata: bool,
    /// Partition table repairs in manifest order
    pub repairs: Vec<GptRepair>,
    /// System image writes in manifest order
    pub writes: Vec<ImageWrite>,
    /// Slot activated at the end
    pub boot_slot: Slot,
}

impl FlashPlan {
    /// Plan a run of `manifest` on a device of `variant`.
    pub fn build(
        manifest: &Manifest,
        variant: Option<PartitionVariant>,
        options: &FlashOptions,
    ) -> Self {
        let repairs = manifest
            .gpt_images()
            .filter_map(|image| {
                image.gpt.map(|gpt| GptRepair {
                    image: image.name.clone(),
                    lun: gpt.lun,
                })
            })
            .collect();

        let writes = manifest
            .system_images(userdata_selection(variant, options))
            .into_iter()
            .map(|image| ImageWrite {
                image: image.name.clone(),
                size: image.size,
                targets: target_partitions(image),
            })
            .collect();

        Self {
            variant,
            preserve_userdata: !options.flash_userdata,
            repairs,
            writes,
            boot_slot: BOOT_SLOT,
        }
    }

    /// Total bytes written to the device, counting each slot.
    pub fn bytes_written(&self) -> u64 {
        self.writes
            .iter()
            .map(|w| w.size.saturating_mul(w.targets.len() as u64))
            .fold(0u64, u64::saturating_add)
    }

    /// Every target partition in write order.
    pub fn partitions(&self) -> impl Iterator<Item = &str> + '_ {
        self.writes
            .iter()
            .flat_map(|w| w.targets.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ManifestError;
    use crate::manifest::GptInfo;

    fn image(name: &str, size: u64, has_ab: bool) -> ManifestImage {
        ManifestImage {
            name: name.to_string(),
            url: format!("https://example.invalid/{name}.img.xz"),
            hash: None,
            hash_raw: None,
            size,
            sparse: false,
            has_ab,
            gpt: None,
        }
    }

    fn manifest() -> Result<Manifest, ManifestError> {
        let mut gpt = image("gpt_main_0", 10, false);
        gpt.gpt = Some(GptInfo {
            lun: 0,
            start_sector: None,
            num_sectors: None,
        });
        Manifest::new(vec![
            gpt,
            image("persist", 10, false),
            image("boot", 100, false),
            image("system", 200, true),
            image("userdata_30", 50, false),
            image("userdata_89", 60, false),
        ])
    }

    #[test]
    fn test_preserve_set_contents() {
        let set = preserve_set(0, 0, None);
        assert_eq!(
            set.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["gpt", "mbr", "persist"]
        );

        let set = preserve_set(4, 0, Some(4));
        assert!(set.contains("userdata"));
        assert!(!set.contains("persist"));

        let set = preserve_set(2, 0, Some(4));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_ab_images_fan_out_to_both_slots() {
        assert_eq!(
            target_partitions(&image("system", 1, true)),
            vec!["system_a", "system_b"]
        );
        assert_eq!(
            target_partitions(&image("userdata_89", 1, true)),
            vec!["userdata_a", "userdata_b"]
        );
        assert_eq!(target_partitions(&image("boot", 1, false)), vec!["boot"]);
    }

    #[test]
    fn test_plan_selects_variant() -> Result<(), ManifestError> {
        let plan = FlashPlan::build(
            &manifest()?,
            Some(PartitionVariant::Userdata89),
            &FlashOptions::default(),
        );
        assert_eq!(plan.repairs.len(), 1);
        assert_eq!(
            plan.partitions().collect::<Vec<_>>(),
            vec!["boot", "system_a", "system_b", "userdata"]
        );
        assert_eq!(plan.bytes_written(), 100 + 400 + 60);
        assert!(!plan.preserve_userdata);
        Ok(())
    }

    #[test]
    fn test_plan_preserving_userdata_writes_none() -> Result<(), ManifestError> {
        let options = FlashOptions {
            flash_userdata: false,
            ..FlashOptions::default()
        };
        let plan = FlashPlan::build(&manifest()?, Some(PartitionVariant::Userdata30), &options);
        assert!(plan.preserve_userdata);
        assert!(plan.partitions().all(|p| p != "userdata"));
        Ok(())
    }

    #[test]
    fn test_plan_without_variant_drops_userdata() -> Result<(), ManifestError> {
        let plan = FlashPlan::build(&manifest()?, None, &FlashOptions::default());
        assert_eq!(
            plan.partitions().collect::<Vec<_>>(),
            vec!["boot", "system_a", "system_b"]
        );
        Ok(())
    }
}
