//! Property-based tests for classification and flash planning

use agnos_flash::classifier::{BLOCK_SIZE, MEM_TYPE, NUM_PHYSICAL, PAGE_SIZE};
use agnos_flash::plan::{PERSIST, USERDATA, preserve_set};
use agnos_flash::prelude::*;
use proptest::prelude::*;

fn storage(
    block_size: u32,
    page_size: u32,
    num_physical: u32,
    mem_type: &str,
    total_blocks: u64,
) -> StorageInfo {
    StorageInfo {
        block_size,
        page_size,
        num_physical,
        mem_type: mem_type.to_string(),
        total_blocks,
        serial_num: 0,
        prod_name: String::new(),
    }
}

fn arb_mismatched_geometry() -> impl Strategy<Value = (u32, u32, u32, String)> {
    (
        prop_oneof![Just(BLOCK_SIZE), any::<u32>()],
        prop_oneof![Just(PAGE_SIZE), any::<u32>()],
        prop_oneof![Just(NUM_PHYSICAL), 0u32..16],
        prop_oneof![Just(MEM_TYPE.to_string()), "[A-Z]{2,5}"],
    )
        .prop_filter("geometry must differ", |(b, p, n, m)| {
            *b != BLOCK_SIZE || *p != PAGE_SIZE || *n != NUM_PHYSICAL || m != MEM_TYPE
        })
}

fn arb_image() -> impl Strategy<Value = ManifestImage> {
    (
        prop_oneof![
            Just("persist".to_string()),
            Just("userdata_30".to_string()),
            Just("userdata_89".to_string()),
            Just("userdata_90".to_string()),
            "[a-z]{3,10}",
        ],
        1u64..1_000_000,
        any::<bool>(),
        prop::option::of(0u32..6),
    )
        .prop_map(|(name, size, has_ab, gpt_lun)| ManifestImage {
            url: format!("https://example.invalid/{name}.img.xz"),
            name,
            hash: None,
            hash_raw: None,
            size,
            sparse: false,
            has_ab,
            gpt: gpt_lun.map(|lun| GptInfo {
                lun,
                start_sector: None,
                num_sectors: None,
            }),
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_geometry_mismatch_always_fails(
        (block_size, page_size, num_physical, mem_type) in arb_mismatched_geometry(),
        total_blocks in prop_oneof![
            Just(16_777_216u64),
            Just(29_605_888u64),
            Just(29_775_872u64),
            any::<u64>(),
        ],
    ) {
        let info = storage(block_size, page_size, num_physical, &mem_type, total_blocks);
        let is_mismatch = matches!(classify(&info), Err(ClassifyError::GeometryMismatch { .. }));
        prop_assert!(is_mismatch);
    }

    #[test]
    fn prop_classification_is_deterministic(total_blocks in any::<u64>()) {
        let info = storage(BLOCK_SIZE, PAGE_SIZE, NUM_PHYSICAL, MEM_TYPE, total_blocks);
        prop_assert_eq!(classify(&info), classify(&info.clone()));
    }

    #[test]
    fn prop_small_devices_are_64gb(total_blocks in 0u64..=16_777_216) {
        let info = storage(BLOCK_SIZE, PAGE_SIZE, NUM_PHYSICAL, MEM_TYPE, total_blocks);
        prop_assert_eq!(classify(&info), Ok(PartitionVariant::Userdata30));
    }

    #[test]
    fn prop_preserve_set_always_keeps_tables(
        lun in 0u32..6,
        persist_lun in 0u32..6,
        userdata_lun in prop::option::of(0u32..6),
    ) {
        let set = preserve_set(lun, persist_lun, userdata_lun);
        prop_assert!(set.contains("mbr"));
        prop_assert!(set.contains("gpt"));
        prop_assert_eq!(set.contains(PERSIST), lun == persist_lun);
        prop_assert_eq!(set.contains(USERDATA), userdata_lun == Some(lun));
    }

    #[test]
    fn prop_plan_never_writes_tables_or_persist(
        images in prop::collection::vec(arb_image(), 1..12),
        variant in prop::option::of(prop_oneof![
            Just(PartitionVariant::Userdata30),
            Just(PartitionVariant::Userdata89),
            Just(PartitionVariant::Userdata90),
        ]),
        flash_userdata in any::<bool>(),
    ) {
        let Ok(manifest) = Manifest::new(images) else {
            return Ok(());
        };
        let options = FlashOptions { flash_userdata, ..FlashOptions::default() };
        let plan = FlashPlan::build(&manifest, variant, &options);

        prop_assert_eq!(plan.repairs.len(), manifest.gpt_images().count());
        for write in &plan.writes {
            let image = manifest.find(&write.image);
            prop_assert!(image.is_some_and(|i| !i.is_gpt()));
            prop_assert_ne!(write.image.as_str(), PERSIST);
            if write.image.starts_with("userdata_") {
                prop_assert!(flash_userdata);
                prop_assert_eq!(Some(write.image.as_str()), variant.map(|v| v.image_name()));
            }
            let expected_targets = if image.is_some_and(|i| i.has_ab) { 2 } else { 1 };
            prop_assert_eq!(write.targets.len(), expected_targets);
        }
    }
}
