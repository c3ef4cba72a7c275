//! Show what a flashing run would do

use agnos_flash::classifier::{BLOCK_SIZE, MEM_TYPE, NUM_PHYSICAL, PAGE_SIZE};
use agnos_flash::{FlashOptions, FlashPlan, PartitionVariant, StorageInfo, classify};
use anyhow::Result;
use std::path::Path;

use crate::commands::{PlanArgs, load_manifest};
use crate::error::CliError;
use crate::output;

/// Execute the plan command
pub async fn execute(args: &PlanArgs, catalog: Option<&Path>, json: bool) -> Result<()> {
    let variant = resolve_variant(args)?;
    let (url, manifest) = load_manifest(&args.source, catalog).await?;
    let options = FlashOptions {
        flash_userdata: !args.keep_userdata,
        ..FlashOptions::default()
    };
    let plan = FlashPlan::build(&manifest, variant, &options);
    output::print_plan(&url, &plan, json);
    Ok(())
}

fn resolve_variant(args: &PlanArgs) -> Result<Option<PartitionVariant>, CliError> {
    if let Some(variant) = args.variant {
        return Ok(Some(variant.into()));
    }
    let Some(total_blocks) = args.total_blocks else {
        return Ok(None);
    };
    let info = StorageInfo {
        block_size: BLOCK_SIZE,
        page_size: PAGE_SIZE,
        num_physical: NUM_PHYSICAL,
        mem_type: MEM_TYPE.to_string(),
        total_blocks,
        serial_num: 0,
        prod_name: String::new(),
    };
    Ok(Some(classify(&info)?))
}
