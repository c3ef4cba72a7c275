//! Classify a device from its storage facts

use agnos_flash::{StorageInfo, classify};
use anyhow::Result;
use tracing::debug;

use crate::commands::ClassifyArgs;
use crate::error::CliError;
use crate::output;

/// Execute the classify command
pub async fn execute(args: &ClassifyArgs, json: bool) -> Result<()> {
    let info = storage_info(args).await?;
    debug!("Classifying {} blocks", info.total_blocks);
    let variant = classify(&info).map_err(CliError::from)?;
    output::print_classification(&info, variant, json);
    Ok(())
}

async fn storage_info(args: &ClassifyArgs) -> Result<StorageInfo, CliError> {
    if let Some(path) = &args.storage_json {
        let content = tokio::fs::read_to_string(path).await?;
        return Ok(serde_json::from_str(&content)?);
    }
    let total_blocks = args.total_blocks.ok_or_else(|| {
        CliError::InvalidArgument("--total-blocks or --storage-json is required".to_string())
    })?;
    Ok(StorageInfo {
        block_size: args.block_size,
        page_size: args.page_size,
        num_physical: args.num_physical,
        mem_type: args.mem_type.clone(),
        total_blocks,
        serial_num: 0,
        prod_name: String::new(),
    })
}
