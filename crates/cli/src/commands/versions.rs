//! List the releases offered for flashing

use anyhow::Result;
use std::path::Path;

use crate::commands::load_catalog;
use crate::output;

/// Execute the versions command
pub async fn execute(catalog: Option<&Path>, json: bool) -> Result<()> {
    let catalog = load_catalog(catalog).await?;
    output::print_releases(&catalog, json);
    Ok(())
}
