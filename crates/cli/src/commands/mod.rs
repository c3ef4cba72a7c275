//! Command implementations for agnosctl CLI

pub mod classify;
pub mod plan;
pub mod simulate;
pub mod versions;

use agnos_flash::classifier::{BLOCK_SIZE, MEM_TYPE, NUM_PHYSICAL, PAGE_SIZE};
use agnos_flash::sim::{FailureMode, FailurePoint};
use agnos_flash::{Manifest, PartitionVariant, ReleaseCatalog, source_for_url};
use clap::{Args, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::CliError;

/// Which manifest to work with
#[derive(Args, Debug, Clone, Default)]
pub struct ManifestArgs {
    /// Manifest URL or path; defaults to the latest release
    pub manifest: Option<String>,

    /// Release id from the catalog, e.g. agnos-12.4
    #[arg(short, long, conflicts_with = "manifest")]
    pub release: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    #[command(flatten)]
    pub source: ManifestArgs,

    /// Device capacity in blocks, classified as a UFS part
    #[arg(long, conflicts_with = "variant")]
    pub total_blocks: Option<u64>,

    /// Userdata layout to plan for
    #[arg(long, value_enum)]
    pub variant: Option<VariantArg>,

    /// Keep the userdata partition instead of flashing it
    #[arg(long)]
    pub keep_userdata: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ClassifyArgs {
    /// Total block count reported by the device
    #[arg(long, required_unless_present = "storage_json")]
    pub total_blocks: Option<u64>,

    /// Block size in bytes
    #[arg(long, default_value_t = BLOCK_SIZE)]
    pub block_size: u32,

    /// Page size in bytes
    #[arg(long, default_value_t = PAGE_SIZE)]
    pub page_size: u32,

    /// Number of logical units
    #[arg(long, default_value_t = NUM_PHYSICAL)]
    pub num_physical: u32,

    /// Memory technology
    #[arg(long, default_value = MEM_TYPE)]
    pub mem_type: String,

    /// Read storage facts from a JSON file instead
    #[arg(long, conflicts_with = "total_blocks")]
    pub storage_json: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub source: ManifestArgs,

    /// Directory holding raw `<name>.img` files; synthetic data otherwise
    #[arg(long)]
    pub images: Option<PathBuf>,

    /// Skip the SHA-256 check of directory images
    #[arg(long, requires = "images")]
    pub no_hash_check: bool,

    /// Upper bound on synthetic image size in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    pub max_image_bytes: u64,

    /// Capacity of the simulated device in blocks
    #[arg(long, default_value_t = agnos_flash::classifier::BLOCKS_64GB)]
    pub total_blocks: u64,

    /// Keep the userdata partition instead of flashing it
    #[arg(long)]
    pub keep_userdata: bool,

    /// Read back every write
    #[arg(long)]
    pub verify: bool,

    /// Programmer binary to upload; a placeholder otherwise
    #[arg(long)]
    pub programmer: Option<PathBuf>,

    /// Inject a device failure at this operation
    #[arg(long)]
    pub fail: Option<FailurePoint>,

    /// How the injected failure shows up
    #[arg(long, value_enum, default_value_t = FailModeArg::Error, requires = "fail")]
    pub fail_mode: FailModeArg,

    /// Only fail when the operation targets this partition or unit
    #[arg(long, requires = "fail")]
    pub fail_target: Option<String>,

    /// Print every device operation after the run
    #[arg(long)]
    pub calls: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum VariantArg {
    /// 64 GB layout
    #[value(name = "userdata_30")]
    Userdata30,
    /// 128 GB layout, first part
    #[value(name = "userdata_89")]
    Userdata89,
    /// 128 GB layout, second part
    #[value(name = "userdata_90")]
    Userdata90,
}

impl From<VariantArg> for PartitionVariant {
    fn from(arg: VariantArg) -> Self {
        match arg {
            VariantArg::Userdata30 => PartitionVariant::Userdata30,
            VariantArg::Userdata89 => PartitionVariant::Userdata89,
            VariantArg::Userdata90 => PartitionVariant::Userdata90,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FailModeArg {
    /// Device answers negatively
    Reject,
    /// Transport breaks down
    Error,
}

impl From<FailModeArg> for FailureMode {
    fn from(arg: FailModeArg) -> Self {
        match arg {
            FailModeArg::Reject => FailureMode::Reject,
            FailModeArg::Error => FailureMode::Error,
        }
    }
}

/// Built-in catalog, or the one at `path`.
pub async fn load_catalog(path: Option<&Path>) -> Result<ReleaseCatalog, CliError> {
    let catalog = match path {
        Some(path) => ReleaseCatalog::load(path).await?,
        None => ReleaseCatalog::builtin()?,
    };
    catalog.validate()?;
    Ok(catalog)
}

/// Manifest URL named by `args`, falling back to the latest release.
pub fn resolve_manifest_url(
    args: &ManifestArgs,
    catalog: &ReleaseCatalog,
) -> Result<String, CliError> {
    if let Some(url) = &args.manifest {
        return Ok(url.clone());
    }
    let release = match &args.release {
        Some(id) => catalog
            .find(id)
            .ok_or_else(|| CliError::ReleaseNotFound(id.clone()))?,
        None => catalog
            .latest()
            .ok_or_else(|| CliError::ReleaseNotFound("latest".to_string()))?,
    };
    debug!("Using release {} ({})", release.id, release.manifest);
    Ok(release.manifest.clone())
}

/// Fetch and validate the manifest named by `args`.
pub async fn load_manifest(
    args: &ManifestArgs,
    catalog_path: Option<&Path>,
) -> Result<(String, Manifest), CliError> {
    let catalog = load_catalog(catalog_path).await?;
    let url = resolve_manifest_url(args, &catalog)?;
    let source = source_for_url(&url)?;
    let manifest = Manifest::load(source.as_ref(), &url).await?;
    Ok((url, manifest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_manifest_wins() -> Result<(), CliError> {
        let catalog = ReleaseCatalog::builtin()?;
        let args = ManifestArgs {
            manifest: Some("/tmp/all-partitions.json".to_string()),
            release: None,
        };
        assert_eq!(
            resolve_manifest_url(&args, &catalog)?,
            "/tmp/all-partitions.json"
        );
        Ok(())
    }

    #[test]
    fn test_release_lookup() -> Result<(), CliError> {
        let catalog = ReleaseCatalog::builtin()?;
        let args = ManifestArgs {
            manifest: None,
            release: Some("agnos-12.4".to_string()),
        };
        assert!(resolve_manifest_url(&args, &catalog)?.contains("/12.4/"));

        let missing = ManifestArgs {
            manifest: None,
            release: Some("agnos-1.0".to_string()),
        };
        assert!(matches!(
            resolve_manifest_url(&missing, &catalog),
            Err(CliError::ReleaseNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_default_is_latest_release() -> Result<(), CliError> {
        let catalog = ReleaseCatalog::builtin()?;
        let url = resolve_manifest_url(&ManifestArgs::default(), &catalog)?;
        assert!(url.contains("/13.1/"));
        Ok(())
    }

    #[test]
    fn test_variant_conversion() {
        assert_eq!(
            PartitionVariant::from(VariantArg::Userdata89),
            PartitionVariant::Userdata89
        );
        assert_eq!(FailureMode::from(FailModeArg::Reject), FailureMode::Reject);
    }
}
