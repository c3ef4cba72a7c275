//! Firmware manifest model
//!
//! A manifest is the ordered list of images making up a release. It is
//! fetched once through a [`ManifestSource`], validated, and then shared
//! read-only by every stage of a run.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::classifier::PartitionVariant;
use crate::error::ManifestError;

/// Prefix shared by the capacity-specific userdata images
pub const USERDATA_PREFIX: &str = "userdata_";

/// Marks an image as the partition table of a logical unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GptInfo {
    /// Logical unit the table belongs to
    pub lun: u32,
    /// First sector of the table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_sector: Option<u64>,
    /// Length of the table in sectors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_sectors: Option<u64>,
}

/// One image of a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestImage {
    /// Partition name, or a `userdata_*` variant name
    pub name: String,
    /// Download location
    pub url: String,
    /// Hash of the downloaded (possibly compressed) file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// SHA-256 of the raw image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_raw: Option<String>,
    /// Raw image size in bytes
    pub size: u64,
    /// Whether the image is in sparse format
    #[serde(default)]
    pub sparse: bool,
    /// Whether the image goes to both boot slots
    #[serde(default)]
    pub has_ab: bool,
    /// Present on partition table images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpt: Option<GptInfo>,
}

impl ManifestImage {
    /// Whether this is a partition table image.
    pub fn is_gpt(&self) -> bool {
        self.gpt.is_some()
    }

    /// Whether this is one of the capacity-specific userdata images.
    pub fn is_userdata_variant(&self) -> bool {
        self.name.starts_with(USERDATA_PREFIX)
    }

    /// Partition written by this image, without slot suffix.
    pub fn partition_name(&self) -> &str {
        if self.is_userdata_variant() {
            "userdata"
        } else {
            &self.name
        }
    }

    /// File name of the raw image in a local image directory.
    pub fn file_name(&self) -> String {
        format!("{}.img", self.name)
    }
}

/// Validated, immutable list of release images
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Manifest {
    images: Vec<ManifestImage>,
}

impl Manifest {
    /// Validate a list of images.
    pub fn new(images: Vec<ManifestImage>) -> Result<Self, ManifestError> {
        if images.is_empty() {
            return Err(ManifestError::Empty);
        }

        let mut names = HashSet::new();
        let mut gpt_luns = HashSet::new();
        for image in &images {
            if image.name.trim().is_empty() {
                return Err(ManifestError::Invalid("image with empty name".to_string()));
            }
            if image.url.trim().is_empty() {
                return Err(ManifestError::Invalid(format!(
                    "image {} has no url",
                    image.name
                )));
            }
            if image.size == 0 {
                return Err(ManifestError::Invalid(format!(
                    "image {} has zero size",
                    image.name
                )));
            }
            if !names.insert(image.name.as_str()) {
                return Err(ManifestError::Invalid(format!(
                    "duplicate image {}",
                    image.name
                )));
            }
            if let Some(gpt) = &image.gpt
                && !gpt_luns.insert(gpt.lun)
            {
                return Err(ManifestError::Invalid(format!(
                    "more than one partition table for LUN {}",
                    gpt.lun
                )));
            }
        }

        Ok(Self { images })
    }

    /// Parse and validate a JSON manifest.
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        let images: Vec<ManifestImage> = serde_json::from_str(json)?;
        Self::new(images)
    }

    /// Fetch, parse and validate the manifest at `url`.
    pub async fn load(source: &dyn ManifestSource, url: &str) -> Result<Self, ManifestError> {
        debug!(url, "Fetching manifest");
        let manifest = Self::new(source.fetch(url).await?)?;
        info!(
            url,
            images = manifest.len(),
            gpt = manifest.gpt_images().count(),
            "Loaded manifest"
        );
        Ok(manifest)
    }

    /// All images in manifest order.
    pub fn images(&self) -> &[ManifestImage] {
        &self.images
    }

    /// Iterate images in manifest order.
    pub fn iter(&self) -> std::slice::Iter<'_, ManifestImage> {
        self.images.iter()
    }

    /// Number of images.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Always `false` for a validated manifest.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Look up an image by name.
    pub fn find(&self, name: &str) -> Option<&ManifestImage> {
        self.images.iter().find(|image| image.name == name)
    }

    /// Partition table images in manifest order.
    pub fn gpt_images(&self) -> impl Iterator<Item = &ManifestImage> + '_ {
        self.images.iter().filter(|image| image.is_gpt())
    }

    /// Images written during system flashing.
    ///
    /// Partition tables and `persist` are never included. With `Some(variant)`
    /// only the matching userdata image is kept; with `None` every userdata
    /// image is dropped.
    pub fn system_images(&self, userdata: Option<PartitionVariant>) -> Vec<&ManifestImage> {
        self.images
            .iter()
            .filter(|image| !image.is_gpt() && image.name != crate::plan::PERSIST)
            .filter(|image| {
                !image.is_userdata_variant()
                    || userdata.is_some_and(|variant| image.name == variant.image_name())
            })
            .collect()
    }
}

impl<'a> IntoIterator for &'a Manifest {
    type Item = &'a ManifestImage;
    type IntoIter = std::slice::Iter<'a, ManifestImage>;

    fn into_iter(self) -> Self::IntoIter {
        self.images.iter()
    }
}

/// Where manifests come from
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetch and parse the image list at `url`.
    async fn fetch(&self, url: &str) -> Result<Vec<ManifestImage>, ManifestError>;
}

#[async_trait]
impl<S: ManifestSource + ?Sized> ManifestSource for Arc<S> {
    async fn fetch(&self, url: &str) -> Result<Vec<ManifestImage>, ManifestError> {
        (**self).fetch(url).await
    }
}
