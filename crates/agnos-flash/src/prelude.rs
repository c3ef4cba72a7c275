//! Convenience re-exports for common flashing types

pub use crate::classifier::{PartitionVariant, classify};
pub use crate::config::{FlashConfig, FlashOptions, Release, ReleaseCatalog};
pub use crate::error::{
    ClassifyError, ConfigError, ErrorKind, ImageSourceError, ManifestError, TransportError,
    UsbAccessError,
};
pub use crate::events::{FlashEvent, FlashStatus};
pub use crate::fetch::{FileManifestSource, HttpManifestSource, source_for_url};
pub use crate::image::{DirectoryImageSource, ImageSource, MemoryImageSource};
pub use crate::manager::{FlashManager, FlashSession, Step};
pub use crate::manifest::{GptInfo, Manifest, ManifestImage, ManifestSource};
pub use crate::plan::FlashPlan;
pub use crate::transport::{DeviceTransport, PartitionLocation, Slot, StorageInfo, UsbAccess};
