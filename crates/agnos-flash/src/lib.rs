//! Flashing orchestration for UFS devices in USB download mode
//!
//! This crate drives a complete reflash of a device reachable only through a
//! low-level download protocol:
//! - Storage classification and userdata image selection
//! - Partition table repair from GPT images
//! - Selective erase that keeps calibration data and optionally userdata
//! - System image writes with A/B slot fan-out
//! - Boot slot activation and reboot
//!
//! # Architecture
//!
//! - [`classifier`]: maps storage facts to a userdata layout
//! - [`manifest`]: release image list and its source trait
//! - [`fetch`]: HTTP and file manifest sources
//! - [`image`]: image source trait, directory and in-memory sources
//! - [`plan`]: preservation policy and flash planning
//! - [`transport`]: USB access and download protocol traits
//! - [`manager`]: the stage state machine
//! - [`events`]: lossless per-subscriber events and status snapshots
//! - [`config`]: run options and the release catalog
//! - [`sim`]: simulated device for tests and dry runs
//! - [`error`]: error types
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use agnos_flash::prelude::*;
//! use agnos_flash::sim::SimulatedDevice;
//!
//! # async fn example(manifest: Manifest) {
//! let device = SimulatedDevice::comma_3x();
//! let images = Arc::new(MemoryImageSource::synthetic(&manifest, 4096));
//! let source = Arc::new(agnos_flash::fetch::StaticManifestSource::new(
//!     manifest.images().to_vec(),
//! ));
//!
//! let config = FlashConfig::new("memory://release", vec![0u8; 16]);
//! let mut manager = FlashManager::new(config, device.transport(), device.usb(), source);
//! let mut events = manager.subscribe();
//!
//! manager.initialize(images).await;
//! manager.start().await;
//!
//! while let Ok(event) = events.try_recv() {
//!     println!("{event:?}");
//! }
//! assert_eq!(manager.session().step, Step::Done);
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod classifier;
pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod image;
pub mod manager;
pub mod manifest;
pub mod plan;
pub mod prelude;
pub mod sim;
pub mod transport;

pub use classifier::{PartitionVariant, classify};
pub use config::{FlashConfig, FlashOptions, LoaderConfig, Release, ReleaseCatalog};
pub use error::{
    ClassifyError, ConfigError, ErrorKind, ImageSourceError, ManifestError, TransportError,
    UsbAccessError,
};
pub use events::{EventEmitter, EventReceiver, FlashEvent, FlashStatus};
pub use fetch::{FileManifestSource, HttpManifestSource, StaticManifestSource, source_for_url};
pub use image::{DirectoryImageSource, ImageSource, MemoryImageSource};
pub use manager::{FlashManager, FlashSession, Step};
pub use manifest::{GptInfo, Manifest, ManifestImage, ManifestSource};
pub use plan::{FlashPlan, GptRepair, ImageWrite};
pub use transport::{DeviceTransport, PartitionLocation, Slot, StorageInfo, UsbAccess};
