//! Image sources
//!
//! An [`ImageSource`] makes the raw bytes of manifest images available to the
//! flashing stages. Downloading and getting are separate so that progress can
//! be reported while the bytes are fetched.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::error::ImageSourceError;
use crate::manifest::{Manifest, ManifestImage};

const READ_CHUNK: usize = 1024 * 1024;

/// Provider of raw image bytes
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Prepare the source. Storage exhaustion is reported as
    /// [`ImageSourceError::StorageSpace`].
    async fn init(&self) -> Result<(), ImageSourceError>;

    /// Make `image` available, reporting a fraction in `[0, 1]`.
    async fn download_image(
        &self,
        image: &ManifestImage,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), ImageSourceError>;

    /// Raw bytes of a previously downloaded image.
    async fn get_image(&self, image: &ManifestImage) -> Result<Vec<u8>, ImageSourceError>;
}

/// Raw images stored as `<name>.img` in a local directory
///
/// The bytes read and verified by `download_image` are kept until
/// `get_image` hands them over, so a file changed on disk in between is
/// never flashed.
#[derive(Clone)]
pub struct DirectoryImageSource {
    root: PathBuf,
    verify_hashes: bool,
    downloaded: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl DirectoryImageSource {
    /// Serve images from `root`, checking `hash_raw` when present.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            verify_hashes: true,
            downloaded: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Enable or disable the SHA-256 check against `hash_raw`.
    pub fn with_hash_verification(mut self, verify: bool) -> Self {
        self.verify_hashes = verify;
        self
    }

    /// Directory images are read from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, image: &ManifestImage) -> PathBuf {
        self.root.join(image.file_name())
    }
}

impl fmt::Debug for DirectoryImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryImageSource")
            .field("root", &self.root)
            .field("verify_hashes", &self.verify_hashes)
            .field("downloaded", &self.downloaded.lock().len())
            .finish()
    }
}

#[async_trait]
impl ImageSource for DirectoryImageSource {
    async fn init(&self) -> Result<(), ImageSourceError> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            ImageSourceError::NotFound(format!("{}: {e}", self.root.display()))
        })?;
        if !metadata.is_dir() {
            return Err(ImageSourceError::NotFound(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        info!("Using image directory: {}", self.root.display());
        Ok(())
    }

    async fn download_image(
        &self,
        image: &ManifestImage,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), ImageSourceError> {
        let path = self.path_for(image);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| ImageSourceError::NotFound(format!("{}: {e}", path.display())))?;
        let total = file.metadata().await?.len();
        if total != image.size {
            warn!(
                image = %image.name,
                expected = image.size,
                actual = total,
                "Image size differs from manifest"
            );
        }

        let expected = image.hash_raw.as_deref().filter(|_| self.verify_hashes);
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; READ_CHUNK];
        let mut data = Vec::with_capacity(usize::try_from(total).unwrap_or(0));
        let mut read = 0u64;
        on_progress(0.0);
        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            let chunk = buffer.get(..n).unwrap_or_default();
            if expected.is_some() {
                hasher.update(chunk);
            }
            data.extend_from_slice(chunk);
            read = read.saturating_add(n as u64);
            if total > 0 {
                on_progress(read as f64 / total as f64);
            }
        }

        if let Some(expected) = expected {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(ImageSourceError::Integrity {
                    image: image.name.clone(),
                    expected: expected.to_string(),
                    actual,
                });
            }
            debug!(image = %image.name, "Hash verified");
        }

        self.downloaded.lock().insert(image.name.clone(), data);
        on_progress(1.0);
        Ok(())
    }

    async fn get_image(&self, image: &ManifestImage) -> Result<Vec<u8>, ImageSourceError> {
        self.downloaded.lock().remove(&image.name).ok_or_else(|| {
            ImageSourceError::NotFound(format!("{} has not been downloaded", image.name))
        })
    }
}

/// Images held in memory
#[derive(Debug, Default)]
pub struct MemoryImageSource {
    images: Mutex<HashMap<String, Vec<u8>>>,
    init_error: Mutex<Option<ImageSourceError>>,
    downloads: Mutex<Vec<String>>,
}

impl MemoryImageSource {
    /// Empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Source with deterministic filler data for every image of `manifest`.
    ///
    /// Each image gets `min(size, max_len)` bytes.
    pub fn synthetic(manifest: &Manifest, max_len: u64) -> Self {
        let source = Self::new();
        for image in manifest {
            let len = usize::try_from(image.size.min(max_len)).unwrap_or(usize::MAX);
            let fill = image.name.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
            source.insert(&image.name, vec![fill; len]);
        }
        source
    }

    /// Add or replace the bytes served for `name`.
    pub fn insert(&self, name: &str, data: Vec<u8>) {
        self.images.lock().insert(name.to_string(), data);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with_image(self, name: &str, data: Vec<u8>) -> Self {
        self.insert(name, data);
        self
    }

    /// Make the next `init` fail with `error`.
    pub fn fail_init(&self, error: ImageSourceError) {
        *self.init_error.lock() = Some(error);
    }

    /// Names passed to `download_image`, in call order.
    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().clone()
    }
}

#[async_trait]
impl ImageSource for MemoryImageSource {
    async fn init(&self) -> Result<(), ImageSourceError> {
        match self.init_error.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn download_image(
        &self,
        image: &ManifestImage,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), ImageSourceError> {
        self.downloads.lock().push(image.name.clone());
        if !self.images.lock().contains_key(&image.name) {
            return Err(ImageSourceError::NotFound(image.name.clone()));
        }
        on_progress(0.5);
        on_progress(1.0);
        Ok(())
    }

    async fn get_image(&self, image: &ManifestImage) -> Result<Vec<u8>, ImageSourceError> {
        self.images
            .lock()
            .get(&image.name)
            .cloned()
            .ok_or_else(|| ImageSourceError::NotFound(image.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(name: &str, size: u64, hash_raw: Option<String>) -> ManifestImage {
        ManifestImage {
            name: name.to_string(),
            url: format!("https://example.invalid/{name}.img.xz"),
            hash: None,
            hash_raw,
            size,
            sparse: false,
            has_ab: false,
            gpt: None,
        }
    }

    #[tokio::test]
    async fn test_directory_source_verifies_hash() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let data = b"boot image contents".to_vec();
        std::fs::write(dir.path().join("boot.img"), &data)?;
        let digest = hex::encode(Sha256::digest(&data));

        let source = DirectoryImageSource::new(dir.path());
        source.init().await?;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let on_progress = {
            let seen = Arc::clone(&seen);
            move |v: f64| seen.lock().push(v)
        };
        let boot = image("boot", data.len() as u64, Some(digest));
        source.download_image(&boot, &on_progress).await?;
        assert_eq!(source.get_image(&boot).await?, data);
        assert!(seen.lock().last().is_some_and(|&v| (v - 1.0).abs() < 1e-9));
        Ok(())
    }

    #[tokio::test]
    async fn test_directory_source_rejects_bad_hash() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("boot.img"), b"tampered")?;
        let source = DirectoryImageSource::new(dir.path());

        let boot = image("boot", 8, Some("00".repeat(32)));
        let result = source.download_image(&boot, &|_: f64| {}).await;
        assert!(matches!(result, Err(ImageSourceError::Integrity { .. })));

        let lenient = source.with_hash_verification(false);
        lenient.download_image(&boot, &|_: f64| {}).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_directory_source_serves_verified_bytes() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("boot.img");
        let data = b"verified boot".to_vec();
        std::fs::write(&path, &data)?;
        let digest = hex::encode(Sha256::digest(&data));

        let source = DirectoryImageSource::new(dir.path());
        let boot = image("boot", data.len() as u64, Some(digest));
        source.download_image(&boot, &|_: f64| {}).await?;

        // Replaced on disk after the hash check.
        std::fs::write(&path, b"swapped image")?;
        assert_eq!(source.get_image(&boot).await?, data);
        Ok(())
    }

    #[tokio::test]
    async fn test_directory_source_requires_download() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("boot.img"), b"boot")?;
        let source = DirectoryImageSource::new(dir.path());
        let boot = image("boot", 4, Some("00".repeat(32)));

        assert!(matches!(
            source.get_image(&boot).await,
            Err(ImageSourceError::NotFound(_))
        ));
        assert!(source.download_image(&boot, &|_: f64| {}).await.is_err());
        assert!(matches!(
            source.get_image(&boot).await,
            Err(ImageSourceError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_directory_source_missing_root() {
        let source = DirectoryImageSource::new("/nonexistent/images");
        assert!(matches!(
            source.init().await,
            Err(ImageSourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_source_init_error_is_taken_once() {
        let source = MemoryImageSource::new();
        source.fail_init(ImageSourceError::StorageSpace("0 bytes free".to_string()));
        assert!(matches!(
            source.init().await,
            Err(ImageSourceError::StorageSpace(_))
        ));
        assert!(source.init().await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_source_missing_image() -> Result<(), ImageSourceError> {
        let source = MemoryImageSource::new().with_image("boot", vec![1, 2, 3]);
        let boot = image("boot", 3, None);
        source.download_image(&boot, &|_: f64| {}).await?;
        assert_eq!(source.get_image(&boot).await?, vec![1, 2, 3]);

        let missing = image("system", 3, None);
        assert!(source.download_image(&missing, &|_: f64| {}).await.is_err());
        assert_eq!(source.downloads(), vec!["boot", "system"]);
        Ok(())
    }
}
