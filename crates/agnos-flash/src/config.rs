//! Run configuration and the release catalog

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

/// Built-in release catalog
pub const BUILTIN_CATALOG: &str = include_str!("../config/releases.yaml");

/// Behaviour switches for a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashOptions {
    /// Overwrite userdata; when `false` the existing partition is preserved
    pub flash_userdata: bool,
    /// Ask the transport to read back every write
    pub verify_writes: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            flash_userdata: true,
            verify_writes: false,
        }
    }
}

/// Everything the orchestrator needs besides its collaborators
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Location of the release manifest
    pub manifest_url: String,
    /// Programmer binary uploaded on connect
    #[serde(skip)]
    pub programmer: Vec<u8>,
    /// Behaviour switches
    #[serde(default)]
    pub options: FlashOptions,
}

impl FlashConfig {
    /// Config with default options.
    pub fn new(manifest_url: impl Into<String>, programmer: Vec<u8>) -> Self {
        Self {
            manifest_url: manifest_url.into(),
            programmer,
            options: FlashOptions::default(),
        }
    }

    /// Replace the options.
    pub fn with_options(mut self, options: FlashOptions) -> Self {
        self.options = options;
        self
    }
}

impl std::fmt::Debug for FlashConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashConfig")
            .field("manifest_url", &self.manifest_url)
            .field("programmer_len", &self.programmer.len())
            .field("options", &self.options)
            .finish()
    }
}

/// A flashable release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    /// Stable identifier, e.g. `agnos-13.1`
    pub id: String,
    /// Display name
    pub name: String,
    /// Manifest URL
    pub manifest: String,
    /// Whether this is the recommended release
    #[serde(default)]
    pub is_latest: bool,
}

/// Where the programmer binary is downloaded from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Programmer URL
    pub url: String,
}

/// Releases offered for flashing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseCatalog {
    /// Releases, newest first
    pub versions: Vec<Release>,
    /// Programmer location
    pub loader: LoaderConfig,
}

impl ReleaseCatalog {
    /// The catalog shipped with this crate.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_yaml_str(BUILTIN_CATALOG)
    }

    /// Parse and validate a YAML catalog.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let catalog: Self = serde_yaml::from_str(yaml)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Parse and validate a JSON catalog.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let catalog: Self = serde_json::from_str(json)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a catalog file; `.json` files are parsed as JSON, anything else as YAML.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let catalog = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content)?,
            _ => Self::from_yaml_str(&content)?,
        };
        info!(
            path = %path.display(),
            releases = catalog.versions.len(),
            "Loaded release catalog"
        );
        Ok(catalog)
    }

    /// Check that ids are unique, urls are set and at most one release is latest.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.versions.is_empty() {
            return Err(ConfigError::Invalid("no releases".to_string()));
        }
        if self.loader.url.trim().is_empty() {
            return Err(ConfigError::Invalid("loader url is empty".to_string()));
        }

        let mut ids = HashSet::new();
        for release in &self.versions {
            if !ids.insert(release.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate release {}",
                    release.id
                )));
            }
            if release.manifest.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "release {} has no manifest",
                    release.id
                )));
            }
        }

        if self.versions.iter().filter(|r| r.is_latest).count() > 1 {
            return Err(ConfigError::Invalid(
                "more than one release marked latest".to_string(),
            ));
        }
        Ok(())
    }

    /// Release marked latest, falling back to the first one.
    pub fn latest(&self) -> Option<&Release> {
        self.versions
            .iter()
            .find(|r| r.is_latest)
            .or_else(|| self.versions.first())
    }

    /// Look up a release by id.
    pub fn find(&self, id: &str) -> Option<&Release> {
        self.versions.iter().find(|r| r.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() -> Result<(), ConfigError> {
        let catalog = ReleaseCatalog::builtin()?;
        assert_eq!(catalog.versions.len(), 3);
        assert_eq!(catalog.latest().map(|r| r.id.as_str()), Some("agnos-13.1"));
        assert!(catalog.find("agnos-11.13").is_some_and(|r| !r.is_latest));
        assert!(catalog.loader.url.ends_with("programmer.bin"));
        Ok(())
    }

    #[test]
    fn test_duplicate_release_rejected() {
        let yaml = r#"
versions:
  - { id: a, name: A, manifest: "https://x/a.json" }
  - { id: a, name: A2, manifest: "https://x/b.json" }
loader: { url: "https://x/programmer.bin" }
"#;
        assert!(matches!(
            ReleaseCatalog::from_yaml_str(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_json_catalog_latest_falls_back_to_first() -> Result<(), ConfigError> {
        let json = r#"{"versions":[{"id":"a","name":"A","manifest":"m"},
                                   {"id":"b","name":"B","manifest":"n"}],
                      "loader":{"url":"u"}}"#;
        let catalog = ReleaseCatalog::from_json_str(json)?;
        assert_eq!(catalog.latest().map(|r| r.id.as_str()), Some("a"));
        Ok(())
    }

    #[tokio::test]
    async fn test_load_from_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("releases.yaml");
        std::fs::write(&path, BUILTIN_CATALOG)?;
        let catalog = ReleaseCatalog::load(&path).await?;
        assert_eq!(catalog, ReleaseCatalog::builtin()?);
        Ok(())
    }

    #[test]
    fn test_flash_options_defaults() -> Result<(), serde_json::Error> {
        let options: FlashOptions = serde_json::from_str("{}")?;
        assert!(options.flash_userdata);
        assert!(!options.verify_writes);

        let config = FlashConfig::new("file:///tmp/m.json", vec![1, 2]);
        assert!(format!("{config:?}").contains("programmer_len: 2"));
        Ok(())
    }
}
