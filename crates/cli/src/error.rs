//! Error types for agnosctl CLI

use agnos_flash::{ClassifyError, ConfigError, ErrorKind, ManifestError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Flash failed: {}", .0.description())]
    FlashFailed(ErrorKind),

    #[error("Flash did not complete, stopped at {0}")]
    Incomplete(String),

    #[error("Unrecognized device: {0}")]
    UnrecognizedDevice(#[from] ClassifyError),

    #[error("Release not found: {0}")]
    ReleaseNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::FlashFailed(_) | CliError::Incomplete(_) => 2,
            CliError::UnrecognizedDevice(_) => 3,
            CliError::InvalidArgument(_) | CliError::JsonError(_) => 4,
            CliError::Manifest(_) | CliError::ReleaseNotFound(_) => 5,
            CliError::Config(_) => 6,
            CliError::IoError(_) => 1,
        }
    }

    /// Stable variant name reported as the JSON error `type`.
    pub fn type_name(&self) -> &'static str {
        match self {
            CliError::FlashFailed(_) => "FlashFailed",
            CliError::Incomplete(_) => "Incomplete",
            CliError::UnrecognizedDevice(_) => "UnrecognizedDevice",
            CliError::ReleaseNotFound(_) => "ReleaseNotFound",
            CliError::InvalidArgument(_) => "InvalidArgument",
            CliError::Manifest(_) => "Manifest",
            CliError::Config(_) => "Config",
            CliError::IoError(_) => "IoError",
            CliError::JsonError(_) => "JsonError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flash_failed_message_uses_description() {
        let err = CliError::FlashFailed(ErrorKind::EraseFailed);
        assert!(err.to_string().starts_with("Flash failed: "));
        assert!(err.to_string().contains(ErrorKind::EraseFailed.description()));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_exit_codes_are_distinct_per_category() {
        let manifest = CliError::Manifest(ManifestError::Empty);
        let argument = CliError::InvalidArgument("x".to_string());
        assert_eq!(manifest.exit_code(), 5);
        assert_eq!(argument.exit_code(), 4);
    }
}
