//! Error types for configuration operations.

use std::path::PathBuf;

use mezcla_core::MixError;
use thiserror::Error;

/// Errors from loading, saving or building an engine document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The engine document could not be read.
    #[error("cannot read engine config '{path}': {source}")]
    ReadFile {
        /// Document path.
        path: PathBuf,
        /// I/O cause.
        #[source]
        source: std::io::Error,
    },

    /// The engine document could not be written.
    #[error("cannot write engine config '{path}': {source}")]
    WriteFile {
        /// Document path.
        path: PathBuf,
        /// I/O cause.
        #[source]
        source: std::io::Error,
    },

    /// The document's parent directory could not be created.
    #[error("cannot create config directory '{path}': {source}")]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// I/O cause.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid TOML or doesn't match the schema.
    #[error("malformed engine config: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// The document could not be rendered as TOML.
    #[error("cannot render engine config: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// The document describes an invalid engine or hierarchy.
    #[error("validation failed: {0}")]
    Validation(#[from] crate::validation::ValidationError),

    /// The engine refused the configuration.
    #[error("engine error: {0}")]
    Mix(#[from] MixError),
}

impl ConfigError {
    /// [`ConfigError::ReadFile`] for `path`.
    pub fn read_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ReadFile {
            path: path.into(),
            source,
        }
    }

    /// [`ConfigError::WriteFile`] for `path`.
    pub fn write_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::WriteFile {
            path: path.into(),
            source,
        }
    }

    /// [`ConfigError::CreateDir`] for `path`.
    pub fn create_dir(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::CreateDir {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::ValidationError;
    use std::error::Error;

    fn denied() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied")
    }

    #[test]
    fn read_file_display_names_path() {
        let err = ConfigError::read_file("/a/mix.toml", denied());
        let msg = err.to_string();
        assert!(msg.starts_with("cannot read engine config"), "got: {msg}");
        assert!(msg.contains("/a/mix.toml"), "got: {msg}");
        assert!(err.source().is_some());
    }

    #[test]
    fn write_file_keeps_path() {
        let err = ConfigError::write_file("/out/mix.toml", denied());
        let ConfigError::WriteFile { path, .. } = err else {
            panic!("expected WriteFile");
        };
        assert_eq!(path, std::path::Path::new("/out/mix.toml"));
    }

    #[test]
    fn create_dir_source_is_some() {
        let err = ConfigError::create_dir("/x", denied());
        assert!(err.source().is_some());
    }

    #[test]
    fn validation_error_converts() {
        let err: ConfigError = ValidationError::NoTopLevelBus.into();
        assert_eq!(err.to_string(), "validation failed: no top-level bus");
    }

    #[test]
    fn mix_error_converts() {
        let err: ConfigError = MixError::Config("frame_size is 0".into()).into();
        assert!(err.to_string().starts_with("engine error: invalid configuration"));
    }
}
