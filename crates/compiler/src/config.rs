//! Backend configuration
//!
//! Settings that change how the backend treats its input rather than what
//! the input means. They can be built programmatically or read from a TOML
//! file, with command-line flags layered on top.
//!
//! # Example
//!
//! ```rust,ignore
//! use tpc::{BackendConfig, ErrorMode};
//!
//! let config = BackendConfig::new()
//!     .with_error_mode(ErrorMode::Suppress)
//!     .with_word_bytes(4);
//! ```
//!
//! The equivalent TOML:
//!
//! ```toml
//! error_mode = "suppress"
//! word_bytes = 4
//! ```

use serde::Deserialize;
use std::path::Path;

/// What the driver does with a lowering error it can recover from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// The first error aborts the compile
    #[default]
    Strict,
    /// Recoverable errors are logged and replaced by a placeholder
    Suppress,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub error_mode: ErrorMode,
    /// Bytes per machine word; the transfer size of a channel word
    pub word_bytes: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            error_mode: ErrorMode::Strict,
            word_bytes: 4,
        }
    }
}

impl BackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, String> {
        let config: BackendConfig = toml::from_str(toml_str)
            .map_err(|e| format!("Failed to parse backend config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;
        Self::from_toml(&content)
    }

    pub fn with_error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    pub fn with_word_bytes(mut self, bytes: u32) -> Self {
        self.word_bytes = bytes;
        self
    }

    pub fn suppresses_errors(&self) -> bool {
        self.error_mode == ErrorMode::Suppress
    }

    /// Check values that can also arrive from command-line overrides.
    pub fn validate(&self) -> Result<(), String> {
        match self.word_bytes {
            2 | 4 | 8 => Ok(()),
            other => Err(format!(
                "word_bytes must be 2, 4 or 8 (got {})",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BackendConfig::new();
        assert_eq!(config.error_mode, ErrorMode::Strict);
        assert_eq!(config.word_bytes, 4);
        assert!(!config.suppresses_errors());
    }

    #[test]
    fn test_builder() {
        let config = BackendConfig::new()
            .with_error_mode(ErrorMode::Suppress)
            .with_word_bytes(2);
        assert!(config.suppresses_errors());
        assert_eq!(config.word_bytes, 2);
    }

    #[test]
    fn test_from_toml() {
        let config = BackendConfig::from_toml("error_mode = \"suppress\"\n").unwrap();
        assert_eq!(config.error_mode, ErrorMode::Suppress);
        assert_eq!(config.word_bytes, 4);
    }

    #[test]
    fn test_rejects_unknown_keys_and_bad_word_size() {
        assert!(BackendConfig::from_toml("optimize = true\n").is_err());
        let err = BackendConfig::from_toml("word_bytes = 3\n").unwrap_err();
        assert!(err.contains("word_bytes"));
    }

    #[test]
    fn test_override_is_validated() {
        let config = BackendConfig::from_toml("word_bytes = 8\n").unwrap();
        assert!(config.validate().is_ok());
        let err = config.with_word_bytes(3).validate().unwrap_err();
        assert!(err.contains("word_bytes"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "word_bytes = 8").unwrap();
        let config = BackendConfig::load(file.path()).unwrap();
        assert_eq!(config.word_bytes, 8);
    }
}
