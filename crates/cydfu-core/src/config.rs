//! Configuration file support.
//!
//! ```toml
//! [session]
//! write_fragment_len = 20
//! timeout_ms = 3000
//!
//! [update]
//! chunk_size = 256
//! product_id = 0x01020304
//! exit_on_failure = true
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::session::SessionConfig;
use crate::update::UpdateConfig;

/// Top-level configuration. Every key is optional.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DfuConfig {
    pub session: SessionConfig,
    pub update: UpdateConfig,
}

impl DfuConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: DfuConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        self.update.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DEFAULT_CHUNK_SIZE, DEFAULT_WRITE_FRAGMENT_LEN};

    #[test]
    fn test_defaults() {
        let config = DfuConfig::default();
        assert_eq!(config.session.write_fragment_len, DEFAULT_WRITE_FRAGMENT_LEN);
        assert_eq!(config.session.timeout_ms, None);
        assert_eq!(config.update.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.update.exit_on_failure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cydfu.toml");
        std::fs::write(
            &path,
            "[session]\ntimeout_ms = 5000\n\n[update]\nchunk_size = 128\nproduct_id = 0x01020304\n",
        )
        .unwrap();

        let config = DfuConfig::load_from_file(&path).unwrap();
        assert_eq!(config.session.timeout_ms, Some(5000));
        assert_eq!(config.session.write_fragment_len, DEFAULT_WRITE_FRAGMENT_LEN);
        assert_eq!(config.update.chunk_size, 128);
        assert_eq!(config.update.product_id, Some(0x0102_0304));
        assert_eq!(config.update.app_id, None);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cydfu.toml");
        let mut config = DfuConfig::default();
        config.update.app_id = Some(1);
        config.session.write_fragment_len = 244;

        config.save_to_file(&path).unwrap();
        assert_eq!(DfuConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cydfu.toml");
        std::fs::write(&path, "[update]\nchunk_size = 0\n").unwrap();
        assert!(DfuConfig::load_from_file(&path).is_err());

        std::fs::write(&path, "[session]\nwrite_fragment_len = 0\n").unwrap();
        assert!(DfuConfig::load_from_file(&path).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(DfuConfig::load_from_file("/nonexistent/cydfu.toml").is_err());
    }
}
