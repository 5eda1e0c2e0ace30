//! Session configuration.
//!
//! Loaded from TOML; every field has a default so an empty document is valid.
//!
//! ```toml
//! [transport]
//! max_frame_size = 67108864
//! chunk_size = 262144
//!
//! [fallback]
//! default_bwlimit = "50M"
//! preserve_sparse = true
//! ```

use crate::error::{MigrationError, Result};
use crate::fallback::BandwidthLimit;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Data chunk size for tree transfer
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024; // 256KB

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationConfig {
    pub transport: TransportConfig,
    pub fallback: FallbackConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Largest frame accepted from the peer
    pub max_frame_size: u32,
    /// Payload bytes per DATA frame
    pub chunk_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FallbackConfig {
    /// Used when the pool carries no `rsync.bwlimit` of its own
    pub default_bwlimit: Option<String>,
    /// Skip all-zero chunks so holes stay holes on the sink
    pub preserve_sparse: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            default_bwlimit: None,
            preserve_sparse: true,
        }
    }
}

impl MigrationConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| MigrationError::Validation(format!("Invalid migration config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::Validation(format!(
                "Failed to read migration config {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transport.chunk_size == 0 {
            return Err(MigrationError::Validation(
                "transport.chunk_size must be greater than zero".to_string(),
            ));
        }
        // Leave room for the DATA header inside a frame
        if self.transport.chunk_size as u64 + 4096 > self.transport.max_frame_size as u64 {
            return Err(MigrationError::Validation(format!(
                "transport.chunk_size {} does not fit in max_frame_size {}",
                self.transport.chunk_size, self.transport.max_frame_size
            )));
        }
        if let Some(limit) = &self.fallback.default_bwlimit {
            BandwidthLimit::parse(limit)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = MigrationConfig::from_toml_str("").unwrap();
        assert_eq!(config, MigrationConfig::default());
        assert_eq!(config.transport.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert!(config.fallback.preserve_sparse);
    }

    #[test]
    fn test_partial_config() {
        let config = MigrationConfig::from_toml_str(
            r#"
            [fallback]
            default_bwlimit = "10M"
            "#,
        )
        .unwrap();
        assert_eq!(config.fallback.default_bwlimit.as_deref(), Some("10M"));
        assert_eq!(config.transport.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = MigrationConfig::from_toml_str("[transport]\nfoo = 1\n").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
    }

    #[test]
    fn test_bad_bwlimit_rejected() {
        let err = MigrationConfig::from_toml_str("[fallback]\ndefault_bwlimit = \"fast\"\n")
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
    }

    #[test]
    fn test_chunk_must_fit_frame() {
        let err = MigrationConfig::from_toml_str(
            "[transport]\nmax_frame_size = 1024\nchunk_size = 4096\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not fit"));
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("migration.toml");
        std::fs::write(&path, "[transport]\nchunk_size = 65536\n").unwrap();
        let config = MigrationConfig::load(&path).unwrap();
        assert_eq!(config.transport.chunk_size, 65536);
    }
}
