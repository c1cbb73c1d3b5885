//! Configuration types for ADDB
//!
//! Every section carries `#[serde(default)]` so a partial TOML file only
//! overrides what it names.

use crate::error::{Error, Result};
use crate::types::WORD_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Root configuration for ADDB
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AddbConfig {
    /// Node identity
    pub node: NodeConfig,
    /// Caching event manager
    pub cache: CacheConfig,
    /// RPC record sink
    pub rpc_sink: RpcSinkConfig,
    /// Storage record sink
    pub stob_sink: StobSinkConfig,
    /// Logging for the command line tools
    pub logging: LoggingConfig,
}

impl AddbConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Check all sections
    pub fn validate(&self) -> Result<()> {
        self.cache.store().validate()?;
        self.rpc_sink.store.validate()?;
        self.stob_sink.validate()
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node UUID; a random one is generated when unset
    pub node_uuid: Option<Uuid>,
}

/// Transient store geometry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransientStoreConfig {
    /// Pages allocated up front
    pub init_pages: usize,
    /// Upper bound on pages
    pub max_pages: usize,
    /// Page size in bytes (multiple of the word size)
    pub page_size: usize,
}

impl Default for TransientStoreConfig {
    fn default() -> Self {
        Self {
            init_pages: 16,
            max_pages: 64,
            page_size: 4096,
        }
    }
}

impl TransientStoreConfig {
    /// Smallest page that can hold a minimal record
    pub const MIN_PAGE_SIZE: usize = 8 * WORD_SIZE;

    /// Check the geometry
    pub fn validate(&self) -> Result<()> {
        if self.page_size % WORD_SIZE != 0 || self.page_size < Self::MIN_PAGE_SIZE {
            return Err(Error::Configuration(format!(
                "transient store page size {} must be a multiple of {} and at least {}",
                self.page_size,
                WORD_SIZE,
                Self::MIN_PAGE_SIZE
            )));
        }
        if self.init_pages == 0 || self.init_pages > self.max_pages {
            return Err(Error::Configuration(format!(
                "transient store pages: init {} must be in 1..={}",
                self.init_pages, self.max_pages
            )));
        }
        Ok(())
    }

    /// Words per page
    #[must_use]
    pub const fn words_per_page(&self) -> usize {
        self.page_size / WORD_SIZE
    }
}

/// Caching event manager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of pages, fixed for the life of the cache
    pub pages: usize,
    /// Page size in bytes
    pub page_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            pages: 4,
            page_size: 4096,
        }
    }
}

impl CacheConfig {
    /// Equivalent store geometry (initial size equals maximum size)
    #[must_use]
    pub const fn store(&self) -> TransientStoreConfig {
        TransientStoreConfig {
            init_pages: self.pages,
            max_pages: self.pages,
            page_size: self.page_size,
        }
    }
}

/// RPC sink configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSinkConfig {
    /// Staging store geometry
    pub store: TransientStoreConfig,
    /// Pages added when an allocation fails
    pub extend_pages: usize,
    /// Bound on the wait for in-flight items at finalization; unbounded
    /// when unset
    pub drain_timeout_ms: Option<u64>,
}

impl Default for RpcSinkConfig {
    fn default() -> Self {
        Self {
            store: TransientStoreConfig::default(),
            extend_pages: 4,
            drain_timeout_ms: None,
        }
    }
}

/// Storage sink configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StobSinkConfig {
    /// Segment size in bytes
    pub segment_size: u32,
    /// Repository size in bytes; rounded down to whole segments
    pub stob_size: u64,
    /// Maximum age of unpersisted records before skulk writes them
    pub timeout_ms: u64,
}

impl Default for StobSinkConfig {
    fn default() -> Self {
        Self {
            segment_size: 128 * 1024,
            stob_size: 128 * 1024 * 1024,
            timeout_ms: 5_000,
        }
    }
}

impl StobSinkConfig {
    /// Header plus trailer plus one word
    pub const MIN_SEGMENT_SIZE: u32 = 40;

    /// Check the geometry
    pub fn validate(&self) -> Result<()> {
        if self.segment_size as usize % WORD_SIZE != 0
            || self.segment_size < Self::MIN_SEGMENT_SIZE
        {
            return Err(Error::Configuration(format!(
                "segment size {} must be a multiple of {} and at least {}",
                self.segment_size,
                WORD_SIZE,
                Self::MIN_SEGMENT_SIZE
            )));
        }
        if self.segment_count() == 0 {
            return Err(Error::Configuration(format!(
                "stob size {} holds no {}-byte segment",
                self.stob_size, self.segment_size
            )));
        }
        Ok(())
    }

    /// Number of whole segments in the repository
    #[must_use]
    pub const fn segment_count(&self) -> u64 {
        self.stob_size / self.segment_size as u64
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: String,
    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AddbConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rpc_sink.store.init_pages, 16);
        assert_eq!(config.stob_sink.segment_count(), 1024);
        assert!(config.node.node_uuid.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config = AddbConfig::from_toml_str(
            r#"
            [stob_sink]
            segment_size = 8192
            stob_size = 81920

            [rpc_sink]
            drain_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.stob_sink.segment_count(), 10);
        assert_eq!(config.stob_sink.timeout_ms, 5_000);
        assert_eq!(config.rpc_sink.drain_timeout_ms, Some(250));
        assert_eq!(config.rpc_sink.extend_pages, 4);
    }

    #[test]
    fn test_invalid_geometry() {
        let store = TransientStoreConfig {
            init_pages: 4,
            max_pages: 2,
            page_size: 4096,
        };
        assert!(store.validate().is_err());

        let store = TransientStoreConfig {
            init_pages: 1,
            max_pages: 2,
            page_size: 4100,
        };
        assert!(store.validate().is_err());

        let sink = StobSinkConfig {
            segment_size: 8192,
            stob_size: 4096,
            timeout_ms: 0,
        };
        assert!(sink.validate().is_err());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addb.toml");
        std::fs::write(&path, "[cache]\npages = 2\n").unwrap();
        let config = AddbConfig::load(&path).unwrap();
        assert_eq!(config.cache.store().max_pages, 2);
    }
}
