//! Configuration, loadable from TOML.
//!
//! ```toml
//! [chunking]
//! pattern = 0.01
//! seed = 42
//!
//! [store]
//! spec = "cached-file:///var/lib/quiver/chunks"
//! cache_size = 1000
//!
//! [datasets]
//! spec = "file:///var/lib/quiver/datasets.json"
//!
//! [commit]
//! max_retries = 5
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Parameters of the chunk boundary function and the inline policy.
///
/// Two stores only share structure when they chunk with the same parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Probability that any given item closes a node
    pub pattern: f64,
    pub seed: u32,
    pub min_node_items: usize,
    /// Hard cap, forces a boundary
    pub max_node_items: usize,
    /// Largest encoded leaf, in bytes, embedded inline in its parent value
    pub inline_threshold: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        ChunkConfig {
            pattern: 0.01,
            seed: 42,
            min_node_items: 2,
            max_node_items: 4096,
            inline_threshold: 4096,
        }
    }
}

impl ChunkConfig {
    /// Convenience for tests and tools that only vary the pattern.
    pub fn with_pattern(pattern: f64) -> Self {
        ChunkConfig {
            pattern,
            ..ChunkConfig::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.pattern > 0.0 && self.pattern <= 1.0) {
            return Err(Error::Config(format!(
                "chunking.pattern must be in (0, 1], got {}",
                self.pattern
            )));
        }
        if self.min_node_items < 2 {
            return Err(Error::Config(format!(
                "chunking.min_node_items must be at least 2, got {}",
                self.min_node_items
            )));
        }
        if self.max_node_items < self.min_node_items {
            return Err(Error::Config(format!(
                "chunking.max_node_items ({}) is below min_node_items ({})",
                self.max_node_items, self.min_node_items
            )));
        }
        Ok(())
    }

    /// Boundary threshold on the 32-bit item hash.
    pub fn threshold(&self) -> u32 {
        (self.pattern * u32::MAX as f64) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// ":memory:", "file:///path" or "cached-file:///path"
    pub spec: String,
    pub cache_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            spec: ":memory:".to_string(),
            cache_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// ":memory:" or "file:///path/to/datasets.json"
    pub spec: String,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        DatasetConfig {
            spec: ":memory:".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Attempts at the head compare-and-swap before giving up
    pub max_retries: u32,
}

impl Default for CommitConfig {
    fn default() -> Self {
        CommitConfig { max_retries: 5 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub chunking: ChunkConfig,
    pub store: StoreConfig,
    pub datasets: DatasetConfig,
    pub commit: CommitConfig,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Config::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        if self.commit.max_retries == 0 {
            return Err(Error::Config("commit.max_retries must be at least 1".into()));
        }
        Ok(())
    }
}
