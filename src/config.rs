//! Registry configuration
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `PHOTON_REGISTRY_*` environment variables.

use crate::error::{Error, Result};
use crate::pool::growable::MAX_CHUNKS;
use crate::pool::MAX_BLOCKS;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "PHOTON_REGISTRY";

fn default_capacity() -> usize {
    4096
}

fn default_queue_chunk_size() -> usize {
    crate::queue::DEFAULT_CHUNK_SIZE
}

fn default_queue_max_chunks() -> usize {
    crate::queue::DEFAULT_MAX_CHUNKS
}

fn default_queue_initial_capacity() -> usize {
    1024
}

fn default_flush_budget() -> usize {
    256
}

/// Sizing for a [`Registry`](crate::registry::Registry)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Number of resource slots
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Nodes added per growth step of each work queue
    #[serde(default = "default_queue_chunk_size")]
    pub queue_chunk_size: usize,

    /// Growth limit for each work queue, in chunks
    #[serde(default = "default_queue_max_chunks")]
    pub queue_max_chunks: usize,

    /// Queue nodes reserved up front
    #[serde(default = "default_queue_initial_capacity")]
    pub queue_initial_capacity: usize,

    /// Operations a driver loop hands to each `flush` call
    #[serde(default = "default_flush_budget")]
    pub flush_budget: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            queue_chunk_size: default_queue_chunk_size(),
            queue_max_chunks: default_queue_max_chunks(),
            queue_initial_capacity: default_queue_initial_capacity(),
            flush_budget: default_flush_budget(),
        }
    }
}

impl RegistryConfig {
    /// Defaults with a different slot count
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Load defaults, then `path` if it exists, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::new(&path.to_string_lossy(), config::FileFormat::Toml).required(false),
            );
        }

        let config: Self = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse inline TOML
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value against the pool limits
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 || self.capacity > MAX_BLOCKS {
            return Err(Error::Config(format!(
                "capacity must be in 1..={}, got {}",
                MAX_BLOCKS, self.capacity
            )));
        }
        if self.queue_chunk_size == 0 || self.queue_chunk_size > MAX_BLOCKS {
            return Err(Error::Config(format!(
                "queue_chunk_size must be in 1..={}, got {}",
                MAX_BLOCKS, self.queue_chunk_size
            )));
        }
        if self.queue_max_chunks == 0 || self.queue_max_chunks > MAX_CHUNKS {
            return Err(Error::Config(format!(
                "queue_max_chunks must be in 1..={}, got {}",
                MAX_CHUNKS, self.queue_max_chunks
            )));
        }
        // One node per queue goes to its dummy
        let reachable = self.queue_chunk_size * self.queue_max_chunks;
        if self.queue_initial_capacity >= reachable {
            return Err(Error::Config(format!(
                "queue_initial_capacity {} does not fit in {} chunks of {}",
                self.queue_initial_capacity, self.queue_max_chunks, self.queue_chunk_size
            )));
        }
        if self.flush_budget == 0 {
            return Err(Error::Config("flush_budget must be positive".to_string()));
        }
        Ok(())
    }
}
