// PhotonDB Registry - Rust Implementation
// A lock-free registry for named, asynchronously built resources

#![warn(rust_2018_idioms)]

pub mod config;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod registry;

// Re-exports for convenience
pub use config::RegistryConfig;
pub use pool::{FixedPool, GrowablePool, PoolHandle};
pub use queue::LockFreeQueue;
pub use registry::{hash, Entry, EntryStatus, Key, Lifetime, Placeholders, Registry, RegistryStats};

/// Registry error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Pool error: {0}")]
        Pool(String),

        #[error("Not owned: {0}")]
        NotOwned(String),

        #[error("Queue error: {0}")]
        Queue(String),

        #[error("Registry error: {0}")]
        Registry(String),

        #[error("Outstanding operations: {makes} makes, {unmakes} unmakes still queued")]
        OutstandingOperations { makes: usize, unmakes: usize },

        #[error("Placeholder '{name}' failed to build: {reason}")]
        Placeholder { name: String, reason: String },

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
