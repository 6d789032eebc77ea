//! Resource lifetime policy
//!
//! The registry never builds or frees resources itself. It hands payloads
//! to a [`Lifetime`] from `flush` and gives finished resources back to it
//! when they are retired.

use std::fmt::Display;
use std::sync::Arc;

/// Builds and destroys the resources a registry caches
///
/// `create` runs only on the thread calling `flush`. `destroy` receives the
/// registry's reference to a retired resource; readers that still hold a
/// clone keep the memory alive until they drop it.
pub trait Lifetime: Send + Sync {
    /// Input a resource is built from (source text, file contents)
    type Payload: Send + Sync;
    /// Built resource handed out to readers
    type Resource: Send + Sync;
    /// Build failure reason
    type Error: Display;

    /// Build a resource from `payload`
    fn create(&self, payload: &Self::Payload, name: &str) -> Result<Self::Resource, Self::Error>;

    /// Release a resource the registry no longer publishes
    fn destroy(&self, resource: Arc<Self::Resource>) {
        drop(resource);
    }
}

/// Payloads for the three sentinel resources
#[derive(Debug, Clone)]
pub struct Placeholders<P> {
    /// Stands in for keys that were never requested
    pub missing: P,
    /// Stands in for failed builds
    pub failed: P,
    /// Stands in while a build is queued or running
    pub making: P,
}

impl<P> Placeholders<P> {
    pub fn new(missing: P, failed: P, making: P) -> Self {
        Self {
            missing,
            failed,
            making,
        }
    }

    /// Pairs of sentinel name and payload, in construction order
    pub(crate) fn named(&self) -> [(&'static str, &P); 3] {
        [
            ("missing", &self.missing),
            ("failed", &self.failed),
            ("making", &self.making),
        ]
    }
}

impl<P: Clone> Placeholders<P> {
    /// Use the same payload for every sentinel
    pub fn uniform(payload: P) -> Self {
        Self::new(payload.clone(), payload.clone(), payload)
    }
}
