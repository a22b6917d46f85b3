//! Package registries.
//!
//! A registry produces descriptors from one source. Discovery never fails past
//! this boundary: unreadable bundles and unreachable catalogs only shrink the
//! result.

pub mod local;
pub mod remote;

pub use local::LocalRegistry;
pub use remote::{CatalogClient, RemoteRegistry};

use crate::packages::descriptor::{PackageDescriptor, PackageId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// HTTP error.
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Catalog answered with an unexpected status.
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// URL could not be built.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Identifies the source a descriptor was discovered in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKey {
    /// The install directory.
    Local,
    /// A remote catalog, by configured name.
    Remote(String),
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote(name) => write!(f, "remote:{}", name),
        }
    }
}

/// A source of package descriptors.
#[async_trait]
pub trait PackageRegistry: Send + Sync {
    /// Name shown to operators.
    fn name(&self) -> &str;

    /// Source key of descriptors from this registry.
    fn source(&self) -> SourceKey;

    /// Lists every descriptor the source currently offers.
    async fn read_packages(&self) -> Vec<Arc<PackageDescriptor>>;

    /// Reduces a raw listing to at most one descriptor per package id.
    async fn filter_packages(
        &self,
        packages: Vec<Arc<PackageDescriptor>>,
    ) -> Vec<Arc<PackageDescriptor>> {
        keep_latest(packages)
    }

    /// Reads and filters the listing.
    async fn packages(&self) -> Vec<Arc<PackageDescriptor>> {
        let raw = self.read_packages().await;
        let packages = self.filter_packages(raw).await;
        for descriptor in &packages {
            tracing::debug!(registry = %self.name(), package = %descriptor, "Package found");
        }
        packages
    }
}

/// Keeps the highest version per package id, ordered by id.
pub fn keep_latest(packages: Vec<Arc<PackageDescriptor>>) -> Vec<Arc<PackageDescriptor>> {
    let mut latest: BTreeMap<PackageId, Arc<PackageDescriptor>> = BTreeMap::new();
    for descriptor in packages {
        match latest.get(descriptor.id()) {
            Some(current) if current.version() >= descriptor.version() => {}
            _ => {
                latest.insert(descriptor.id().clone(), descriptor);
            }
        }
    }
    latest.into_values().collect()
}
