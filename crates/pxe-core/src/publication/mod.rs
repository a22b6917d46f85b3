//! Package publication between instances.
//!
//! Every instance serves a [`PublicationService`]. Linked instances pull the
//! list of published packages, push publication changes to each other, and
//! download published bundles in chunks.

pub mod advertisement;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod service;
pub mod updates;

pub use crate::packages::handler::{PropertyAccess, PropertySummary};
pub use advertisement::{AdvertisedExtension, Advertisement, InstanceId};
pub use service::{LocalPublicationService, PublicationListener};
pub use updates::{UpdateCandidate, UpdateEvent, UpdateMonitor};

use crate::packages::descriptor::{DescriptorError, PackageId};
use crate::packages::state::StateError;
use crate::packages::version::Version;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

/// Publication errors.
#[derive(Debug, Error)]
pub enum PublicationError {
    /// Package is not installed on the serving instance.
    #[error("package {0} not found")]
    PackageNotFound(String),

    /// Serving instance runs a different version than requested.
    #[error("package {package} is at version {installed}, requested {requested}")]
    VersionMismatch {
        /// Package id.
        package: String,
        /// Requested version.
        requested: String,
        /// Installed version.
        installed: String,
    },

    /// An advertised extension type is unknown to the receiving host.
    #[error("package {package} uses unknown extension type {type_name}")]
    UnknownExtensionType {
        /// Advertised package.
        package: String,
        /// Unknown type name.
        type_name: String,
    },

    /// Bundle could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Descriptor metadata unavailable.
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Publication flag could not be persisted.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Remote call failed.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type for publication operations.
pub type Result<T> = std::result::Result<T, PublicationError>;

/// Chunked bundle bytes served to a peer.
pub type PackageByteStream = BoxStream<'static, Result<Bytes>>;

/// Operations one instance offers to its peers.
#[async_trait]
pub trait PublicationService: Send + Sync {
    /// Published packages with display strings in `locale`.
    async fn published_packages(&self, locale: &str) -> Result<Vec<Advertisement>>;

    /// Receives a publication change from a peer. The advertisement's
    /// instance set names the sender.
    async fn package_publication_changed(&self, advertisement: Advertisement, published: bool) -> Result<()>;

    /// Checksum of the bundle of an installed package version.
    async fn package_file_checksum(&self, id: &PackageId, version: &Version) -> Result<String>;

    /// Bundle bytes of an installed package version.
    async fn package_file_stream(&self, id: &PackageId, version: &Version) -> Result<PackageByteStream>;
}
