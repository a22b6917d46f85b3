//! PXE Core - pluggable extensions engine.
//!
//! This crate discovers, installs, hot-replaces and publishes extension
//! bundles ("packages") for a host application:
//! - Local and remote package registries merged by a provider
//! - Isolated loading of each package version in a module arena
//! - Verified, cancellable bundle downloads
//! - Publication of installed packages to peer instances (gRPC with feature `grpc`)
//!
//! # Example
//!
//! ```rust,no_run
//! use pxe_core::{Config, ExtensionCatalog, PackageEngine};
//!
//! #[tokio::main]
//! async fn main() -> pxe_core::Result<()> {
//!     let config = Config::discover_and_load()?;
//!     let engine = PackageEngine::start(config, ExtensionCatalog::new()).await?;
//!     for entry in engine.refresh().await {
//!         println!("{} update available: {}", entry.id(), entry.update_available());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod packages;
pub mod publication;
#[cfg(feature = "grpc")]
pub mod server;

/// Generated protobuf code for the publication protocol.
#[cfg(feature = "grpc")]
#[allow(clippy::similar_names)]
#[allow(clippy::doc_markdown)]
pub mod proto {
    tonic::include_proto!("pxe.publication");
}

pub use config::{Config, ConfigError, OnUpdate};
pub use engine::PackageEngine;
pub use error::{PxeError, Result};
pub use packages::{
    BundleBuilder, DescriptorCache, Extension, ExtensionCatalog, ExtensionContext, ExtensionError,
    ExtensionFactory, ExtensionHandler, PackageDescriptor, PackageDownloader, PackageEntry, PackageId,
    PackageLoader, PackageProvider, RegisterOutcome, SourceKey, StateStore, Version,
};
pub use publication::{
    Advertisement, InstanceId, LocalPublicationService, PublicationError, PublicationService, UpdateEvent,
    UpdateMonitor,
};
