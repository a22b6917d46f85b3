//! Error types for pxe-core.

use crate::config::ConfigError;
use crate::packages::{
    BundleError, DescriptorError, DownloadError, HandlerError, LoaderError, ProviderError, RegistryError,
    StateError,
};
use crate::publication::PublicationError;
use thiserror::Error;

/// Top-level error for engine operations.
#[derive(Error, Debug)]
pub enum PxeError {
    /// Server-related errors
    #[cfg(feature = "grpc")]
    #[error("Server error: {0}")]
    Server(#[from] tonic::transport::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bundle errors
    #[error("Bundle error: {0}")]
    Bundle(#[from] BundleError),

    /// Descriptor errors
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// State errors
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Handler errors
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Loader errors
    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    /// Provider errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Download errors
    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    /// Publication errors
    #[error("Publication error: {0}")]
    Publication(#[from] PublicationError),

    /// Package or handler lookup failed
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, PxeError>;
