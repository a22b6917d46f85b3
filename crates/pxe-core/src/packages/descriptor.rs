//! Package descriptors.
//!
//! A [`PackageDescriptor`] is the immutable identity and metadata of one
//! discoverable package version. Local descriptors are parsed from bundle
//! files and cached by path in a [`DescriptorCache`]; remote descriptors come
//! from a catalog and fetch their checksum and compatibility on first use.

use crate::packages::bundle::{self, BundleError, ExtensionEntry, VersionEntry};
use crate::packages::checksum;
use crate::packages::version::{Version, VersionError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::OnceCell;

/// Descriptor errors.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bundle could not be read.
    #[error("bundle error: {0}")]
    Bundle(#[from] BundleError),

    /// Version error.
    #[error("version error: {0}")]
    Version(#[from] VersionError),

    /// Package id is malformed.
    #[error("invalid package id '{0}', expected vendor/title")]
    InvalidId(String),

    /// Remote metadata could not be fetched.
    #[error("remote metadata unavailable: {0}")]
    Remote(String),

    /// Descriptor has no checksum source.
    #[error("no checksum available for {0}")]
    NoChecksum(String),
}

/// Result type for descriptor operations.
pub type Result<T> = std::result::Result<T, DescriptorError>;

/// Stable identity of a package across versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageId {
    /// Vendor name.
    pub vendor: String,
    /// Package title.
    pub title: String,
}

impl PackageId {
    /// Creates an id from vendor and title.
    pub fn new(vendor: impl Into<String>, title: impl Into<String>) -> Self {
        Self { vendor: vendor.into(), title: title.into() }
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vendor, self.title)
    }
}

impl FromStr for PackageId {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((vendor, title))
                if !vendor.is_empty() && !title.is_empty() && !title.contains('/') =>
            {
                Ok(Self::new(vendor, title))
            }
            _ => Err(DescriptorError::InvalidId(s.to_string())),
        }
    }
}

/// Where a descriptor's bundle lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    /// Bundle file on local disk.
    Local(PathBuf),
    /// Bundle downloadable from a URL.
    Remote(Url),
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(url) => write!(f, "{}", url),
        }
    }
}

/// Chunked bundle bytes.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Chunk size used when streaming local bundles.
pub const STREAM_CHUNK_SIZE: usize = 8192;

/// Lazily fetched metadata of a remote package.
#[async_trait]
pub trait RemoteMetadata: Send + Sync + fmt::Debug {
    /// Fetches the declared checksum of the bundle.
    async fn fetch_checksum(&self) -> Result<Option<String>>;

    /// Fetches the minimum host version of the bundle.
    async fn fetch_compatible_with(&self) -> Result<Option<Version>>;

    /// Opens a byte stream of the bundle at `location`.
    async fn open_bundle(&self, location: &Url) -> Result<ByteStream>;
}

/// Parts of a remote descriptor as reported by a catalog.
#[derive(Debug)]
pub struct RemoteParts {
    /// Package identity.
    pub id: PackageId,
    /// Package version.
    pub version: Version,
    /// Bundle download URL.
    pub location: Url,
    /// Lazily fetched metadata.
    pub metadata: Arc<dyn RemoteMetadata>,
}

/// Identity and metadata of one package version.
pub struct PackageDescriptor {
    id: PackageId,
    version: Version,
    development_build: bool,
    author: Option<String>,
    history: Vec<VersionEntry>,
    extensions: Vec<ExtensionEntry>,
    location: SourceLocation,
    remote: Option<Arc<dyn RemoteMetadata>>,
    checksum: OnceCell<String>,
    compatible_with: OnceCell<Option<Version>>,
    cache: Weak<DescriptorCache>,
    closed: AtomicBool,
}

impl PackageDescriptor {
    /// Parses a descriptor from a local bundle file without caching it.
    ///
    /// # Errors
    /// Returns error if the bundle cannot be read or its metadata is invalid
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_bundle(path, Weak::new())
    }

    fn from_bundle(path: &Path, cache: Weak<DescriptorCache>) -> Result<Self> {
        let contents = bundle::read_bundle(path)?;
        let vendor = contents.manifest.vendor().unwrap_or_default().to_string();

        Ok(Self {
            id: PackageId::new(vendor, contents.manifest.title.trim()),
            version: contents.version,
            development_build: contents.manifest.is_development_build(),
            author: contents.manifest.author.clone(),
            history: contents.history,
            extensions: contents.manifest.extensions,
            location: SourceLocation::Local(path.to_path_buf()),
            remote: None,
            checksum: OnceCell::new(),
            compatible_with: OnceCell::new_with(Some(contents.compatible_with)),
            cache,
            closed: AtomicBool::new(false),
        })
    }

    /// Creates a descriptor for a package advertised by a remote catalog.
    pub fn remote(parts: RemoteParts) -> Self {
        Self {
            id: parts.id,
            version: parts.version,
            development_build: false,
            author: None,
            history: Vec::new(),
            extensions: Vec::new(),
            location: SourceLocation::Remote(parts.location),
            remote: Some(parts.metadata),
            checksum: OnceCell::new(),
            compatible_with: OnceCell::new(),
            cache: Weak::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Package identity.
    pub fn id(&self) -> &PackageId {
        &self.id
    }

    /// Vendor name.
    pub fn vendor(&self) -> &str {
        &self.id.vendor
    }

    /// Package title.
    pub fn title(&self) -> &str {
        &self.id.title
    }

    /// Package version.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Whether this is a development build.
    pub fn is_development_build(&self) -> bool {
        self.development_build
    }

    /// Package author.
    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    /// Version history.
    pub fn history(&self) -> &[VersionEntry] {
        &self.history
    }

    /// Extension types declared by the bundle.
    pub fn extensions(&self) -> &[ExtensionEntry] {
        &self.extensions
    }

    /// Where the bundle lives.
    pub fn location(&self) -> &SourceLocation {
        &self.location
    }

    /// Path of the bundle for local descriptors.
    pub fn local_path(&self) -> Option<&Path> {
        match &self.location {
            SourceLocation::Local(path) => Some(path),
            SourceLocation::Remote(_) => None,
        }
    }

    /// Uppercase hex checksum of the bundle, computed or fetched once.
    ///
    /// # Errors
    /// Returns error if the bundle cannot be hashed or the remote checksum is unavailable
    pub async fn checksum(&self) -> Result<String> {
        self.checksum
            .get_or_try_init(|| async {
                match (&self.location, &self.remote) {
                    (SourceLocation::Local(path), _) => {
                        let path = path.clone();
                        let digest = tokio::task::spawn_blocking(move || {
                            checksum::file_checksum(&path)
                        })
                        .await
                        .map_err(|e| DescriptorError::Io(std::io::Error::other(e)))??;
                        Ok(digest)
                    }
                    (SourceLocation::Remote(_), Some(remote)) => remote
                        .fetch_checksum()
                        .await?
                        .map(|value| checksum::normalize(&value))
                        .ok_or_else(|| DescriptorError::NoChecksum(self.to_string())),
                    (SourceLocation::Remote(_), None) => {
                        Err(DescriptorError::NoChecksum(self.to_string()))
                    }
                }
            })
            .await
            .cloned()
    }

    /// Minimum host version, `None` when the package declares no constraint.
    ///
    /// # Errors
    /// Returns error if remote metadata cannot be fetched
    pub async fn compatible_with(&self) -> Result<Option<Version>> {
        self.compatible_with
            .get_or_try_init(|| async {
                match &self.remote {
                    Some(remote) => remote.fetch_compatible_with().await,
                    None => Ok(None),
                }
            })
            .await
            .cloned()
    }

    /// Whether the package may run on `host_version`.
    ///
    /// # Errors
    /// Returns error if remote metadata cannot be fetched
    pub async fn is_compatible_with(&self, host_version: &Version) -> Result<bool> {
        Ok(self.compatible_with().await?.is_none_or(|required| host_version.satisfies(&required)))
    }

    /// Opens a stream of the bundle bytes.
    ///
    /// # Errors
    /// Returns error if the bundle cannot be opened
    pub async fn open_stream(&self) -> Result<ByteStream> {
        match (&self.location, &self.remote) {
            (SourceLocation::Local(path), _) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(tokio_util::io::ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE).boxed())
            }
            (SourceLocation::Remote(url), Some(remote)) => remote.open_bundle(url).await,
            (SourceLocation::Remote(url), None) => {
                Err(DescriptorError::Remote(format!("no transport for {}", url)))
            }
        }
    }

    /// Whether both descriptors describe the same package.
    pub fn same_package(&self, other: &Self) -> bool {
        self.id == other.id
    }

    /// Whether `self` is a strictly newer version of the same package.
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.same_package(other) && self.version.is_newer_than(&other.version)
    }

    /// Marks the descriptor closed and evicts it from its cache.
    ///
    /// Returns true on the first call.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let (Some(cache), Some(path)) = (self.cache.upgrade(), self.local_path()) {
            cache.evict(path);
        }
        tracing::debug!(package = %self, "Descriptor closed");
        true
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Display for PackageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.id, self.version)
    }
}

impl fmt::Debug for PackageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageDescriptor")
            .field("id", &self.id)
            .field("version", &self.version.to_string())
            .field("location", &self.location)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Cache of local descriptors keyed by bundle path.
///
/// Repeated discovery of the same file returns the same descriptor until the
/// descriptor is closed.
#[derive(Debug, Default)]
pub struct DescriptorCache {
    entries: Mutex<HashMap<PathBuf, Arc<PackageDescriptor>>>,
}

impl DescriptorCache {
    /// Creates an empty cache.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the cached descriptor for `path`, parsing the bundle on a miss.
    ///
    /// # Errors
    /// Returns error if the bundle cannot be parsed
    pub fn load(self: &Arc<Self>, path: &Path) -> Result<Arc<PackageDescriptor>> {
        if let Some(existing) = self.get(path) {
            return Ok(existing);
        }

        let descriptor = Arc::new(PackageDescriptor::from_bundle(path, Arc::downgrade(self))?);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(entries.entry(path.to_path_buf()).or_insert(descriptor)))
    }

    /// Returns the cached descriptor for `path`.
    pub fn get(&self, path: &Path) -> Option<Arc<PackageDescriptor>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).get(path).cloned()
    }

    /// Removes `path` from the cache.
    pub fn evict(&self, path: &Path) -> bool {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).remove(path).is_some()
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
