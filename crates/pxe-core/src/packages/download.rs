//! Bundle downloads.
//!
//! A download streams the bundle into the install directory in chunks while
//! computing its checksum, then compares the result against the checksum the
//! source declared. The target file is deleted on mismatch, on cancellation,
//! and on any transport error, so a half-written bundle never reaches the
//! local registry.

use crate::packages::bundle;
use crate::packages::checksum::{self, ChecksumAccumulator};
use crate::packages::descriptor::{ByteStream, DescriptorCache, DescriptorError, PackageDescriptor, PackageId};
use crate::packages::loader::RegisterOutcome;
use crate::packages::provider::{PackageProvider, ProviderError};
use crate::packages::state::StateStore;
use crate::packages::version::Version;
use crate::publication::{Advertisement, PublicationError, PublicationService};
use futures::{StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Download errors.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Source metadata unavailable.
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Peer could not serve the bundle.
    #[error("publication error: {0}")]
    Publication(#[from] PublicationError),

    /// Activation failed.
    #[error("activation failed: {0}")]
    Provider(#[from] ProviderError),

    /// Downloaded bytes do not match the declared checksum.
    #[error("checksum mismatch for {package}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Package display name.
        package: String,
        /// Declared checksum.
        expected: String,
        /// Computed checksum.
        actual: String,
    },

    /// Download was cancelled.
    #[error("download of {0} cancelled")]
    Cancelled(String),

    /// Target file exists already.
    #[error("bundle file already exists: {0}")]
    AlreadyExists(PathBuf),

    /// Installed version is the same or newer.
    #[error("{package} is already installed at version {installed}")]
    AlreadyInstalled {
        /// Offered package.
        package: String,
        /// Installed version.
        installed: String,
    },

    /// Host is too old for the package.
    #[error("{package} is not compatible with host version {host}")]
    Incompatible {
        /// Offered package.
        package: String,
        /// Running host version.
        host: String,
    },

    /// The bundle does not contain the package it was offered as.
    #[error("downloaded bundle contains {actual}, expected {expected}")]
    UnexpectedContent {
        /// Offered package.
        expected: String,
        /// Package found in the bundle.
        actual: String,
    },

    /// No linked instance could serve the package.
    #[error("no source available for {0}")]
    NoSource(String),
}

/// Result type for download operations.
pub type Result<T> = std::result::Result<T, DownloadError>;

/// Streams bundles into the install directory.
#[derive(Debug)]
pub struct PackageDownloader {
    install_dir: PathBuf,
    chunk_size: usize,
    cache: Arc<DescriptorCache>,
    state: Arc<StateStore>,
}

impl PackageDownloader {
    /// Creates a downloader writing into `install_dir`.
    pub fn new(
        install_dir: impl Into<PathBuf>,
        chunk_size: usize,
        cache: Arc<DescriptorCache>,
        state: Arc<StateStore>,
    ) -> Self {
        Self { install_dir: install_dir.into(), chunk_size: chunk_size.max(1), cache, state }
    }

    /// Install directory.
    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Downloads and activates a package offered by a registry.
    ///
    /// # Errors
    /// Returns error if the package is incompatible or not newer than the
    /// installed version, the download fails verification, or activation was
    /// rolled back. The downloaded file is gone in every error case.
    pub async fn install(
        &self,
        provider: &PackageProvider,
        offered: &PackageDescriptor,
        cancel: &CancellationToken,
    ) -> Result<RegisterOutcome> {
        self.check_installable(provider, offered.id(), offered.version(), &offered.to_string()).await?;

        let host = provider.loader().host_version();
        if !offered.is_compatible_with(host).await? {
            return Err(DownloadError::Incompatible { package: offered.to_string(), host: host.to_string() });
        }

        let downloaded = self.fetch(offered, cancel).await?;
        self.activate(provider, downloaded).await
    }

    /// Downloads and activates a package advertised by a peer instance.
    ///
    /// # Errors
    /// Same as [`install`](Self::install)
    pub async fn install_from_peer(
        &self,
        provider: &PackageProvider,
        service: &dyn PublicationService,
        advertisement: &Advertisement,
        cancel: &CancellationToken,
    ) -> Result<RegisterOutcome> {
        self.check_installable(provider, &advertisement.id(), &advertisement.version, &advertisement.to_string())
            .await?;

        let downloaded = self.fetch_from_peer(service, advertisement, cancel).await?;
        self.activate(provider, downloaded).await
    }

    async fn check_installable(
        &self,
        provider: &PackageProvider,
        id: &PackageId,
        version: &Version,
        display: &str,
    ) -> Result<()> {
        if let Some(installed) = provider.loader().get(id).await {
            if !version.is_newer_than(installed.version()) {
                return Err(DownloadError::AlreadyInstalled {
                    package: display.to_string(),
                    installed: installed.version().to_string(),
                });
            }
        }
        Ok(())
    }

    async fn activate(
        &self,
        provider: &PackageProvider,
        downloaded: Arc<PackageDescriptor>,
    ) -> Result<RegisterOutcome> {
        match provider.install(Arc::clone(&downloaded)).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::warn!(package = %downloaded, error = %e, "Downloaded package rejected");
                downloaded.close();
                if let Some(path) = downloaded.local_path() {
                    self.discard(path);
                }
                Err(e.into())
            }
        }
    }

    /// Downloads the bundle of a registry descriptor into the install directory.
    ///
    /// # Errors
    /// Returns error if the checksum is unavailable, the stream fails, the
    /// download is cancelled, or the bytes do not verify
    pub async fn fetch(
        &self,
        offered: &PackageDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Arc<PackageDescriptor>> {
        let expected = offered.checksum().await?;
        let stream = offered.open_stream().await?;
        self.store(offered, offered.id(), offered.version(), &expected, stream, cancel).await
    }

    /// Downloads a bundle from a peer instance into the install directory.
    ///
    /// # Errors
    /// Same as [`fetch`](Self::fetch)
    pub async fn fetch_from_peer(
        &self,
        service: &dyn PublicationService,
        advertisement: &Advertisement,
        cancel: &CancellationToken,
    ) -> Result<Arc<PackageDescriptor>> {
        let id = advertisement.id();
        let expected = service.package_file_checksum(&id, &advertisement.version).await?;
        let stream: ByteStream = service
            .package_file_stream(&id, &advertisement.version)
            .await?
            .map_err(std::io::Error::other)
            .boxed();
        self.store(advertisement, &id, &advertisement.version, &expected, stream, cancel).await
    }

    async fn store(
        &self,
        offered: &(dyn std::fmt::Display + Sync),
        id: &PackageId,
        version: &Version,
        expected: &str,
        stream: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<Arc<PackageDescriptor>> {
        tokio::fs::create_dir_all(&self.install_dir).await?;
        let target = self.install_dir.join(bundle::bundle_file_name(&id.vendor, &id.title, version));
        if tokio::fs::try_exists(&target).await? {
            return Err(DownloadError::AlreadyExists(target));
        }

        tracing::info!(package = %offered, target = %target.display(), "Downloading bundle");
        if let Err(e) = self.write_verified(&target, &offered.to_string(), expected, stream, cancel).await {
            tracing::warn!(package = %offered, error = %e, "Download failed");
            self.discard(&target);
            return Err(e);
        }

        let descriptor = match self.cache.load(&target) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.discard(&target);
                return Err(e.into());
            }
        };
        if descriptor.id() != id || descriptor.version() != version {
            descriptor.close();
            self.discard(&target);
            return Err(DownloadError::UnexpectedContent {
                expected: offered.to_string(),
                actual: descriptor.to_string(),
            });
        }

        tracing::info!(package = %descriptor, "Bundle downloaded and verified");
        Ok(descriptor)
    }

    async fn write_verified(
        &self,
        target: &Path,
        package: &str,
        expected: &str,
        mut stream: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut file = tokio::fs::File::create(target).await?;
        let mut accumulator = ChecksumAccumulator::new();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DownloadError::Cancelled(package.to_string())),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    for chunk in bytes.chunks(self.chunk_size) {
                        accumulator.update(chunk);
                        file.write_all(chunk).await?;
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let received = accumulator.bytes();
        let actual = accumulator.finish();
        let expected = checksum::normalize(expected);
        if actual != expected {
            return Err(DownloadError::ChecksumMismatch { package: package.to_string(), expected, actual });
        }
        tracing::debug!(package = %package, bytes = received, "Checksum verified");
        Ok(())
    }

    fn discard(&self, path: &Path) {
        if let Err(e) = self.state.delete_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to discard bundle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::bundle::BundleBuilder;
    use crate::packages::descriptor::{RemoteMetadata, RemoteParts};
    use async_trait::async_trait;
    use bytes::Bytes;
    use reqwest::Url;
    use tempfile::TempDir;

    #[derive(Debug)]
    struct InMemoryBundle {
        bytes: Vec<u8>,
        checksum: String,
    }

    #[async_trait]
    impl RemoteMetadata for InMemoryBundle {
        async fn fetch_checksum(&self) -> crate::packages::descriptor::Result<Option<String>> {
            Ok(Some(self.checksum.clone()))
        }

        async fn fetch_compatible_with(&self) -> crate::packages::descriptor::Result<Option<Version>> {
            Ok(None)
        }

        async fn open_bundle(&self, _location: &Url) -> crate::packages::descriptor::Result<ByteStream> {
            let chunks: Vec<std::io::Result<Bytes>> =
                self.bytes.chunks(100).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
            Ok(futures::stream::iter(chunks).boxed())
        }
    }

    fn offered(staging: &Path, declared: Option<&str>) -> PackageDescriptor {
        offered_by("acme", staging, declared)
    }

    fn offered_by(vendor: &str, staging: &Path, declared: Option<&str>) -> PackageDescriptor {
        let path = BundleBuilder::new(vendor, "widgets", "1.2").write_into(staging).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let checksum = declared.map(str::to_string).unwrap_or_else(|| checksum::file_checksum(&path).unwrap());
        PackageDescriptor::remote(RemoteParts {
            id: PackageId::new(vendor, "widgets"),
            version: Version::parse("1.2").unwrap(),
            location: Url::parse(&format!("http://repo.example/{}/widgets-1.2.bundle", vendor)).unwrap(),
            metadata: Arc::new(InMemoryBundle { bytes, checksum }),
        })
    }

    fn downloader(install_dir: &Path) -> PackageDownloader {
        PackageDownloader::new(install_dir, 64, DescriptorCache::new(), Arc::new(StateStore::in_memory()))
    }

    #[tokio::test]
    async fn test_fetch_verifies_checksum() {
        let staging = TempDir::new().unwrap();
        let install = TempDir::new().unwrap();
        let offered = offered(staging.path(), None);

        let descriptor = downloader(install.path()).fetch(&offered, &CancellationToken::new()).await.unwrap();
        assert_eq!(descriptor.to_string(), "acme/widgets-1.2");
        assert_eq!(descriptor.local_path().unwrap(), install.path().join("acme-widgets-1.2.bundle"));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_no_file() {
        let staging = TempDir::new().unwrap();
        let install = TempDir::new().unwrap();
        let offered = offered(staging.path(), Some("00000000000000000000000000000000"));

        let result = downloader(install.path()).fetch(&offered, &CancellationToken::new()).await;
        assert!(matches!(result, Err(DownloadError::ChecksumMismatch { .. })));
        assert!(!install.path().join("acme-widgets-1.2.bundle").exists());
    }

    #[tokio::test]
    async fn test_cancelled_download_leaves_no_file() {
        let staging = TempDir::new().unwrap();
        let install = TempDir::new().unwrap();
        let offered = offered(staging.path(), None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = downloader(install.path()).fetch(&offered, &cancel).await;
        assert!(matches!(result, Err(DownloadError::Cancelled(_))));
        assert!(!install.path().join("acme-widgets-1.2.bundle").exists());
    }

    #[tokio::test]
    async fn test_existing_target_is_not_overwritten() {
        let staging = TempDir::new().unwrap();
        let install = TempDir::new().unwrap();
        std::fs::write(install.path().join("acme-widgets-1.2.bundle"), b"keep").unwrap();
        let offered = offered(staging.path(), None);

        let result = downloader(install.path()).fetch(&offered, &CancellationToken::new()).await;
        assert!(matches!(result, Err(DownloadError::AlreadyExists(_))));
        assert_eq!(std::fs::read(install.path().join("acme-widgets-1.2.bundle")).unwrap(), b"keep");
    }

    #[tokio::test]
    async fn test_same_title_from_two_vendors() {
        let staging = TempDir::new().unwrap();
        let install = TempDir::new().unwrap();
        let downloader = downloader(install.path());

        let acme = downloader.fetch(&offered_by("acme", staging.path(), None), &CancellationToken::new()).await.unwrap();
        let globex =
            downloader.fetch(&offered_by("globex", staging.path(), None), &CancellationToken::new()).await.unwrap();

        assert_eq!(acme.local_path().unwrap(), install.path().join("acme-widgets-1.2.bundle"));
        assert_eq!(globex.local_path().unwrap(), install.path().join("globex-widgets-1.2.bundle"));
        assert_eq!(globex.to_string(), "globex/widgets-1.2");
    }
}
