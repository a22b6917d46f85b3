//! The publication service an instance serves to its peers.

use super::{Advertisement, InstanceId, PackageByteStream, PublicationError, PublicationService, Result};
use crate::packages::descriptor::PackageId;
use crate::packages::loader::{InstalledPackage, PackageLoader};
use crate::packages::version::Version;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Receiver of publication changes pushed by peers.
#[async_trait]
pub trait PublicationListener: Send + Sync {
    /// A peer published or withdrew a package version.
    async fn publication_changed(&self, advertisement: Advertisement, published: bool) -> Result<()>;
}

/// Serves this instance's published packages and pushes publication changes
/// to linked peers.
pub struct LocalPublicationService {
    instance: InstanceId,
    loader: Arc<PackageLoader>,
    peers: RwLock<BTreeMap<InstanceId, Arc<dyn PublicationService>>>,
    listeners: RwLock<Vec<Arc<dyn PublicationListener>>>,
}

impl LocalPublicationService {
    /// Creates the service for this instance.
    pub fn new(instance: InstanceId, loader: Arc<PackageLoader>) -> Self {
        Self {
            instance,
            loader,
            peers: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// This instance's id.
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Adds a receiver of peer publication changes.
    pub async fn add_listener(&self, listener: Arc<dyn PublicationListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Links a peer; publication changes are pushed to it from now on.
    pub async fn link_peer(&self, instance: InstanceId, service: Arc<dyn PublicationService>) {
        tracing::info!(peer = %instance, "Peer linked");
        self.peers.write().await.insert(instance, service);
    }

    /// Unlinks a peer.
    pub async fn unlink_peer(&self, instance: &InstanceId) -> bool {
        let removed = self.peers.write().await.remove(instance).is_some();
        if removed {
            tracing::info!(peer = %instance, "Peer unlinked");
        }
        removed
    }

    /// Ids of linked peers.
    pub async fn peers(&self) -> Vec<InstanceId> {
        self.peers.read().await.keys().cloned().collect()
    }

    /// Whether an installed package is published.
    pub fn is_published(&self, id: &PackageId) -> bool {
        self.loader.state().is_published(id)
    }

    /// Publishes an installed package and notifies linked peers.
    ///
    /// # Errors
    /// Returns error if the package is not installed or the flag cannot be persisted
    pub async fn publish(&self, id: &PackageId, locale: &str) -> Result<()> {
        self.set_published(id, locale, true).await
    }

    /// Withdraws a package and notifies linked peers.
    ///
    /// # Errors
    /// Returns error if the package is not installed or the flag cannot be persisted
    pub async fn unpublish(&self, id: &PackageId, locale: &str) -> Result<()> {
        self.set_published(id, locale, false).await
    }

    async fn set_published(&self, id: &PackageId, locale: &str, published: bool) -> Result<()> {
        let package = self.installed(id).await?;
        if !self.loader.state().set_published(id, published)? {
            return Ok(());
        }

        tracing::info!(package = %package.descriptor(), published, "Publication changed");
        let advertisement = Advertisement::from_installed(&package, locale, &self.instance);
        self.broadcast(advertisement, published).await;
        Ok(())
    }

    /// Re-announces a published package after its installed version changed.
    pub async fn announce(&self, id: &PackageId, locale: &str) {
        if !self.is_published(id) {
            return;
        }
        if let Some(package) = self.loader.get(id).await {
            let advertisement = Advertisement::from_installed(&package, locale, &self.instance);
            self.broadcast(advertisement, true).await;
        }
    }

    async fn broadcast(&self, advertisement: Advertisement, published: bool) {
        let peers: Vec<(InstanceId, Arc<dyn PublicationService>)> =
            self.peers.read().await.iter().map(|(id, peer)| (id.clone(), Arc::clone(peer))).collect();

        for (instance, peer) in peers {
            if let Err(e) = peer.package_publication_changed(advertisement.clone(), published).await {
                tracing::warn!(
                    peer = %instance,
                    package = %advertisement,
                    error = %e,
                    "Failed to notify peer of publication change"
                );
            }
        }
    }

    async fn installed(&self, id: &PackageId) -> Result<Arc<InstalledPackage>> {
        self.loader.get(id).await.ok_or_else(|| PublicationError::PackageNotFound(id.to_string()))
    }

    async fn installed_version(&self, id: &PackageId, version: &Version) -> Result<Arc<InstalledPackage>> {
        let package = self.installed(id).await?;
        if package.version() != version {
            return Err(PublicationError::VersionMismatch {
                package: id.to_string(),
                requested: version.to_string(),
                installed: package.version().to_string(),
            });
        }
        Ok(package)
    }
}

#[async_trait]
impl PublicationService for LocalPublicationService {
    async fn published_packages(&self, locale: &str) -> Result<Vec<Advertisement>> {
        let state = self.loader.state();
        Ok(self
            .loader
            .packages()
            .await
            .iter()
            .filter(|package| state.is_published(package.id()))
            .map(|package| Advertisement::from_installed(package, locale, &self.instance))
            .collect())
    }

    async fn package_publication_changed(&self, advertisement: Advertisement, published: bool) -> Result<()> {
        tracing::debug!(package = %advertisement, published, "Publication change received");
        let listeners = self.listeners.read().await.clone();

        let mut first_error = None;
        for listener in listeners {
            if let Err(e) = listener.publication_changed(advertisement.clone(), published).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn package_file_checksum(&self, id: &PackageId, version: &Version) -> Result<String> {
        let package = self.installed_version(id, version).await?;
        Ok(package.descriptor().checksum().await?)
    }

    async fn package_file_stream(&self, id: &PackageId, version: &Version) -> Result<PackageByteStream> {
        let package = self.installed_version(id, version).await?;
        let stream = package.descriptor().open_stream().await?;
        Ok(stream.map_err(PublicationError::Io).boxed())
    }
}

impl std::fmt::Debug for LocalPublicationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPublicationService").field("instance", &self.instance).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::bundle::BundleBuilder;
    use crate::packages::checksum;
    use crate::packages::descriptor::PackageDescriptor;
    use crate::packages::handler::ExtensionCatalog;
    use crate::packages::state::StateStore;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingPeer {
        changes: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl PublicationService for RecordingPeer {
        async fn published_packages(&self, _locale: &str) -> Result<Vec<Advertisement>> {
            Ok(Vec::new())
        }

        async fn package_publication_changed(&self, advertisement: Advertisement, published: bool) -> Result<()> {
            self.changes.lock().unwrap().push((advertisement.to_string(), published));
            Ok(())
        }

        async fn package_file_checksum(&self, id: &PackageId, _version: &Version) -> Result<String> {
            Err(PublicationError::PackageNotFound(id.to_string()))
        }

        async fn package_file_stream(&self, id: &PackageId, _version: &Version) -> Result<PackageByteStream> {
            Err(PublicationError::PackageNotFound(id.to_string()))
        }
    }

    async fn service(dir: &TempDir) -> (LocalPublicationService, std::path::PathBuf) {
        let loader = Arc::new(PackageLoader::new(
            Version::parse("1.0").unwrap(),
            Arc::new(ExtensionCatalog::new()),
            Arc::new(StateStore::in_memory()),
        ));
        let path = BundleBuilder::new("acme", "widgets", "1.2").write_into(dir.path()).unwrap();
        loader.register(Arc::new(PackageDescriptor::open(&path).unwrap())).await.unwrap();
        (LocalPublicationService::new(InstanceId::from("alpha"), loader), path)
    }

    #[tokio::test]
    async fn test_publish_notifies_peers_once() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir).await;
        let peer = Arc::new(RecordingPeer::default());
        service.link_peer(InstanceId::from("beta"), peer.clone()).await;
        let id = PackageId::new("acme", "widgets");

        service.publish(&id, "en").await.unwrap();
        service.publish(&id, "en").await.unwrap();
        let published = service.published_packages("en").await.unwrap();
        assert_eq!(published.len(), 1);
        assert!(published[0].instances.contains(&InstanceId::from("alpha")));

        service.unpublish(&id, "en").await.unwrap();
        assert!(service.published_packages("en").await.unwrap().is_empty());
        assert_eq!(
            *peer.changes.lock().unwrap(),
            vec![("acme/widgets-1.2".to_string(), true), ("acme/widgets-1.2".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_publish_requires_installed_package() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir).await;
        let result = service.publish(&PackageId::new("acme", "gadgets"), "en").await;
        assert!(matches!(result, Err(PublicationError::PackageNotFound(_))));
    }

    #[tokio::test]
    async fn test_file_requests_check_version() {
        let dir = TempDir::new().unwrap();
        let (service, path) = service(&dir).await;
        let id = PackageId::new("acme", "widgets");

        let result = service.package_file_checksum(&id, &Version::parse("1.1").unwrap()).await;
        assert!(matches!(result, Err(PublicationError::VersionMismatch { .. })));

        let version = Version::parse("1.2").unwrap();
        let checksum = service.package_file_checksum(&id, &version).await.unwrap();
        assert_eq!(checksum, checksum::file_checksum(&path).unwrap());

        let chunks: Vec<_> = service.package_file_stream(&id, &version).await.unwrap().try_collect().await.unwrap();
        let bytes: Vec<u8> = chunks.iter().flat_map(|c: &bytes::Bytes| c.iter().copied()).collect();
        assert_eq!(bytes, std::fs::read(&path).unwrap());
    }
}
