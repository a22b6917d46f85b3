//! Wiring of the package engine from a [`Config`].

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{PxeError, Result};
use crate::packages::descriptor::{DescriptorCache, PackageId};
use crate::packages::download::{DownloadError, PackageDownloader};
use crate::packages::handler::{ExtensionCatalog, ExtensionHandler};
use crate::packages::loader::{PackageLoader, RegisterOutcome};
use crate::packages::provider::{PackageEntry, PackageProvider};
use crate::packages::registry::{LocalRegistry, PackageRegistry, RemoteRegistry};
use crate::packages::state::{STATE_FILE, StateStore};
use crate::publication::{InstanceId, LocalPublicationService, UpdateMonitor};

/// A running package engine: local and remote registries, the loader, the
/// downloader and the publication side.
pub struct PackageEngine {
    config: Config,
    provider: Arc<PackageProvider>,
    downloader: Arc<PackageDownloader>,
    publication: Arc<LocalPublicationService>,
    monitor: Arc<UpdateMonitor>,
}

impl PackageEngine {
    /// Builds the engine and activates the installed packages.
    ///
    /// Bundles whose deletion failed on a previous run are removed first.
    /// Remote registries are only queried by [`refresh`](Self::refresh).
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the install directory
    /// cannot be created, the state file is unreadable, or a remote registry
    /// cannot be set up.
    pub async fn start(config: Config, catalog: ExtensionCatalog) -> Result<Self> {
        config.validate()?;
        let host_version = config.host_version()?;

        std::fs::create_dir_all(&config.install_dir)?;
        let state = Arc::new(StateStore::open(&config.install_dir.join(STATE_FILE))?);

        let cache = DescriptorCache::new();
        let loader = Arc::new(PackageLoader::new(host_version.clone(), Arc::new(catalog), Arc::clone(&state)));
        let swept = loader.process_pending_deletions()?;
        if swept > 0 {
            debug!(count = swept, "Pending bundle deletions processed");
        }

        let local = Arc::new(LocalRegistry::new(config.install_dir.clone(), Arc::clone(&cache)));
        let mut registries: Vec<Arc<dyn PackageRegistry>> = Vec::with_capacity(config.registries.len());
        for registry in &config.registries {
            registries.push(Arc::new(RemoteRegistry::new(registry, host_version.clone())?));
        }

        let provider = Arc::new(PackageProvider::new(Arc::clone(&loader), Arc::clone(&local), registries));
        provider.register(local.source(), local.packages().await).await;

        let downloader = Arc::new(PackageDownloader::new(
            config.install_dir.clone(),
            config.download.chunk_size,
            cache,
            state,
        ));
        let publication =
            Arc::new(LocalPublicationService::new(InstanceId::new(config.instance_id.clone()), Arc::clone(&loader)));
        let monitor = UpdateMonitor::new(
            config.updates.on_update,
            &config.publication.locale,
            Arc::clone(&provider),
            Arc::clone(&downloader),
            Arc::clone(&publication),
        );
        monitor.attach().await;

        info!(
            install_dir = %config.install_dir.display(),
            instance = %config.instance_id,
            packages = loader.packages().await.len(),
            "Package engine started"
        );

        Ok(Self { config, provider, downloader, publication, monitor })
    }

    /// Configuration the engine was started with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Merged package listing.
    pub fn provider(&self) -> &Arc<PackageProvider> {
        &self.provider
    }

    /// Installed packages.
    pub fn loader(&self) -> &Arc<PackageLoader> {
        self.provider.loader()
    }

    /// Bundle downloader.
    pub fn downloader(&self) -> &Arc<PackageDownloader> {
        &self.downloader
    }

    /// Publication service this instance serves to its peers.
    pub fn publication(&self) -> &Arc<LocalPublicationService> {
        &self.publication
    }

    /// Peer update tracking.
    pub fn monitor(&self) -> &Arc<UpdateMonitor> {
        &self.monitor
    }

    /// Re-reads the install directory and queries every remote registry.
    pub async fn refresh(&self) -> Vec<PackageEntry> {
        self.provider.refresh().await;
        self.provider.packages().await
    }

    /// Looks up an active handler by id (`vendor/title/type`).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no installed package provides it.
    pub async fn handler(&self, handler_id: &str) -> Result<Arc<ExtensionHandler>> {
        self.loader()
            .handler(handler_id)
            .await
            .ok_or_else(|| PxeError::NotFound(format!("handler {}", handler_id)))
    }

    /// Enables and loads a handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler is unknown or fails to load.
    pub async fn enable(&self, handler_id: &str) -> Result<Arc<ExtensionHandler>> {
        let handler = self.handler(handler_id).await?;
        handler.enable().await?;
        Ok(handler)
    }

    /// Disables and unloads a handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler is unknown or refuses to unload.
    pub async fn disable(&self, handler_id: &str) -> Result<Arc<ExtensionHandler>> {
        let handler = self.handler(handler_id).await?;
        handler.disable().await?;
        Ok(handler)
    }

    /// Uninstalls a package and withdraws it from peers if it was published.
    ///
    /// # Errors
    ///
    /// Returns an error if an enabled extension refuses to unload.
    pub async fn remove(&self, id: &PackageId) -> Result<()> {
        if self.publication.is_published(id) {
            self.publication.unpublish(id, &self.config.publication.locale).await?;
        }
        self.provider.remove(id).await?;
        Ok(())
    }

    /// Installs the newest remote version of a package.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no registry offers the package, otherwise the
    /// download error.
    pub async fn install_update(&self, id: &PackageId, cancel: &CancellationToken) -> Result<RegisterOutcome> {
        let entry = self.provider.entry(id).await.ok_or_else(|| PxeError::NotFound(format!("package {}", id)))?;
        let (source, offered) = entry
            .latest_remote()
            .map(|(source, descriptor)| (source.clone(), Arc::clone(descriptor)))
            .ok_or_else(|| PxeError::NotFound(format!("no registry offers {}", id)))?;

        info!(package = %offered, %source, "Installing package from registry");
        let was_published = self.publication.is_published(id);
        let outcome = self.downloader.install(&self.provider, &offered, cancel).await?;
        if was_published {
            self.publication.announce(id, &self.config.publication.locale).await;
        }
        Ok(outcome)
    }

    /// Copies a bundle file into the install directory and activates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is not a readable bundle, a bundle with
    /// the same name is already installed, or activation fails. The copy is
    /// removed again on failure.
    pub async fn install_file(&self, path: &Path) -> Result<RegisterOutcome> {
        let file_name = path
            .file_name()
            .ok_or_else(|| PxeError::NotFound(format!("bundle {}", path.display())))?;
        let target = self.downloader.install_dir().join(file_name);
        if target.exists() {
            return Err(DownloadError::AlreadyExists(target).into());
        }

        std::fs::copy(path, &target)?;
        let descriptor = match self.provider.local().cache().load(&target) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                discard_copy(&target);
                return Err(e.into());
            }
        };

        match self.provider.install(Arc::clone(&descriptor)).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                descriptor.close();
                self.provider.local().cache().evict(&target);
                discard_copy(&target);
                Err(e.into())
            }
        }
    }

    /// Publishes an installed package to linked peers.
    ///
    /// # Errors
    ///
    /// Returns an error if the package is not installed or the flag cannot be
    /// stored.
    pub async fn publish(&self, id: &PackageId) -> Result<()> {
        self.publication.publish(id, &self.config.publication.locale).await?;
        Ok(())
    }

    /// Withdraws a published package.
    ///
    /// # Errors
    ///
    /// Returns an error if the package is not installed or the flag cannot be
    /// stored.
    pub async fn unpublish(&self, id: &PackageId) -> Result<()> {
        self.publication.unpublish(id, &self.config.publication.locale).await?;
        Ok(())
    }

    /// Links the peers named in the configuration over gRPC.
    ///
    /// Peers that are down are linked anyway and reached on first use; their
    /// advertisements arrive once they publish.
    ///
    /// # Errors
    ///
    /// Returns an error if a peer endpoint is invalid.
    #[cfg(feature = "grpc")]
    pub async fn link_peers(&self) -> Result<()> {
        use crate::publication::grpc::GrpcPublicationClient;

        for peer in &self.config.publication.peers {
            let client = Arc::new(GrpcPublicationClient::lazy(&peer.endpoint)?);
            if let Err(e) = self.monitor.instance_linked(InstanceId::new(peer.instance_id.clone()), client).await {
                warn!(peer = %peer.instance_id, error = %e, "Peer offers packages this host cannot run");
            }
        }
        Ok(())
    }
}

fn discard_copy(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove rejected bundle copy");
    }
}

impl std::fmt::Debug for PackageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageEngine")
            .field("install_dir", &self.config.install_dir)
            .field("instance_id", &self.config.instance_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::bundle::BundleBuilder;
    use crate::packages::handler::testing::ScriptedExtension;
    use crate::packages::handler::{Extension, ExtensionContext, ExtensionError};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config {
            install_dir: dir.path().join("plugins"),
            host_version: "2.0".to_string(),
            instance_id: "alpha".to_string(),
            ..Config::default()
        }
    }

    fn catalog() -> ExtensionCatalog {
        let catalog = ExtensionCatalog::new();
        catalog.set_fallback(Arc::new(
            |_: &ExtensionContext| -> std::result::Result<Arc<dyn Extension>, ExtensionError> {
                Ok(Arc::new(ScriptedExtension::default()))
            },
        ));
        catalog
    }

    #[tokio::test]
    async fn test_start_activates_installed_bundles() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        std::fs::create_dir_all(&config.install_dir).unwrap();
        BundleBuilder::new("acme", "widgets", "1.0")
            .extension("acme.Widget", "Widget")
            .write_into(&config.install_dir)
            .unwrap();

        let engine = PackageEngine::start(config, catalog()).await.unwrap();
        let packages = engine.provider().packages().await;
        assert_eq!(packages.len(), 1);
        assert!(packages[0].local().is_some());

        let handler = engine.handler("acme/widgets/acme.Widget").await.unwrap();
        assert!(!handler.is_enabled());
        assert!(!handler.is_loaded());
        assert!(matches!(engine.handler("acme/widgets/other").await, Err(PxeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_enabled_flag_survives_restart() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        std::fs::create_dir_all(&config.install_dir).unwrap();
        BundleBuilder::new("acme", "widgets", "1.0")
            .extension("acme.Widget", "Widget")
            .write_into(&config.install_dir)
            .unwrap();

        let engine = PackageEngine::start(config.clone(), catalog()).await.unwrap();
        let handler = engine.enable("acme/widgets/acme.Widget").await.unwrap();
        assert!(handler.is_loaded());
        drop(engine);

        let engine = PackageEngine::start(config.clone(), catalog()).await.unwrap();
        let handler = engine.handler("acme/widgets/acme.Widget").await.unwrap();
        assert!(handler.is_enabled());
        assert!(handler.is_loaded());
        engine.disable("acme/widgets/acme.Widget").await.unwrap();
        drop(engine);

        let engine = PackageEngine::start(config, catalog()).await.unwrap();
        let handler = engine.handler("acme/widgets/acme.Widget").await.unwrap();
        assert!(!handler.is_loaded());
    }

    #[tokio::test]
    async fn test_install_file_and_remove() {
        let dir = TempDir::new().unwrap();
        let engine = PackageEngine::start(config(&dir), catalog()).await.unwrap();
        let staging = dir.path().join("staging");
        let bundle = BundleBuilder::new("acme", "widgets", "1.0").write_into(&staging).unwrap();

        let outcome = engine.install_file(&bundle).await.unwrap();
        assert!(matches!(outcome, RegisterOutcome::Installed));
        let installed = engine.config().install_dir.join("acme-widgets-1.0.bundle");
        assert!(installed.exists());
        assert!(matches!(engine.install_file(&bundle).await, Err(PxeError::Download(DownloadError::AlreadyExists(_)))));

        let id = PackageId::new("acme", "widgets");
        engine.publish(&id).await.unwrap();
        engine.remove(&id).await.unwrap();
        assert!(!installed.exists());
        assert!(!engine.publication().is_published(&id));
        assert!(engine.provider().packages().await.is_empty());
    }

    #[tokio::test]
    async fn test_install_update_without_registry() {
        let dir = TempDir::new().unwrap();
        let engine = PackageEngine::start(config(&dir), catalog()).await.unwrap();
        let result = engine.install_update(&PackageId::new("acme", "widgets"), &CancellationToken::new()).await;
        assert!(matches!(result, Err(PxeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.download.chunk_size = 0;
        assert!(matches!(PackageEngine::start(config, catalog()).await, Err(PxeError::Config(_))));
    }
}
