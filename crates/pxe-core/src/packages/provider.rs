//! Package provider.
//!
//! The provider merges the listings of all registries into one list of
//! [`PackageEntry`] values ordered by package id. The local registry drives
//! the [`PackageLoader`]; remote registries only contribute descriptors that
//! can be downloaded.

use crate::packages::descriptor::{PackageDescriptor, PackageId};
use crate::packages::handler::ExtensionHandler;
use crate::packages::loader::{LoaderError, PackageLoader, RegisterOutcome};
use crate::packages::registry::{LocalRegistry, PackageRegistry, SourceKey};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Provider errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Loader rejected the change.
    #[error(transparent)]
    Loader(#[from] LoaderError),

    /// The descriptors describe different packages.
    #[error("cannot reload {old} with {new}")]
    PackageMismatch {
        /// Active package.
        old: String,
        /// Offered package.
        new: String,
    },

    /// The package was replaced or removed in the meantime.
    #[error("{0} is no longer the active version")]
    Stale(String),
}

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// All known descriptors of one package, keyed by source.
#[derive(Debug, Clone)]
pub struct PackageEntry {
    id: PackageId,
    sources: BTreeMap<SourceKey, Arc<PackageDescriptor>>,
}

impl PackageEntry {
    fn new(id: PackageId) -> Self {
        Self { id, sources: BTreeMap::new() }
    }

    /// Package id.
    pub fn id(&self) -> &PackageId {
        &self.id
    }

    /// Installed descriptor.
    pub fn local(&self) -> Option<&Arc<PackageDescriptor>> {
        self.sources.get(&SourceKey::Local)
    }

    /// Descriptor offered by `source`.
    pub fn descriptor(&self, source: &SourceKey) -> Option<&Arc<PackageDescriptor>> {
        self.sources.get(source)
    }

    /// Descriptors by source.
    pub fn sources(&self) -> impl Iterator<Item = (&SourceKey, &Arc<PackageDescriptor>)> {
        self.sources.iter()
    }

    /// Highest version offered by any remote source.
    pub fn latest_remote(&self) -> Option<(&SourceKey, &Arc<PackageDescriptor>)> {
        self.sources
            .iter()
            .filter(|(source, _)| **source != SourceKey::Local)
            .max_by(|(_, a), (_, b)| a.version().cmp(b.version()))
    }

    /// Whether a remote source offers something newer than what is installed,
    /// or offers a package that is not installed at all.
    pub fn update_available(&self) -> bool {
        match (self.local(), self.latest_remote()) {
            (Some(local), Some((_, remote))) => remote.version().is_newer_than(local.version()),
            (None, Some(_)) => true,
            (_, None) => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Observer of the merged package list.
///
/// Indices refer to the list as it is right after the change.
pub trait ProviderListener: Send + Sync {
    /// An entry was inserted at `index`.
    fn package_registered(&self, _index: usize, _entry: &PackageEntry) {}

    /// The entry at `index` was removed.
    fn package_unregistered(&self, _index: usize, _entry: &PackageEntry) {}

    /// The entry at `index` changed.
    fn package_replaced(&self, _index: usize, _entry: &PackageEntry) {}
}

#[derive(Debug)]
enum EntryEvent {
    Registered(usize, PackageEntry),
    Unregistered(usize, PackageEntry),
    Replaced(usize, PackageEntry),
}

/// Merges registries and keeps the installed set in line with the install
/// directory.
pub struct PackageProvider {
    loader: Arc<PackageLoader>,
    local: Arc<LocalRegistry>,
    remotes: Vec<Arc<dyn PackageRegistry>>,
    entries: Mutex<Vec<PackageEntry>>,
    listeners: RwLock<Vec<Arc<dyn ProviderListener>>>,
}

impl PackageProvider {
    /// Creates a provider over the install directory and remote registries.
    pub fn new(
        loader: Arc<PackageLoader>,
        local: Arc<LocalRegistry>,
        remotes: Vec<Arc<dyn PackageRegistry>>,
    ) -> Self {
        Self {
            loader,
            local,
            remotes,
            entries: Mutex::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Loader holding the installed set.
    pub fn loader(&self) -> &Arc<PackageLoader> {
        &self.loader
    }

    /// Registry over the install directory.
    pub fn local(&self) -> &Arc<LocalRegistry> {
        &self.local
    }

    /// Every registry, local first.
    pub fn registries(&self) -> Vec<Arc<dyn PackageRegistry>> {
        let mut registries: Vec<Arc<dyn PackageRegistry>> = vec![self.local.clone()];
        registries.extend(self.remotes.iter().cloned());
        registries
    }

    /// Adds a listener.
    pub fn add_listener(&self, listener: Arc<dyn ProviderListener>) {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner).push(listener);
    }

    /// Snapshot of the merged list.
    pub async fn packages(&self) -> Vec<PackageEntry> {
        self.entries.lock().await.clone()
    }

    /// Entry for `id`.
    pub async fn entry(&self, id: &PackageId) -> Option<PackageEntry> {
        let entries = self.entries.lock().await;
        entries
            .binary_search_by(|entry| entry.id.cmp(id))
            .ok()
            .map(|index| entries[index].clone())
    }

    /// Entries with a newer or not yet installed remote version.
    pub async fn updates(&self) -> Vec<PackageEntry> {
        self.entries.lock().await.iter().filter(|e| e.update_available()).cloned().collect()
    }

    /// Handlers of an installed package.
    pub async fn handlers(&self, id: &PackageId) -> Vec<Arc<ExtensionHandler>> {
        self.loader.get(id).await.map(|package| package.handlers().to_vec()).unwrap_or_default()
    }

    /// Handlers of every installed package.
    pub async fn all_handlers(&self) -> Vec<Arc<ExtensionHandler>> {
        self.loader
            .packages()
            .await
            .iter()
            .flat_map(|package| package.handlers().iter().cloned())
            .collect()
    }

    /// Queries every registry concurrently and merges the results.
    pub async fn refresh(self: &Arc<Self>) {
        for task in self.refresh_in_background() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Registry refresh task failed");
            }
        }
    }

    /// Starts one refresh task per registry.
    pub fn refresh_in_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.registries()
            .into_iter()
            .map(|registry| {
                let provider = Arc::clone(self);
                tokio::spawn(async move {
                    let packages = registry.packages().await;
                    tracing::debug!(
                        registry = %registry.name(),
                        count = packages.len(),
                        "Registry listing received"
                    );
                    provider.register(registry.source(), packages).await;
                })
            })
            .collect()
    }

    /// Replaces the listing of one source.
    ///
    /// For the local source the installed set is reconciled first, so the
    /// merged list always reflects what is actually active.
    pub async fn register(&self, source: SourceKey, descriptors: Vec<Arc<PackageDescriptor>>) {
        let descriptors = if source == SourceKey::Local {
            let report = self.loader.reconcile(descriptors).await;
            if !report.failed.is_empty() {
                tracing::warn!(failed = report.failed.len(), "Some local packages could not be activated");
            }
            self.installed_descriptors().await
        } else {
            descriptors
        };

        let listing: BTreeMap<PackageId, Arc<PackageDescriptor>> =
            descriptors.into_iter().map(|d| (d.id().clone(), d)).collect();

        let events = {
            let mut entries = self.entries.lock().await;
            let mut events = Vec::new();
            Self::drop_source(&mut entries, &source, |id| !listing.contains_key(id), &mut events);
            for (id, descriptor) in listing {
                Self::put(&mut entries, &source, id, descriptor, &mut events);
            }
            events
        };
        self.emit(events);
    }

    async fn installed_descriptors(&self) -> Vec<Arc<PackageDescriptor>> {
        self.loader.packages().await.iter().map(|p| Arc::clone(p.descriptor())).collect()
    }

    /// Installs or replaces a downloaded local descriptor.
    ///
    /// # Errors
    /// Returns the loader error; nothing changes in that case
    pub async fn install(&self, descriptor: Arc<PackageDescriptor>) -> Result<RegisterOutcome> {
        let outcome = self.loader.register(Arc::clone(&descriptor)).await?;
        self.sync_local(descriptor.id()).await;
        Ok(outcome)
    }

    /// Replaces the active `old` descriptor with `new`.
    ///
    /// # Errors
    /// Returns error if the descriptors describe different packages, `old` is
    /// no longer active, or the loader rolled the replacement back
    pub async fn reload(
        &self,
        old: &PackageDescriptor,
        new: Arc<PackageDescriptor>,
    ) -> Result<RegisterOutcome> {
        if !old.same_package(&new) {
            return Err(ProviderError::PackageMismatch { old: old.to_string(), new: new.to_string() });
        }
        match self.loader.get(old.id()).await {
            Some(active) if active.descriptor().local_path() == old.local_path() => {}
            _ => return Err(ProviderError::Stale(old.to_string())),
        }
        self.install(new).await
    }

    /// Uninstalls a package and deletes its bundle.
    ///
    /// # Errors
    /// Returns error if an enabled extension refused to unload
    pub async fn remove(&self, id: &PackageId) -> Result<()> {
        self.loader.remove(id, true, true).await?;
        self.sync_local(id).await;
        Ok(())
    }

    async fn sync_local(&self, id: &PackageId) {
        let active = self.loader.get(id).await.map(|p| Arc::clone(p.descriptor()));
        let events = {
            let mut entries = self.entries.lock().await;
            let mut events = Vec::new();
            match active {
                Some(descriptor) => {
                    Self::put(&mut entries, &SourceKey::Local, id.clone(), descriptor, &mut events)
                }
                None => Self::drop_source(&mut entries, &SourceKey::Local, |other| other == id, &mut events),
            }
            events
        };
        self.emit(events);
    }

    fn put(
        entries: &mut Vec<PackageEntry>,
        source: &SourceKey,
        id: PackageId,
        descriptor: Arc<PackageDescriptor>,
        events: &mut Vec<EntryEvent>,
    ) {
        match entries.binary_search_by(|entry| entry.id.cmp(&id)) {
            Ok(index) => {
                let entry = &mut entries[index];
                let unchanged = entry.sources.get(source).is_some_and(|current| Arc::ptr_eq(current, &descriptor));
                if !unchanged {
                    entry.sources.insert(source.clone(), descriptor);
                    events.push(EntryEvent::Replaced(index, entry.clone()));
                }
            }
            Err(index) => {
                let mut entry = PackageEntry::new(id);
                entry.sources.insert(source.clone(), descriptor);
                entries.insert(index, entry.clone());
                events.push(EntryEvent::Registered(index, entry));
            }
        }
    }

    fn drop_source(
        entries: &mut Vec<PackageEntry>,
        source: &SourceKey,
        obsolete: impl Fn(&PackageId) -> bool,
        events: &mut Vec<EntryEvent>,
    ) {
        let ids: BTreeSet<PackageId> = entries
            .iter()
            .filter(|entry| entry.sources.contains_key(source) && obsolete(&entry.id))
            .map(|entry| entry.id.clone())
            .collect();

        for id in ids {
            let Ok(index) = entries.binary_search_by(|entry| entry.id.cmp(&id)) else {
                continue;
            };
            entries[index].sources.remove(source);
            if entries[index].is_empty() {
                let entry = entries.remove(index);
                events.push(EntryEvent::Unregistered(index, entry));
            } else {
                events.push(EntryEvent::Replaced(index, entries[index].clone()));
            }
        }
    }

    fn emit(&self, events: Vec<EntryEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner).clone();
        for event in &events {
            for listener in &listeners {
                match event {
                    EntryEvent::Registered(index, entry) => listener.package_registered(*index, entry),
                    EntryEvent::Unregistered(index, entry) => listener.package_unregistered(*index, entry),
                    EntryEvent::Replaced(index, entry) => listener.package_replaced(*index, entry),
                }
            }
        }
    }
}

impl std::fmt::Debug for PackageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageProvider")
            .field("local", &self.local.dir())
            .field("remotes", &self.remotes.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::bundle::BundleBuilder;
    use crate::packages::descriptor::DescriptorCache;
    use crate::packages::handler::ExtensionCatalog;
    use crate::packages::state::StateStore;
    use crate::packages::version::Version;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        events: std::sync::Mutex<Vec<String>>,
    }

    impl ProviderListener for Recorder {
        fn package_registered(&self, index: usize, entry: &PackageEntry) {
            self.events.lock().unwrap().push(format!("+{} {}", index, entry.id()));
        }

        fn package_unregistered(&self, index: usize, entry: &PackageEntry) {
            self.events.lock().unwrap().push(format!("-{} {}", index, entry.id()));
        }

        fn package_replaced(&self, index: usize, entry: &PackageEntry) {
            self.events.lock().unwrap().push(format!("~{} {}", index, entry.id()));
        }
    }

    fn provider(dir: &TempDir) -> Arc<PackageProvider> {
        let cache = DescriptorCache::new();
        let loader = Arc::new(PackageLoader::new(
            Version::parse("1.0").unwrap(),
            Arc::new(ExtensionCatalog::new()),
            Arc::new(StateStore::in_memory()),
        ));
        let local = Arc::new(LocalRegistry::new(dir.path(), cache));
        Arc::new(PackageProvider::new(loader, local, Vec::new()))
    }

    fn remote_listing(dir: &TempDir, title: &str, version: &str) -> Arc<PackageDescriptor> {
        let staging = dir.path().join("staging").join(format!("{}-{}", title, version));
        std::fs::create_dir_all(&staging).unwrap();
        let path = BundleBuilder::new("acme", title, version).write_into(&staging).unwrap();
        Arc::new(PackageDescriptor::open(&path).unwrap())
    }

    #[tokio::test]
    async fn test_refresh_installs_local_packages() {
        let dir = TempDir::new().unwrap();
        BundleBuilder::new("acme", "widgets", "1.0").write_into(dir.path()).unwrap();
        BundleBuilder::new("acme", "gadgets", "2.0").write_into(dir.path()).unwrap();
        let provider = provider(&dir);
        let recorder = Arc::new(Recorder::default());
        provider.add_listener(recorder.clone());

        provider.refresh().await;

        let ids: Vec<String> = provider.packages().await.iter().map(|e| e.id().to_string()).collect();
        assert_eq!(ids, vec!["acme/gadgets", "acme/widgets"]);
        assert_eq!(provider.loader().packages().await.len(), 2);
        assert_eq!(*recorder.events.lock().unwrap(), vec!["+0 acme/gadgets", "+1 acme/widgets"]);
    }

    #[tokio::test]
    async fn test_remote_source_merges_into_entry() {
        let dir = TempDir::new().unwrap();
        BundleBuilder::new("acme", "widgets", "1.0").write_into(dir.path()).unwrap();
        let provider = provider(&dir);
        let recorder = Arc::new(Recorder::default());
        provider.refresh().await;
        provider.add_listener(recorder.clone());

        let central = SourceKey::Remote("central".to_string());
        provider
            .register(
                central.clone(),
                vec![remote_listing(&dir, "widgets", "1.2"), remote_listing(&dir, "clocks", "0.1")],
            )
            .await;

        let entry = provider.entry(&PackageId::new("acme", "widgets")).await.unwrap();
        assert!(entry.update_available());
        assert_eq!(entry.latest_remote().unwrap().1.version().to_string(), "1.2");
        assert_eq!(provider.updates().await.len(), 2);
        assert_eq!(*recorder.events.lock().unwrap(), vec!["+0 acme/clocks", "~1 acme/widgets"]);

        provider.register(central, Vec::new()).await;
        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(&events[2..], &["-0 acme/clocks", "~0 acme/widgets"]);
        assert!(provider.updates().await.is_empty());
    }

    #[tokio::test]
    async fn test_reload_rejects_stale_descriptor() {
        let dir = TempDir::new().unwrap();
        let old_path = BundleBuilder::new("acme", "widgets", "1.0").write_into(dir.path()).unwrap();
        let provider = provider(&dir);
        provider.refresh().await;

        let unrelated = remote_listing(&dir, "gadgets", "1.0");
        let active = provider.entry(&PackageId::new("acme", "widgets")).await.unwrap();
        let active = Arc::clone(active.local().unwrap());
        assert!(matches!(
            provider.reload(&active, unrelated).await,
            Err(ProviderError::PackageMismatch { .. })
        ));

        let new_path = BundleBuilder::new("acme", "widgets", "1.1").write_into(dir.path()).unwrap();
        let new = provider.local().cache().load(&new_path).unwrap();
        provider.reload(&active, new.clone()).await.unwrap();
        assert!(!old_path.exists());

        let same_file = Arc::new(PackageDescriptor::open(&new_path).unwrap());
        let newest_path = BundleBuilder::new("acme", "widgets", "1.2").write_into(dir.path()).unwrap();
        let newest = Arc::new(PackageDescriptor::open(&newest_path).unwrap());
        provider.reload(&same_file, newest).await.unwrap();

        assert!(matches!(
            provider.reload(&active, new).await,
            Err(ProviderError::Stale(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_updates_entries() {
        let dir = TempDir::new().unwrap();
        let path = BundleBuilder::new("acme", "widgets", "1.0").write_into(dir.path()).unwrap();
        let provider = provider(&dir);
        provider.refresh().await;

        provider.remove(&PackageId::new("acme", "widgets")).await.unwrap();
        assert!(provider.packages().await.is_empty());
        assert!(!path.exists());
    }
}
