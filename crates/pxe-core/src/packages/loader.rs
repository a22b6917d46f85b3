//! The installed package set.
//!
//! [`PackageLoader`] keeps exactly one active version per package id. Every
//! transition goes through one write lock on the set:
//!
//! ```text
//! Absent --register--> Installed --replace--> Installed'
//!                          |
//!                          +--remove--> Absent
//! ```
//!
//! Replacement switches every enabled extension over to the new version. If
//! any switch fails, the switched ones are rolled back and the old version
//! stays active with its bundle untouched. Arenas are always closed before
//! their bundle file is deleted.

use crate::packages::arena::{ArenaError, ModuleArena};
use crate::packages::descriptor::{DescriptorError, PackageDescriptor, PackageId};
use crate::packages::handler::{ExtensionCatalog, ExtensionHandler, HandlerError};
use crate::packages::state::{StateError, StateStore};
use crate::packages::version::Version;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError};
use thiserror::Error;
use tokio::sync::RwLock;

/// Loader errors.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// Arena could not be opened.
    #[error("arena error: {0}")]
    Arena(#[from] ArenaError),

    /// Handler failure.
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    /// State could not be persisted.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Descriptor metadata unavailable.
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Only local bundles can be installed.
    #[error("package {0} is not a local bundle")]
    NotLocal(String),

    /// Host is too old for the package.
    #[error("package {package} requires host version {required}, running {host}")]
    Incompatible {
        /// Package display name.
        package: String,
        /// Required host version.
        required: String,
        /// Running host version.
        host: String,
    },

    /// Package is not installed.
    #[error("package {0} is not installed")]
    NotInstalled(String),

    /// An enabled extension refused to unload.
    #[error("extension {handler} of {package} refused to unload")]
    UnloadRefused {
        /// Package display name.
        package: String,
        /// Handler id.
        handler: String,
    },

    /// Replacement was rolled back.
    #[error("replacing with {package} failed: {reason}")]
    ReloadFailed {
        /// New package display name.
        package: String,
        /// First failure.
        reason: String,
    },
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// An installed package version with its arena and handlers.
#[derive(Debug)]
pub struct InstalledPackage {
    descriptor: Arc<PackageDescriptor>,
    arena: Arc<ModuleArena>,
    handlers: Vec<Arc<ExtensionHandler>>,
}

impl InstalledPackage {
    /// Descriptor of the installed version.
    pub fn descriptor(&self) -> &Arc<PackageDescriptor> {
        &self.descriptor
    }

    /// Package id.
    pub fn id(&self) -> &PackageId {
        self.descriptor.id()
    }

    /// Installed version.
    pub fn version(&self) -> &Version {
        self.descriptor.version()
    }

    /// Arena of the installed version.
    pub fn arena(&self) -> &Arc<ModuleArena> {
        &self.arena
    }

    /// Handlers of all resolvable extensions.
    pub fn handlers(&self) -> &[Arc<ExtensionHandler>] {
        &self.handlers
    }

    /// Handler for an extension type.
    pub fn handler(&self, type_name: &str) -> Option<&Arc<ExtensionHandler>> {
        self.handlers.iter().find(|h| h.type_name() == type_name)
    }

    fn enabled_handlers(&self) -> impl Iterator<Item = &Arc<ExtensionHandler>> {
        self.handlers.iter().filter(|h| h.is_enabled())
    }

    fn dispose(&self) {
        self.arena.close();
        self.descriptor.close();
    }
}

/// Result of [`PackageLoader::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Package was not installed before.
    Installed,
    /// A different version was replaced.
    Replaced {
        /// Version that was active before.
        previous: Version,
    },
    /// The same bundle is already active.
    Unchanged,
}

/// Summary of a discovery reconciliation.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Newly installed packages.
    pub installed: Vec<String>,
    /// Replaced packages.
    pub replaced: Vec<String>,
    /// Removed packages.
    pub removed: Vec<String>,
    /// Packages that could not be registered or removed.
    pub failed: Vec<(String, LoaderError)>,
}

/// Observer of installed set changes.
pub trait LoaderListener: Send + Sync {
    /// A package version became active.
    fn package_loaded(&self, _package: &InstalledPackage) {}

    /// A package left the installed set.
    fn package_removed(&self, _descriptor: &PackageDescriptor) {}
}

enum Notification {
    Loaded(Arc<InstalledPackage>),
    Removed(Arc<PackageDescriptor>),
}

/// Authoritative set of installed packages.
pub struct PackageLoader {
    host_version: Version,
    catalog: Arc<ExtensionCatalog>,
    state: Arc<StateStore>,
    packages: RwLock<BTreeMap<PackageId, Arc<InstalledPackage>>>,
    listeners: std::sync::RwLock<Vec<Arc<dyn LoaderListener>>>,
}

impl PackageLoader {
    /// Creates an empty loader.
    pub fn new(host_version: Version, catalog: Arc<ExtensionCatalog>, state: Arc<StateStore>) -> Self {
        Self {
            host_version,
            catalog,
            state,
            packages: RwLock::new(BTreeMap::new()),
            listeners: std::sync::RwLock::new(Vec::new()),
        }
    }

    /// Host version packages are checked against.
    pub fn host_version(&self) -> &Version {
        &self.host_version
    }

    /// Extension catalog.
    pub fn catalog(&self) -> &Arc<ExtensionCatalog> {
        &self.catalog
    }

    /// Persisted state.
    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    /// Adds a listener.
    pub fn add_listener(&self, listener: Arc<dyn LoaderListener>) {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner).push(listener);
    }

    fn notify(&self, notifications: Vec<Notification>) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner).clone();
        for notification in notifications {
            for listener in &listeners {
                match &notification {
                    Notification::Loaded(package) => listener.package_loaded(package),
                    Notification::Removed(descriptor) => listener.package_removed(descriptor),
                }
            }
        }
    }

    /// Retries bundle deletions that failed in an earlier run.
    pub fn process_pending_deletions(&self) -> Result<usize> {
        let removed = self.state.process_pending_deletions()?;
        if removed > 0 {
            tracing::info!(count = removed, "Removed bundles scheduled for deletion");
        }
        Ok(removed)
    }

    /// All installed packages ordered by id.
    pub async fn packages(&self) -> Vec<Arc<InstalledPackage>> {
        self.packages.read().await.values().cloned().collect()
    }

    /// The installed package with `id`.
    pub async fn get(&self, id: &PackageId) -> Option<Arc<InstalledPackage>> {
        self.packages.read().await.get(id).cloned()
    }

    /// Finds a handler by its id across all installed packages.
    pub async fn handler(&self, handler_id: &str) -> Option<Arc<ExtensionHandler>> {
        self.packages
            .read()
            .await
            .values()
            .flat_map(|package| package.handlers.iter())
            .find(|handler| handler.id() == handler_id)
            .cloned()
    }

    /// Installs a local descriptor, replacing the active version of the same
    /// package if there is one.
    ///
    /// # Errors
    /// Returns error if the descriptor is remote or incompatible, its bundle
    /// cannot be opened, or replacement was rolled back
    pub async fn register(&self, descriptor: Arc<PackageDescriptor>) -> Result<RegisterOutcome> {
        if descriptor.local_path().is_none() {
            return Err(LoaderError::NotLocal(descriptor.to_string()));
        }
        if let Some(required) = descriptor.compatible_with().await? {
            if !self.host_version.satisfies(&required) {
                return Err(LoaderError::Incompatible {
                    package: descriptor.to_string(),
                    required: required.to_string(),
                    host: self.host_version.to_string(),
                });
            }
        }

        let mut packages = self.packages.write().await;
        let (outcome, active) = match packages.get(descriptor.id()).cloned() {
            Some(current) if current.descriptor.local_path() == descriptor.local_path() => {
                return Ok(RegisterOutcome::Unchanged);
            }
            Some(current) => {
                let replacement = self.switch(&current, &descriptor).await?;
                packages.insert(descriptor.id().clone(), Arc::clone(&replacement));
                (RegisterOutcome::Replaced { previous: current.version().clone() }, replacement)
            }
            None => {
                let installed = self.install(&descriptor).await?;
                packages.insert(descriptor.id().clone(), Arc::clone(&installed));
                (RegisterOutcome::Installed, installed)
            }
        };
        drop(packages);

        self.notify(vec![Notification::Loaded(active)]);
        Ok(outcome)
    }

    /// Replaces the active version of a package with `descriptor`.
    ///
    /// # Errors
    /// Returns `NotInstalled` if no version of the package is active, and
    /// `ReloadFailed` if an enabled extension could not be switched over
    pub async fn replace(&self, descriptor: Arc<PackageDescriptor>) -> Result<RegisterOutcome> {
        if self.get(descriptor.id()).await.is_none() {
            return Err(LoaderError::NotInstalled(descriptor.id().to_string()));
        }
        self.register(descriptor).await
    }

    fn open(&self, descriptor: &Arc<PackageDescriptor>) -> Result<InstalledPackage> {
        let arena = ModuleArena::open(descriptor)?;
        let handlers = ExtensionHandler::instantiate_all(descriptor, &arena, &self.catalog, &self.state);
        Ok(InstalledPackage { descriptor: Arc::clone(descriptor), arena, handlers })
    }

    /// Loads enabled handlers that are not active yet. A handler that fails
    /// to load is disabled so the rest of the package stays usable.
    async fn load_enabled(&self, package: &InstalledPackage) {
        for handler in package.enabled_handlers().filter(|h| !h.is_loaded()) {
            if let Err(e) = handler.load().await {
                tracing::warn!(handler = %handler.id(), error = %e, "Extension failed to load, disabling it");
                if let Err(e) = handler.set_enabled_flag(false) {
                    tracing::warn!(handler = %handler.id(), error = %e, "Failed to persist disabled extension");
                }
            }
        }
    }

    async fn install(&self, descriptor: &Arc<PackageDescriptor>) -> Result<Arc<InstalledPackage>> {
        let package = self.open(descriptor)?;
        self.load_enabled(&package).await;
        tracing::info!(package = %descriptor, extensions = package.handlers.len(), "Package installed");
        Ok(Arc::new(package))
    }

    /// Switches `current` over to `descriptor`, or rolls everything back.
    async fn switch(
        &self,
        current: &InstalledPackage,
        descriptor: &Arc<PackageDescriptor>,
    ) -> Result<Arc<InstalledPackage>> {
        let candidate = self.open(descriptor)?;

        let mut switched: Vec<(Arc<ExtensionHandler>, Arc<ExtensionHandler>)> = Vec::new();
        let mut retired: Vec<Arc<ExtensionHandler>> = Vec::new();
        let mut failure: Option<String> = None;

        for old in current.enabled_handlers() {
            match candidate.handler(old.type_name()) {
                Some(next) => match old.reload(next).await {
                    Ok(()) => switched.push((Arc::clone(old), Arc::clone(next))),
                    Err(e) => {
                        failure = Some(e.to_string());
                        break;
                    }
                },
                // The new version dropped this extension type.
                None => match old.unload().await {
                    Ok(true) => retired.push(Arc::clone(old)),
                    Ok(false) => {
                        failure = Some(format!("extension {} refused to unload", old.id()));
                        break;
                    }
                    Err(e) => {
                        failure = Some(e.to_string());
                        break;
                    }
                },
            }
        }

        if let Some(reason) = failure {
            for (old, next) in switched.iter().rev() {
                match next.unload().await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(handler = %next.id(), "New extension refused rollback unload"),
                    Err(e) => tracing::warn!(handler = %next.id(), error = %e, "New extension failed rollback unload"),
                }
                if let Err(e) = old.load().await {
                    tracing::warn!(handler = %old.id(), error = %e, "Failed to restore extension");
                }
            }
            for old in &retired {
                if let Err(e) = old.load().await {
                    tracing::warn!(handler = %old.id(), error = %e, "Failed to restore extension");
                }
            }
            candidate.dispose();

            tracing::warn!(
                package = %descriptor,
                active = %current.descriptor,
                reason = %reason,
                "Replacement rolled back, keeping active version"
            );
            return Err(LoaderError::ReloadFailed { package: descriptor.to_string(), reason });
        }

        self.load_enabled(&candidate).await;

        current.dispose();
        if let Some(old_path) = current.descriptor.local_path() {
            if Some(old_path) != descriptor.local_path() {
                self.state.delete_file(old_path)?;
            }
        }

        tracing::info!(
            package = %descriptor,
            previous = %current.version(),
            switched = switched.len(),
            "Package replaced"
        );
        Ok(Arc::new(candidate))
    }

    /// Removes a package from the installed set.
    ///
    /// # Arguments
    /// * `id` - Package to remove
    /// * `unload` - Unload enabled extensions first; any refusal aborts the removal
    /// * `delete_file` - Delete the bundle file after the arena is closed
    ///
    /// # Errors
    /// Returns error if the package is not installed or an extension refused to unload
    pub async fn remove(&self, id: &PackageId, unload: bool, delete_file: bool) -> Result<()> {
        let mut packages = self.packages.write().await;
        let current = packages
            .get(id)
            .cloned()
            .ok_or_else(|| LoaderError::NotInstalled(id.to_string()))?;

        if unload {
            let mut unloaded: Vec<&Arc<ExtensionHandler>> = Vec::new();
            for handler in current.enabled_handlers() {
                let error = match handler.unload().await {
                    Ok(true) => {
                        unloaded.push(handler);
                        continue;
                    }
                    Ok(false) => LoaderError::UnloadRefused {
                        package: current.descriptor.to_string(),
                        handler: handler.id().to_string(),
                    },
                    Err(e) => e.into(),
                };

                for restored in unloaded {
                    if let Err(e) = restored.load().await {
                        tracing::warn!(handler = %restored.id(), error = %e, "Failed to restore extension");
                    }
                }
                tracing::warn!(package = %current.descriptor, error = %error, "Removal aborted");
                return Err(error);
            }
        }

        packages.remove(id);
        current.dispose();
        drop(packages);

        if delete_file {
            if let Some(path) = current.descriptor.local_path() {
                if let Err(e) = self.state.delete_file(path) {
                    tracing::warn!(path = %path.display(), error = %e, "Bundle deletion could not be scheduled");
                }
            }
        }

        tracing::info!(package = %current.descriptor, delete_file, "Package removed");
        self.notify(vec![Notification::Removed(Arc::clone(&current.descriptor))]);
        Ok(())
    }

    /// Brings the installed set in line with a discovery result: registers
    /// every discovered descriptor and removes installed packages that were
    /// not discovered.
    pub async fn reconcile(&self, discovered: Vec<Arc<PackageDescriptor>>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let ids: BTreeSet<PackageId> = discovered.iter().map(|d| d.id().clone()).collect();

        for descriptor in discovered {
            let name = descriptor.to_string();
            match self.register(descriptor).await {
                Ok(RegisterOutcome::Installed) => report.installed.push(name),
                Ok(RegisterOutcome::Replaced { .. }) => report.replaced.push(name),
                Ok(RegisterOutcome::Unchanged) => {}
                Err(e) => {
                    tracing::warn!(package = %name, error = %e, "Discovered package not registered");
                    report.failed.push((name, e));
                }
            }
        }

        let obsolete: Vec<PackageId> =
            self.packages.read().await.keys().filter(|id| !ids.contains(*id)).cloned().collect();
        for id in obsolete {
            match self.remove(&id, true, true).await {
                Ok(()) => report.removed.push(id.to_string()),
                Err(e) => {
                    tracing::warn!(package = %id, error = %e, "Obsolete package not removed");
                    report.failed.push((id.to_string(), e));
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for PackageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageLoader")
            .field("host_version", &self.host_version.to_string())
            .finish_non_exhaustive()
    }
}
