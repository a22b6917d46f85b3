//! Tracks packages published by linked instances and installs updates from
//! them.
//!
//! Only advertisements that are new to this host, or newer than the installed
//! version, are kept. Consumers follow changes through [`UpdateEvent`]s on a
//! broadcast channel.

use super::{Advertisement, InstanceId, LocalPublicationService, PublicationError, PublicationListener, PublicationService, Result};
use crate::config::OnUpdate;
use crate::packages::download::{DownloadError, PackageDownloader};
use crate::packages::loader::{InstalledPackage, LoaderListener, RegisterOutcome};
use crate::packages::provider::PackageProvider;
use crate::packages::version::Version;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 64;

/// A package version a linked instance offers.
#[derive(Debug, Clone)]
pub struct UpdateCandidate {
    /// The advertisement, with every instance offering it.
    pub advertisement: Advertisement,
    /// Installed version, `None` if the package is not installed.
    pub installed: Option<Version>,
}

impl UpdateCandidate {
    /// Whether the candidate upgrades an installed package.
    pub fn is_update(&self) -> bool {
        self.installed.is_some()
    }
}

/// Change notifications for update consumers.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// The set of known advertisements changed.
    AdvertisementsChanged,
    /// A new or newer package version became available.
    UpdateAvailable(UpdateCandidate),
    /// A package version was installed from a peer.
    Installed {
        /// Package display name.
        package: String,
    },
    /// Installing from every offering instance failed.
    InstallFailed {
        /// Package display name.
        package: String,
        /// Last failure.
        reason: String,
    },
}

/// Follows advertisements of linked instances.
pub struct UpdateMonitor {
    this: Weak<Self>,
    policy: OnUpdate,
    locale: String,
    provider: Arc<PackageProvider>,
    downloader: Arc<PackageDownloader>,
    publication: Arc<LocalPublicationService>,
    advertisements: Mutex<Vec<Advertisement>>,
    instances: Mutex<BTreeMap<InstanceId, Arc<dyn PublicationService>>>,
    events: broadcast::Sender<UpdateEvent>,
}

impl UpdateMonitor {
    /// Creates a monitor. Call [`attach`](Self::attach) to start receiving
    /// loader and peer notifications.
    pub fn new(
        policy: OnUpdate,
        locale: &str,
        provider: Arc<PackageProvider>,
        downloader: Arc<PackageDownloader>,
        publication: Arc<LocalPublicationService>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            policy,
            locale: locale.to_string(),
            provider,
            downloader,
            publication,
            advertisements: Mutex::new(Vec::new()),
            instances: Mutex::new(BTreeMap::new()),
            events,
        })
    }

    /// Registers the monitor with the loader and the publication service.
    pub async fn attach(self: &Arc<Self>) {
        self.provider.loader().add_listener(self.clone());
        self.publication.add_listener(self.clone()).await;
    }

    /// Subscribes to update events.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: UpdateEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn advertisements(&self) -> MutexGuard<'_, Vec<Advertisement>> {
        self.advertisements.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn instances(&self) -> MutexGuard<'_, BTreeMap<InstanceId, Arc<dyn PublicationService>>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Links an instance and pulls its published packages.
    ///
    /// # Errors
    /// Returns `UnknownExtensionType` if one of the advertised packages needs
    /// an extension type this host does not know. The other advertisements
    /// are still taken over. Transport failures are logged only.
    pub async fn instance_linked(&self, instance: InstanceId, service: Arc<dyn PublicationService>) -> Result<()> {
        self.instances().insert(instance.clone(), Arc::clone(&service));
        self.publication.link_peer(instance.clone(), Arc::clone(&service)).await;

        match service.published_packages(&self.locale).await {
            Ok(advertisements) => self.receive(&instance, advertisements, true).await,
            Err(e) => {
                tracing::warn!(peer = %instance, error = %e, "Cannot list packages published by peer");
                Ok(())
            }
        }
    }

    /// Unlinks an instance and forgets what only it offered.
    pub async fn instance_unlinked(&self, instance: &InstanceId) {
        self.instances().remove(instance);
        self.publication.unlink_peer(instance).await;

        let changed = {
            let mut advertisements = self.advertisements();
            let before = advertisements.len();
            for advertisement in advertisements.iter_mut() {
                advertisement.instances.remove(instance);
            }
            advertisements.retain(|a| !a.instances.is_empty());
            before != advertisements.len()
        };
        if changed {
            self.emit(UpdateEvent::AdvertisementsChanged);
        }
    }

    /// Known advertisements.
    pub fn advertisements_snapshot(&self) -> Vec<Advertisement> {
        self.advertisements().clone()
    }

    /// Highest offered version per package that is new or newer than the
    /// installed version, ordered by package id.
    pub async fn available_updates(&self) -> Vec<UpdateCandidate> {
        let mut best: BTreeMap<(String, String), Advertisement> = BTreeMap::new();
        for advertisement in self.advertisements_snapshot() {
            let key = (advertisement.vendor.clone(), advertisement.title.clone());
            match best.get(&key) {
                Some(current) if current.version >= advertisement.version => {}
                _ => {
                    best.insert(key, advertisement);
                }
            }
        }

        let loader = self.provider.loader();
        let mut candidates = Vec::new();
        for advertisement in best.into_values() {
            let installed = loader.get(&advertisement.id()).await.map(|p| p.version().clone());
            if installed.as_ref().is_none_or(|v| advertisement.version.is_newer_than(v)) {
                candidates.push(UpdateCandidate { advertisement, installed });
            }
        }
        candidates
    }

    async fn receive(&self, instance: &InstanceId, advertisements: Vec<Advertisement>, published: bool) -> Result<()> {
        let catalog = Arc::clone(self.provider.loader().catalog());
        let mut result = Ok(());

        for mut advertisement in advertisements {
            if !published {
                self.withdraw(&advertisement, instance);
                continue;
            }

            let unknown = advertisement.extension_types().find(|t| !catalog.supports(t)).map(str::to_string);
            if let Some(type_name) = unknown {
                tracing::warn!(
                    peer = %instance,
                    package = %advertisement,
                    extension_type = %type_name,
                    "Ignoring package with unknown extension type"
                );
                if result.is_ok() {
                    result = Err(PublicationError::UnknownExtensionType {
                        package: advertisement.to_string(),
                        type_name,
                    });
                }
                continue;
            }

            advertisement.instances = BTreeSet::from([instance.clone()]);
            if let Some(candidate) = self.offer(advertisement).await {
                self.apply_policy(candidate);
            }
        }
        result
    }

    async fn offer(&self, advertisement: Advertisement) -> Option<UpdateCandidate> {
        let installed = self.provider.loader().get(&advertisement.id()).await.map(|p| p.version().clone());
        if installed.as_ref().is_some_and(|v| !advertisement.version.is_newer_than(v)) {
            tracing::debug!(package = %advertisement, "Ignoring advertisement of installed version");
            return None;
        }

        let added = {
            let mut advertisements = self.advertisements();
            match advertisements.iter_mut().find(|a| **a == advertisement) {
                Some(existing) => {
                    existing.instances.extend(advertisement.instances.iter().cloned());
                    false
                }
                None => {
                    advertisements.push(advertisement.clone());
                    true
                }
            }
        };

        self.emit(UpdateEvent::AdvertisementsChanged);
        if !added {
            return None;
        }

        tracing::info!(package = %advertisement, installed = ?installed.as_ref().map(ToString::to_string), "Package available from peer");
        let candidate = UpdateCandidate { advertisement, installed };
        self.emit(UpdateEvent::UpdateAvailable(candidate.clone()));
        Some(candidate)
    }

    fn withdraw(&self, advertisement: &Advertisement, instance: &InstanceId) {
        let changed = {
            let mut advertisements = self.advertisements();
            let Some(index) = advertisements.iter().position(|a| a == advertisement) else {
                return;
            };
            advertisements[index].instances.remove(instance);
            if advertisements[index].instances.is_empty() {
                advertisements.remove(index);
            }
            true
        };
        if changed {
            tracing::debug!(peer = %instance, package = %advertisement, "Advertisement withdrawn");
            self.emit(UpdateEvent::AdvertisementsChanged);
        }
    }

    fn apply_policy(&self, candidate: UpdateCandidate) {
        if self.policy != OnUpdate::Install || !candidate.is_update() {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = this.install(&candidate.advertisement, &CancellationToken::new()).await {
                tracing::warn!(package = %candidate.advertisement, error = %e, "Automatic update failed");
            }
        });
    }

    /// Downloads and installs an advertised package, trying each offering
    /// instance in turn.
    ///
    /// A package that was not installed before, or was published before, is
    /// published after a successful install.
    ///
    /// An instance that answers with a version mismatch no longer offers the
    /// advertised version and is dropped from the advertisement.
    ///
    /// # Errors
    /// Returns the last download error, or `NoSource` if no offering instance
    /// is linked
    pub async fn install(
        &self,
        advertisement: &Advertisement,
        cancel: &CancellationToken,
    ) -> std::result::Result<RegisterOutcome, DownloadError> {
        let record = self
            .advertisements()
            .iter()
            .find(|a| *a == advertisement)
            .cloned()
            .unwrap_or_else(|| advertisement.clone());
        let id = record.id();
        let was_installed = self.provider.loader().get(&id).await.is_some();
        let was_published = self.publication.is_published(&id);

        let mut last_error = None;
        for instance in &record.instances {
            let service = self.instances().get(instance).cloned();
            let Some(service) = service else {
                continue;
            };

            match self.downloader.install_from_peer(&self.provider, service.as_ref(), &record, cancel).await {
                Ok(outcome) => {
                    if was_published {
                        self.publication.announce(&id, &self.locale).await;
                    } else if !was_installed {
                        if let Err(e) = self.publication.publish(&id, &self.locale).await {
                            tracing::warn!(package = %record, error = %e, "Failed to publish installed package");
                        }
                    }
                    tracing::info!(package = %record, peer = %instance, "Package installed from peer");
                    self.emit(UpdateEvent::Installed { package: record.to_string() });
                    return Ok(outcome);
                }
                Err(e @ (DownloadError::Cancelled(_) | DownloadError::AlreadyInstalled { .. } | DownloadError::Provider(_))) => {
                    self.emit(UpdateEvent::InstallFailed { package: record.to_string(), reason: e.to_string() });
                    return Err(e);
                }
                Err(e @ DownloadError::Publication(PublicationError::VersionMismatch { .. })) => {
                    tracing::warn!(package = %record, peer = %instance, error = %e, "Peer no longer offers this version");
                    self.withdraw(&record, instance);
                    last_error = Some(e);
                }
                Err(e) => {
                    tracing::warn!(package = %record, peer = %instance, error = %e, "Download from peer failed");
                    last_error = Some(e);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| DownloadError::NoSource(record.to_string()));
        self.emit(UpdateEvent::InstallFailed { package: record.to_string(), reason: error.to_string() });
        Err(error)
    }
}

impl LoaderListener for UpdateMonitor {
    fn package_loaded(&self, package: &InstalledPackage) {
        let changed = {
            let mut advertisements = self.advertisements();
            let before = advertisements.len();
            advertisements.retain(|a| !a.is_for(package.id()) || a.version.is_newer_than(package.version()));
            before != advertisements.len()
        };
        if changed {
            self.emit(UpdateEvent::AdvertisementsChanged);
        }
    }
}

#[async_trait]
impl PublicationListener for UpdateMonitor {
    async fn publication_changed(&self, advertisement: Advertisement, published: bool) -> Result<()> {
        let senders: Vec<InstanceId> = advertisement.instances.iter().cloned().collect();
        let mut result = Ok(());
        for instance in senders {
            let outcome = self.receive(&instance, vec![advertisement.clone()], published).await;
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    }
}

impl std::fmt::Debug for UpdateMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateMonitor")
            .field("policy", &self.policy)
            .field("locale", &self.locale)
            .finish_non_exhaustive()
    }
}
