//! Extension handlers.
//!
//! The host registers an [`ExtensionFactory`] per extension type name in an
//! [`ExtensionCatalog`]. When a package is installed, every extension type its
//! manifest lists is resolved against the catalog and wrapped in an
//! [`ExtensionHandler`], which owns the persisted enabled flag and drives the
//! extension's load/unload transitions.

use crate::packages::arena::{ArenaError, ModuleArena};
use crate::packages::bundle::ExtensionEntry;
use crate::packages::descriptor::{PackageDescriptor, PackageId};
use crate::packages::state::{StateError, StateStore};
use crate::packages::version::Version;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Errors raised by extensions themselves.
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// Extension reported a failure.
    #[error("{0}")]
    Failed(String),

    /// Extension could not access its bundle.
    #[error("arena error: {0}")]
    Arena(#[from] ArenaError),
}

/// Handler errors.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Extension load or unload failed.
    #[error("extension {handler} failed: {source}")]
    Extension {
        /// Handler id.
        handler: String,
        /// Underlying failure.
        #[source]
        source: ExtensionError,
    },

    /// Extension refused to unload.
    #[error("extension {0} refused to unload")]
    UnloadRefused(String),

    /// State could not be persisted.
    #[error("state error: {0}")]
    State(#[from] StateError),
}

/// Result type for handler operations.
pub type Result<T> = std::result::Result<T, HandlerError>;

/// How a property may be used by a remote viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PropertyAccess {
    /// Shown, not editable.
    #[default]
    ReadOnly,
    /// Shown and editable.
    Editable,
    /// Not shown.
    Hidden,
}

impl PropertyAccess {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::Editable => "editable",
            Self::Hidden => "hidden",
        }
    }

    /// Parses a wire name, defaulting to read-only.
    pub fn from_name(name: &str) -> Self {
        match name {
            "editable" => Self::Editable,
            "hidden" => Self::Hidden,
            _ => Self::ReadOnly,
        }
    }
}

/// Presentation of one extension property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySummary {
    /// Localized property name.
    pub name: String,
    /// Current value rendered as text.
    pub value: String,
    /// Optional icon resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Access mode.
    #[serde(default)]
    pub access: PropertyAccess,
}

/// Behavior contributed by a package.
///
/// What an extension does is up to the host; the engine only activates and
/// deactivates it.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Activates the extension.
    async fn load(&self) -> std::result::Result<(), ExtensionError>;

    /// Deactivates the extension. Returning `Ok(false)` refuses the unload.
    async fn unload(&self) -> std::result::Result<bool, ExtensionError> {
        Ok(true)
    }

    /// Property summaries shown to remote viewers.
    fn properties(&self, _locale: &str) -> Vec<PropertySummary> {
        Vec::new()
    }
}

/// What a factory gets to build an extension.
#[derive(Debug, Clone)]
pub struct ExtensionContext {
    /// Owning package.
    pub package_id: PackageId,
    /// Owning package version.
    pub version: Version,
    /// Manifest entry of the extension.
    pub entry: ExtensionEntry,
    /// Arena of the owning package version.
    pub arena: Arc<ModuleArena>,
}

/// Builds extensions of one type.
pub trait ExtensionFactory: Send + Sync {
    /// Creates the extension for a package version.
    fn create(&self, context: &ExtensionContext) -> std::result::Result<Arc<dyn Extension>, ExtensionError>;
}

impl<F> ExtensionFactory for F
where
    F: Fn(&ExtensionContext) -> std::result::Result<Arc<dyn Extension>, ExtensionError> + Send + Sync,
{
    fn create(&self, context: &ExtensionContext) -> std::result::Result<Arc<dyn Extension>, ExtensionError> {
        self(context)
    }
}

/// Extension types known to the host.
#[derive(Default)]
pub struct ExtensionCatalog {
    factories: RwLock<HashMap<String, Arc<dyn ExtensionFactory>>>,
    fallback: RwLock<Option<Arc<dyn ExtensionFactory>>>,
}

impl ExtensionCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the factory for `type_name`, replacing any previous one.
    pub fn register(&self, type_name: &str, factory: Arc<dyn ExtensionFactory>) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(type_name.to_string(), factory);
    }

    /// Sets a factory used for every type without a dedicated one.
    pub fn set_fallback(&self, factory: Arc<dyn ExtensionFactory>) {
        *self.fallback.write().unwrap_or_else(PoisonError::into_inner) = Some(factory);
    }

    /// Finds the factory for `type_name`.
    pub fn resolve(&self, type_name: &str) -> Option<Arc<dyn ExtensionFactory>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(type_name)
            .cloned()
            .or_else(|| self.fallback.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Whether extensions of `type_name` can be instantiated.
    pub fn supports(&self, type_name: &str) -> bool {
        self.resolve(type_name).is_some()
    }
}

impl std::fmt::Debug for ExtensionCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let types: Vec<String> =
            self.factories.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        f.debug_struct("ExtensionCatalog").field("types", &types).finish_non_exhaustive()
    }
}

/// Observer of handler transitions.
pub trait HandlerListener: Send + Sync {
    /// Called after the extension was activated.
    fn handler_loaded(&self, _handler: &ExtensionHandler) {}

    /// Called after the extension was deactivated.
    fn handler_unloaded(&self, _handler: &ExtensionHandler) {}
}

/// Builds the handler id of an extension type in a package.
pub fn handler_id(package_id: &PackageId, type_name: &str) -> String {
    format!("{}/{}", package_id, type_name)
}

/// One extension of an installed package.
pub struct ExtensionHandler {
    id: String,
    package_id: PackageId,
    version: Version,
    entry: ExtensionEntry,
    extension: Arc<dyn Extension>,
    state: Arc<StateStore>,
    loaded: AtomicBool,
    listeners: RwLock<Vec<Arc<dyn HandlerListener>>>,
}

impl ExtensionHandler {
    /// Wraps an instantiated extension.
    pub fn new(
        package_id: PackageId,
        version: Version,
        entry: ExtensionEntry,
        extension: Arc<dyn Extension>,
        state: Arc<StateStore>,
    ) -> Self {
        Self {
            id: handler_id(&package_id, &entry.type_name),
            package_id,
            version,
            entry,
            extension,
            state,
            loaded: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Instantiates handlers for every resolvable extension type of a package.
    ///
    /// Types unknown to the catalog, and extensions whose factory fails, are
    /// skipped with a warning.
    pub fn instantiate_all(
        descriptor: &PackageDescriptor,
        arena: &Arc<ModuleArena>,
        catalog: &ExtensionCatalog,
        state: &Arc<StateStore>,
    ) -> Vec<Arc<Self>> {
        let mut handlers = Vec::with_capacity(descriptor.extensions().len());

        for entry in descriptor.extensions() {
            let Some(factory) = catalog.resolve(&entry.type_name) else {
                tracing::warn!(
                    package = %descriptor,
                    extension_type = %entry.type_name,
                    "Skipping extension of unknown type"
                );
                continue;
            };

            let context = ExtensionContext {
                package_id: descriptor.id().clone(),
                version: descriptor.version().clone(),
                entry: entry.clone(),
                arena: Arc::clone(arena),
            };

            match factory.create(&context) {
                Ok(extension) => handlers.push(Arc::new(Self::new(
                    context.package_id,
                    context.version,
                    context.entry,
                    extension,
                    Arc::clone(state),
                ))),
                Err(e) => tracing::warn!(
                    package = %descriptor,
                    extension_type = %entry.type_name,
                    error = %e,
                    "Skipping extension that failed to instantiate"
                ),
            }
        }

        handlers
    }

    /// Handler id: `vendor/title/type`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Owning package.
    pub fn package_id(&self) -> &PackageId {
        &self.package_id
    }

    /// Version of the package the extension came from.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Extension type name.
    pub fn type_name(&self) -> &str {
        &self.entry.type_name
    }

    /// Localized display title.
    pub fn title(&self, locale: &str) -> String {
        self.entry.title(locale)
    }

    /// Localized description.
    pub fn description(&self, locale: &str) -> Option<String> {
        self.entry.description(locale)
    }

    /// Icon resource name.
    pub fn icon(&self) -> Option<&str> {
        self.entry.icon.as_deref()
    }

    /// Property summaries for remote viewers.
    pub fn properties(&self, locale: &str) -> Vec<PropertySummary> {
        self.extension.properties(locale)
    }

    /// Persisted enabled flag.
    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled(&self.id)
    }

    /// Whether the extension is currently active.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Adds a transition listener.
    pub fn add_listener(&self, listener: Arc<dyn HandlerListener>) {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner).push(listener);
    }

    fn listeners(&self) -> Vec<Arc<dyn HandlerListener>> {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Activates the extension. Loading an active extension is a no-op.
    pub async fn load(&self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }

        self.extension.load().await.map_err(|source| HandlerError::Extension {
            handler: self.id.clone(),
            source,
        })?;
        self.loaded.store(true, Ordering::SeqCst);
        tracing::debug!(handler = %self.id, version = %self.version, "Extension loaded");

        for listener in self.listeners() {
            listener.handler_loaded(self);
        }
        Ok(())
    }

    /// Deactivates the extension.
    ///
    /// # Returns
    /// `false` if the extension refused, in which case it stays active
    pub async fn unload(&self) -> Result<bool> {
        if !self.is_loaded() {
            return Ok(true);
        }

        let unloaded = self.extension.unload().await.map_err(|source| HandlerError::Extension {
            handler: self.id.clone(),
            source,
        })?;
        if !unloaded {
            tracing::debug!(handler = %self.id, "Extension refused to unload");
            return Ok(false);
        }

        self.loaded.store(false, Ordering::SeqCst);
        tracing::debug!(handler = %self.id, version = %self.version, "Extension unloaded");

        for listener in self.listeners() {
            listener.handler_unloaded(self);
        }
        Ok(true)
    }

    /// Switches this extension over to the same extension type of another
    /// package version: unload `self`, then load `next`.
    ///
    /// Listeners are carried over to `next`. If `next` fails to load, `self`
    /// is loaded again before the error is returned.
    pub async fn reload(&self, next: &Self) -> Result<()> {
        if !self.unload().await? {
            return Err(HandlerError::UnloadRefused(self.id.clone()));
        }

        {
            let carried = self.listeners();
            let mut target = next.listeners.write().unwrap_or_else(PoisonError::into_inner);
            for listener in carried {
                if !target.iter().any(|existing| Arc::ptr_eq(existing, &listener)) {
                    target.push(listener);
                }
            }
        }

        if let Err(e) = next.load().await {
            if let Err(restore) = self.load().await {
                tracing::warn!(handler = %self.id, error = %restore, "Failed to restore extension after reload failure");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Loads the extension and persists it as enabled.
    pub async fn enable(&self) -> Result<()> {
        self.load().await?;
        self.state.set_enabled(&self.id, true)?;
        Ok(())
    }

    /// Unloads the extension and persists it as disabled.
    pub async fn disable(&self) -> Result<()> {
        if !self.unload().await? {
            return Err(HandlerError::UnloadRefused(self.id.clone()));
        }
        self.state.set_enabled(&self.id, false)?;
        Ok(())
    }

    /// Persists the enabled flag without touching the extension.
    pub(crate) fn set_enabled_flag(&self, enabled: bool) -> Result<()> {
        self.state.set_enabled(&self.id, enabled)?;
        Ok(())
    }
}

impl std::fmt::Debug for ExtensionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHandler")
            .field("id", &self.id)
            .field("version", &self.version.to_string())
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedExtension, handler};
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingListener {
        loaded: AtomicUsize,
        unloaded: AtomicUsize,
    }

    impl HandlerListener for CountingListener {
        fn handler_loaded(&self, _handler: &ExtensionHandler) {
            self.loaded.fetch_add(1, Ordering::SeqCst);
        }

        fn handler_unloaded(&self, _handler: &ExtensionHandler) {
            self.unloaded.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_enable_and_disable_persist_flag() {
        let state = Arc::new(StateStore::in_memory());
        let extension = Arc::new(ScriptedExtension::default());
        let clock = handler("acme.Clock", "1.0", extension.clone(), &state);
        assert_eq!(clock.id(), "acme/widgets/acme.Clock");

        clock.enable().await.unwrap();
        assert!(clock.is_enabled());
        assert!(clock.is_loaded());

        clock.disable().await.unwrap();
        assert!(!clock.is_enabled());
        assert!(!clock.is_loaded());
        assert_eq!(extension.loads.load(Ordering::SeqCst), 1);
        assert_eq!(extension.unloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refused_disable_keeps_enabled() {
        let state = Arc::new(StateStore::in_memory());
        let extension = Arc::new(ScriptedExtension::default());
        let clock = handler("acme.Clock", "1.0", extension.clone(), &state);
        clock.enable().await.unwrap();

        extension.refuse_unload.store(true, Ordering::SeqCst);
        assert!(matches!(clock.disable().await, Err(HandlerError::UnloadRefused(_))));
        assert!(clock.is_enabled());
        assert!(clock.is_loaded());
    }

    #[tokio::test]
    async fn test_listeners_follow_reload() {
        let state = Arc::new(StateStore::in_memory());
        let listener = Arc::new(CountingListener::default());
        let old = handler("acme.Clock", "1.0", Arc::new(ScriptedExtension::default()), &state);
        let new = handler("acme.Clock", "1.1", Arc::new(ScriptedExtension::default()), &state);
        old.add_listener(listener.clone());
        old.enable().await.unwrap();

        old.reload(&new).await.unwrap();
        assert!(!old.is_loaded());
        assert!(new.is_loaded());
        assert!(new.is_enabled());
        assert_eq!(listener.loaded.load(Ordering::SeqCst), 2);
        assert_eq!(listener.unloaded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_reload_restores_old() {
        let state = Arc::new(StateStore::in_memory());
        let old_extension = Arc::new(ScriptedExtension::default());
        let new_extension = Arc::new(ScriptedExtension::default());
        new_extension.fail_load.store(true, Ordering::SeqCst);

        let old = handler("acme.Clock", "1.0", old_extension.clone(), &state);
        let new = handler("acme.Clock", "1.1", new_extension, &state);
        old.enable().await.unwrap();

        assert!(matches!(old.reload(&new).await, Err(HandlerError::Extension { .. })));
        assert!(old.is_loaded());
        assert!(!new.is_loaded());
        assert_eq!(old_extension.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_catalog_fallback() {
        let catalog = ExtensionCatalog::new();
        assert!(!catalog.supports("acme.Clock"));

        let factory = |_: &ExtensionContext| -> std::result::Result<Arc<dyn Extension>, ExtensionError> {
            Ok(Arc::new(ScriptedExtension::default()))
        };
        catalog.register("acme.Clock", Arc::new(factory));
        assert!(catalog.supports("acme.Clock"));
        assert!(!catalog.supports("acme.Calendar"));

        catalog.set_fallback(Arc::new(factory));
        assert!(catalog.supports("acme.Calendar"));
    }

    #[test]
    fn test_property_access_names() {
        for access in [PropertyAccess::ReadOnly, PropertyAccess::Editable, PropertyAccess::Hidden] {
            assert_eq!(PropertyAccess::from_name(access.as_str()), access);
        }
        assert_eq!(PropertyAccess::from_name("bogus"), PropertyAccess::ReadOnly);
    }
}
