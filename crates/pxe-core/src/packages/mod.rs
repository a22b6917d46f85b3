//! Package discovery, installation and lifecycle.

pub mod arena;
pub mod bundle;
pub mod checksum;
pub mod descriptor;
pub mod download;
pub mod handler;
pub mod loader;
pub mod provider;
pub mod registry;
pub mod state;
pub mod version;

pub use arena::{ArenaError, ModuleArena};
pub use bundle::{BundleBuilder, BundleError, BundleManifest, ChangeEntry, ExtensionEntry, VersionEntry};
pub use descriptor::{DescriptorCache, DescriptorError, PackageDescriptor, PackageId, SourceLocation};
pub use download::{DownloadError, PackageDownloader};
pub use handler::{
    Extension, ExtensionCatalog, ExtensionContext, ExtensionError, ExtensionFactory, ExtensionHandler,
    HandlerError, HandlerListener, PropertyAccess, PropertySummary,
};
pub use loader::{InstalledPackage, LoaderError, LoaderListener, PackageLoader, RegisterOutcome};
pub use provider::{PackageEntry, PackageProvider, ProviderError, ProviderListener};
pub use registry::{LocalRegistry, PackageRegistry, RegistryError, RemoteRegistry, SourceKey};
pub use state::{StateError, StateStore};
pub use version::{Version, VersionError};
