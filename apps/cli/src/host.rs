//! The CLI's stand-in host.
//!
//! The CLI administers an installation without running its extensions, so
//! every extension type resolves to an inert extension that only tracks
//! whether it is active.

use async_trait::async_trait;
use pxe_core::{Config, Extension, ExtensionCatalog, ExtensionContext, ExtensionError, PackageEngine};
use std::sync::Arc;

/// Extension that accepts every load and unload.
#[derive(Debug)]
struct InertExtension {
    handler: String,
}

#[async_trait]
impl Extension for InertExtension {
    async fn load(&self) -> Result<(), ExtensionError> {
        tracing::debug!(handler = %self.handler, "Extension activated");
        Ok(())
    }

    async fn unload(&self) -> Result<bool, ExtensionError> {
        tracing::debug!(handler = %self.handler, "Extension deactivated");
        Ok(true)
    }
}

fn inert(context: &ExtensionContext) -> Result<Arc<dyn Extension>, ExtensionError> {
    Ok(Arc::new(InertExtension { handler: format!("{}/{}", context.package_id, context.entry.type_name) }))
}

/// Catalog resolving every extension type to an inert extension.
pub fn catalog() -> ExtensionCatalog {
    let catalog = ExtensionCatalog::new();
    catalog.set_fallback(Arc::new(inert));
    catalog
}

/// Starts the engine for one CLI invocation.
pub async fn start_engine(config: Config) -> anyhow::Result<PackageEngine> {
    Ok(PackageEngine::start(config, catalog()).await?)
}
