//! Registry over the install directory.

use super::{PackageRegistry, SourceKey};
use crate::packages::bundle;
use crate::packages::descriptor::{DescriptorCache, PackageDescriptor};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lists bundle files of a directory.
#[derive(Debug, Clone)]
pub struct LocalRegistry {
    dir: PathBuf,
    cache: Arc<DescriptorCache>,
}

impl LocalRegistry {
    /// Creates a registry over `dir`, caching descriptors in `cache`.
    pub fn new(dir: impl Into<PathBuf>, cache: Arc<DescriptorCache>) -> Self {
        Self { dir: dir.into(), cache }
    }

    /// Scanned directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Descriptor cache shared with the loader.
    pub fn cache(&self) -> &Arc<DescriptorCache> {
        &self.cache
    }

    fn scan(dir: &Path, cache: &Arc<DescriptorCache>) -> Vec<Arc<PackageDescriptor>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(dir = %dir.display(), "Install directory does not exist yet");
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Cannot read install directory");
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && bundle::is_bundle_file(path))
            .collect();
        paths.sort();

        paths
            .into_iter()
            .filter_map(|path| match cache.load(&path) {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable bundle");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl PackageRegistry for LocalRegistry {
    fn name(&self) -> &str {
        "local"
    }

    fn source(&self) -> SourceKey {
        SourceKey::Local
    }

    async fn read_packages(&self) -> Vec<Arc<PackageDescriptor>> {
        let dir = self.dir.clone();
        let cache = Arc::clone(&self.cache);
        match tokio::task::spawn_blocking(move || Self::scan(&dir, &cache)).await {
            Ok(packages) => packages,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Install directory scan failed");
                Vec::new()
            }
        }
    }
}
