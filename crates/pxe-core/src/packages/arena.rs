//! Module arenas.
//!
//! One arena exists per installed package version. It keeps the bundle file
//! open for the extensions instantiated from it and is disposed exactly once,
//! before the bundle file may be deleted.

use crate::packages::bundle::{self, BundleError};
use crate::packages::descriptor::PackageDescriptor;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use zip::ZipArchive;
use zip::result::ZipError;

/// Arena errors.
#[derive(Debug, Error)]
pub enum ArenaError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive error.
    #[error("archive error: {0}")]
    Archive(#[from] ZipError),

    /// Bundle error.
    #[error("bundle error: {0}")]
    Bundle(#[from] BundleError),

    /// Descriptor does not point at a local bundle.
    #[error("package {0} has no local bundle")]
    NotLocal(String),

    /// Arena was already closed.
    #[error("arena for {0} is closed")]
    Closed(String),

    /// Resource is not part of the bundle.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
}

/// Result type for arena operations.
pub type Result<T> = std::result::Result<T, ArenaError>;

/// Loading context of one installed package version.
pub struct ModuleArena {
    package: String,
    path: PathBuf,
    archive: Mutex<Option<ZipArchive<File>>>,
}

impl ModuleArena {
    /// Opens the arena for a local descriptor.
    ///
    /// # Errors
    /// Returns error if the descriptor is remote or the bundle cannot be opened
    pub fn open(descriptor: &PackageDescriptor) -> Result<Arc<Self>> {
        let path = descriptor
            .local_path()
            .ok_or_else(|| ArenaError::NotLocal(descriptor.to_string()))?;
        let archive = ZipArchive::new(File::open(path)?)?;

        tracing::debug!(package = %descriptor, path = %path.display(), "Module arena opened");

        Ok(Arc::new(Self {
            package: descriptor.to_string(),
            path: path.to_path_buf(),
            archive: Mutex::new(Some(archive)),
        }))
    }

    /// Bundle path backing the arena.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads a resource from the bundle.
    ///
    /// # Errors
    /// Returns error if the arena is closed or the resource does not exist
    pub fn resource(&self, name: &str) -> Result<Vec<u8>> {
        let mut guard = self.archive.lock().unwrap_or_else(PoisonError::into_inner);
        let archive = guard.as_mut().ok_or_else(|| ArenaError::Closed(self.package.clone()))?;
        bundle::read_entry(archive, name)?.ok_or_else(|| ArenaError::ResourceNotFound(name.to_string()))
    }

    /// Names of all entries in the bundle.
    ///
    /// # Errors
    /// Returns error if the arena is closed
    pub fn resource_names(&self) -> Result<Vec<String>> {
        let guard = self.archive.lock().unwrap_or_else(PoisonError::into_inner);
        let archive = guard.as_ref().ok_or_else(|| ArenaError::Closed(self.package.clone()))?;
        let mut names: Vec<String> = archive.file_names().map(ToString::to_string).collect();
        names.sort();
        Ok(names)
    }

    /// Releases the bundle file. Returns true on the first call only.
    pub fn close(&self) -> bool {
        let released = self.archive.lock().unwrap_or_else(PoisonError::into_inner).take();
        if released.is_some() {
            tracing::debug!(package = %self.package, "Module arena closed");
        }
        released.is_some()
    }

    /// Whether the arena was closed.
    pub fn is_closed(&self) -> bool {
        self.archive.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

impl std::fmt::Debug for ModuleArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleArena")
            .field("package", &self.package)
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}
