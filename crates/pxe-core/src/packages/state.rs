//! Persisted engine state.
//!
//! Handler enabled flags, the set of published packages and bundle files
//! whose deletion has to be retried survive restarts in a small JSON file.

use crate::packages::descriptor::PackageId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Default state file name inside the install directory.
pub const STATE_FILE: &str = ".pxe-state.json";

/// State store errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for state operations.
pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    enabled: BTreeMap<String, bool>,
    #[serde(default)]
    published: BTreeSet<String>,
    #[serde(default)]
    pending_deletions: BTreeSet<PathBuf>,
}

/// JSON backed state store.
#[derive(Debug)]
pub struct StateStore {
    path: Option<PathBuf>,
    state: Mutex<PersistedState>,
}

impl StateStore {
    /// Opens the store at `path`, starting empty if the file does not exist.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(path)?)?
        } else {
            PersistedState::default()
        };
        Ok(Self { path: Some(path.to_path_buf()), state: Mutex::new(state) })
    }

    /// Creates a store that is never written to disk.
    pub fn in_memory() -> Self {
        Self { path: None, state: Mutex::new(PersistedState::default()) }
    }

    /// Whether the handler with `handler_id` is enabled. Unknown handlers are disabled.
    pub fn is_enabled(&self, handler_id: &str) -> bool {
        self.lock().enabled.get(handler_id).copied().unwrap_or(false)
    }

    /// Persists the enabled flag of a handler.
    pub fn set_enabled(&self, handler_id: &str, enabled: bool) -> Result<()> {
        self.update(|state| {
            state.enabled.insert(handler_id.to_string(), enabled) != Some(enabled)
        })
        .map(|_| ())
    }

    /// Whether a package is published.
    pub fn is_published(&self, id: &PackageId) -> bool {
        self.lock().published.contains(&id.to_string())
    }

    /// Ids of all published packages.
    pub fn published_ids(&self) -> Vec<PackageId> {
        self.lock().published.iter().filter_map(|raw| raw.parse().ok()).collect()
    }

    /// Marks a package published or unpublished. Returns true if the flag changed.
    pub fn set_published(&self, id: &PackageId, published: bool) -> Result<bool> {
        self.update(|state| {
            if published {
                state.published.insert(id.to_string())
            } else {
                state.published.remove(&id.to_string())
            }
        })
    }

    /// Files whose deletion has to be retried.
    pub fn pending_deletions(&self) -> Vec<PathBuf> {
        self.lock().pending_deletions.iter().cloned().collect()
    }

    /// Deletes `path`, scheduling a retry if the file cannot be removed now.
    ///
    /// Returns true if the file is gone.
    pub fn delete_file(&self, path: &Path) -> Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Scheduling bundle deletion for next startup");
                self.update(|state| state.pending_deletions.insert(path.to_path_buf()))?;
                Ok(false)
            }
        }
    }

    /// Retries scheduled deletions. Returns the number of files removed.
    pub fn process_pending_deletions(&self) -> Result<usize> {
        let pending = self.pending_deletions();
        if pending.is_empty() {
            return Ok(0);
        }

        let mut removed = Vec::new();
        for path in pending {
            match std::fs::remove_file(&path) {
                Ok(()) => removed.push(path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => removed.push(path),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Pending deletion failed again");
                }
            }
        }

        let count = removed.len();
        self.update(|state| {
            for path in &removed {
                state.pending_deletions.remove(path);
            }
            count > 0
        })?;
        Ok(count)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PersistedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `change` and saves if it reports a modification.
    fn update(&self, change: impl FnOnce(&mut PersistedState) -> bool) -> Result<bool> {
        let mut state = self.lock();
        let changed = change(&mut state);
        if changed {
            self.save(&state)?;
        }
        Ok(changed)
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(&serde_json::to_vec_pretty(state)?)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}
