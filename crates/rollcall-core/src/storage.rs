//! Persistent storage for the monitoring session.
//!
//! The snapshot is a single JSON file. It lets a restarted process resume
//! monitoring, but it is never trusted on its own: resuming always runs a
//! position reconciliation first.

use std::path::{Path, PathBuf};

use crate::engine::SessionSnapshot;
use crate::error::{Result, RollcallError};

/// File-backed store for [`SessionSnapshot`].
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Creates a store writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the last saved snapshot, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Option<SessionSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let snapshot = serde_json::from_str(&content).map_err(|e| {
            RollcallError::PersistenceError(format!(
                "Corrupt session file {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(Some(snapshot))
    }

    /// Saves `snapshot`, replacing the previous file atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| RollcallError::PersistenceError(e.to_string()))?;
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, content)?;
        std::fs::rename(&staging, &self.path)?;
        Ok(())
    }

    /// Deletes the snapshot. Missing files are fine.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be removed.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Platform data directory (`~/.local/share/rollcall` on Linux).
#[must_use]
pub fn default_data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "rollcall").map(|dirs| dirs.data_dir().to_path_buf())
}

/// Default session snapshot path inside [`default_data_dir`].
#[must_use]
pub fn default_session_path() -> Option<PathBuf> {
    default_data_dir().map(|dir| dir.join("session.json"))
}
