use crate::clock::ActivityTimestamp;
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// Durable home of the last-activity timestamp.
///
/// Reads and writes are synchronous; the store outlives any single guardian so a
/// restarted process can tell how long the user has been away.
pub trait ActivityStore: Send + Sync {
    fn load(&self) -> Option<ActivityTimestamp>;

    /// # Errors
    ///
    /// Returns an error if the timestamp could not be persisted.
    fn save(&self, timestamp: ActivityTimestamp) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if the stored timestamp could not be removed.
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredActivity {
    last_activity_ms: ActivityTimestamp,
}

/// JSON file backed store.
#[derive(Debug, Clone)]
pub struct FileActivityStore {
    path: PathBuf,
}

impl FileActivityStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ActivityStore for FileActivityStore {
    fn load(&self) -> Option<ActivityTimestamp> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<StoredActivity>(&content) {
            Ok(stored) => Some(stored.last_activity_ms),
            Err(e) => {
                warn!("Ignoring unreadable activity file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    fn save(&self, timestamp: ActivityTimestamp) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string(&StoredActivity {
            last_activity_ms: timestamp,
        })?;
        // Readers only ever see a complete file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).wrap_err("Failed to write activity file")?;
        std::fs::rename(&tmp, &self.path).wrap_err("Failed to replace activity file")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).wrap_err("Failed to remove activity file"),
        }
    }
}

/// Process-local store, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryActivityStore {
    cell: Mutex<Option<ActivityTimestamp>>,
}

impl MemoryActivityStore {
    #[must_use]
    pub fn with_timestamp(timestamp: ActivityTimestamp) -> Self {
        Self {
            cell: Mutex::new(Some(timestamp)),
        }
    }
}

impl ActivityStore for MemoryActivityStore {
    fn load(&self) -> Option<ActivityTimestamp> {
        *self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self, timestamp: ActivityTimestamp) -> Result<()> {
        *self.cell.lock().unwrap_or_else(PoisonError::into_inner) = Some(timestamp);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.cell.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state").join("activity.json");

        let store = FileActivityStore::new(&path);
        assert_eq!(store.load(), None);
        store.save(ActivityTimestamp(42_000)).unwrap();

        let reopened = FileActivityStore::new(&path);
        assert_eq!(reopened.load(), Some(ActivityTimestamp(42_000)));
    }

    #[test]
    fn test_file_store_clear_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileActivityStore::new(temp_dir.path().join("activity.json"));

        store.save(ActivityTimestamp(1)).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_corrupt_file_reads_as_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("activity.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(FileActivityStore::new(&path).load(), None);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryActivityStore::default();
        store.save(ActivityTimestamp(7)).unwrap();
        assert_eq!(store.load(), Some(ActivityTimestamp(7)));
        store.clear().unwrap();
        assert_eq!(store.load(), None);
    }
}
