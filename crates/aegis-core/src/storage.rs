//! Key-value storage backing the session bridge.
//!
//! Token material is persisted as flat string keys (provider-namespaced, see
//! `session`). `FileStore` keeps the map in `<base>/tokens.json` with
//! restricted permissions (0600). Token values are never logged in full.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};

/// String key-value store used for token persistence.
///
/// Two instances back a `SessionBridge`: a persistent store (the browser
/// original's `localStorage`) and a short-lived scratch store
/// (`sessionStorage`). Errors are propagated here; the bridge decides where
/// failures degrade to "not authenticated" instead.
pub trait KeyValueStore: Send + Sync {
    /// Returns the value for `key`, or `None` if absent.
    ///
    /// # Errors
    /// Returns an error if the backing storage is unavailable.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Sets `key` to `value`.
    ///
    /// # Errors
    /// Returns an error if the backing storage is unavailable.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removes `key` if present.
    ///
    /// # Errors
    /// Returns an error if the backing storage is unavailable.
    fn remove(&self, key: &str) -> Result<()>;

    /// Returns all stored keys.
    ///
    /// # Errors
    /// Returns an error if the backing storage is unavailable.
    fn keys(&self) -> Result<Vec<String>>;
}

/// In-process store. Used for tests and as the scratch (session-lifetime)
/// store of a bridge.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries().keys().cloned().collect())
    }
}

/// File-backed store: a flat JSON object rewritten on every mutation.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Creates a store persisting at `path`. The file is created lazily on
    /// first write.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Loads the map from disk. Returns an empty map if the file doesn't
    /// exist.
    fn load(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read token store from {}", self.path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse token store from {}", self.path.display()))
    }

    /// Saves the map to disk with restricted permissions (0600).
    fn save(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents =
            serde_json::to_string_pretty(entries).context("Failed to serialize token store")?;

        // Write with restricted permissions
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.path)
                .with_context(|| format!("Failed to open {} for writing", self.path.display()))?;
            file.write_all(contents.as_bytes())
                .with_context(|| format!("Failed to write to {}", self.path.display()))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&self.path, contents)
                .with_context(|| format!("Failed to write to {}", self.path.display()))?;
        }

        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.load()?;
        if entries.remove(key).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.load()?.keys().cloned().collect())
    }
}
