//! Synchronous key-value storage backends.
//!
//! The client treats its durable storage like browser local storage: string
//! keys, string values, synchronous access, scoped to one client context.

use crate::error::PersistenceError;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Trait for the durable key-value store the client is embedded in.
pub trait KeyValueBackend: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn get_item(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set_item(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
}

/// A process-local backend, lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    items: RwLock<HashMap<String, String>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueBackend for MemoryBackend {
    fn get_item(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// A backend that keeps one JSON file per key in a directory.
///
/// Writes go to a temp file first and are renamed into place, so a crash
/// never leaves a half-written value behind.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Creates a backend rooted at `root`. The directory is created on the
    /// first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the directory holding the files.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", encode_key(key)))
    }
}

impl KeyValueBackend for FileBackend {
    fn get_item(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::ReadFailed {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let write_failed = |e: std::io::Error| PersistenceError::WriteFailed {
            key: key.to_string(),
            reason: e.to_string(),
        };

        fs::create_dir_all(&self.root).map_err(write_failed)?;

        let final_path = self.path_for(key);
        let mut temp_path = final_path.clone().into_os_string();
        temp_path.push(".tmp");

        fs::write(&temp_path, value.as_bytes()).map_err(write_failed)?;
        fs::rename(&temp_path, &final_path).map_err(write_failed)?;
        Ok(())
    }
}

/// Maps a key onto a file name: ASCII alphanumerics, `-` and `_` are kept,
/// every other byte becomes `%XX`.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}
