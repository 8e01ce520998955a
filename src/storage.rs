//! Key/value storage areas addressed by `set-storage` / `get-storage`
//! frames, plus the built-in backends.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Which storage area a frame addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageArea {
    /// Lives as long as the page view.
    Session,
    /// Survives across page views.
    Local,
}

/// String key/value storage with a session and a local area.
///
/// Values are stored as JSON text; the session stringifies payloads before
/// writing and parses them when answering `get-storage`.
pub trait WebStorage: Send + Sync + 'static {
    /// Stored text for `key`, or `None`.
    fn get_item(&self, area: StorageArea, key: &str) -> Option<String>;

    /// Store `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if a persistent backend fails to write.
    fn set_item(&self, area: StorageArea, key: &str, value: String) -> io::Result<()>;
}

/// Both areas held in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<(StorageArea, String), String>>,
}

impl MemoryStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl WebStorage for MemoryStorage {
    fn get_item(&self, area: StorageArea, key: &str) -> Option<String> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(area, key.to_owned()))
            .cloned()
    }

    fn set_item(&self, area: StorageArea, key: &str, value: String) -> io::Result<()> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((area, key.to_owned()), value);
        Ok(())
    }
}

/// Session area in memory, local area persisted to `<dir>/local.json`.
///
/// Every local write rewrites the file atomically (temporary file, then
/// rename).
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    session: Mutex<HashMap<String, String>>,
    local: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    /// Open storage rooted at `dir`, loading any persisted local area.
    ///
    /// A missing file starts empty. A corrupt file is logged and also
    /// starts empty; it is overwritten on the next local write.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the directory cannot be created or the file
    /// cannot be read for reasons other than not existing.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let local = load_local(&dir)?;
        tracing::debug!(dir = %dir.display(), items = local.len(), "opened file storage");
        Ok(Self {
            dir,
            session: Mutex::new(HashMap::new()),
            local: Mutex::new(local),
        })
    }

    /// Directory holding `local.json`.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn load_local(dir: &Path) -> io::Result<BTreeMap<String, String>> {
    let path = dir.join("local.json");
    match std::fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(items) => Ok(items),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "corrupt local storage file, starting empty"
                );
                Ok(BTreeMap::new())
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e),
    }
}

fn save_local(dir: &Path, items: &BTreeMap<String, String>) -> io::Result<()> {
    let path = dir.join("local.json");
    let tmp_path = dir.join("local.json.tmp");
    let json = serde_json::to_string_pretty(items).map_err(io::Error::other)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

impl WebStorage for FileStorage {
    fn get_item(&self, area: StorageArea, key: &str) -> Option<String> {
        match area {
            StorageArea::Session => self
                .session
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .cloned(),
            StorageArea::Local => self
                .local
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .cloned(),
        }
    }

    fn set_item(&self, area: StorageArea, key: &str, value: String) -> io::Result<()> {
        match area {
            StorageArea::Session => {
                self.session
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.to_owned(), value);
                Ok(())
            }
            StorageArea::Local => {
                let mut local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
                local.insert(key.to_owned(), value);
                save_local(&self.dir, &local)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_area_uses_lowercase_names() {
        let area: StorageArea = serde_json::from_str("\"local\"").unwrap();
        assert_eq!(area, StorageArea::Local);
        assert_eq!(
            serde_json::to_string(&StorageArea::Session).unwrap(),
            "\"session\""
        );
    }

    #[test]
    fn memory_storage_keeps_areas_apart() {
        let storage = MemoryStorage::new();
        storage
            .set_item(StorageArea::Session, "k", "1".into())
            .unwrap();
        assert_eq!(storage.get_item(StorageArea::Session, "k").as_deref(), Some("1"));
        assert_eq!(storage.get_item(StorageArea::Local, "k"), None);
    }

    #[test]
    fn local_area_survives_reopen() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        {
            let storage = FileStorage::open(dir.path()).unwrap();
            storage
                .set_item(StorageArea::Local, "theme", "\"dark\"".into())
                .unwrap();
            storage
                .set_item(StorageArea::Session, "draft", "{}".into())
                .unwrap();
        }
        let reopened = FileStorage::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get_item(StorageArea::Local, "theme").as_deref(),
            Some("\"dark\"")
        );
        assert_eq!(reopened.get_item(StorageArea::Session, "draft"), None);
        assert!(!dir.path().join("local.json.tmp").exists());
    }

    #[test]
    fn corrupt_local_file_starts_empty() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        std::fs::write(dir.path().join("local.json"), "not json").unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        assert_eq!(storage.get_item(StorageArea::Local, "anything"), None);

        storage
            .set_item(StorageArea::Local, "k", "2".into())
            .unwrap();
        let content = std::fs::read_to_string(dir.path().join("local.json")).unwrap();
        assert!(content.contains("\"k\""));
    }

    #[test]
    fn open_creates_missing_directory() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let nested = dir.path().join("a").join("b");
        let storage = FileStorage::open(&nested).unwrap();
        assert_eq!(storage.dir(), nested.as_path());
        assert!(nested.is_dir());
    }
}
