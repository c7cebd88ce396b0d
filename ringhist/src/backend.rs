//! Persistence contract for series blobs.
//!
//! The store persists each series as one opaque blob (see [`crate::codec`])
//! through a [`Backend`]. Durability and visibility are up to the
//! implementation: a blob saved by another process may not be visible to
//! `load` yet, and concurrent creators may race with last-writer-wins
//! semantics. The store tolerates both.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryBackend`] keeps blobs in a map, for tests and embedding
//! - [`FileBackend`] keeps one file per series in a directory
//!
//! # File Layout
//!
//! ```text
//! store_dir/
//! ├── solr.jvm.rhs           <- one blob per series
//! ├── solr.core.main.rhs
//! └── ...
//! ```
//!
//! Characters outside `[A-Za-z0-9._-]` in series names are escaped as
//! `%XX` in file names.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{BackendError, Result};

/// File extension of series blobs in a [`FileBackend`] directory.
const BLOB_EXTENSION: &str = "rhs";

/// Durable storage for named series blobs.
///
/// All methods may fail with [`BackendError`]; callers treat those failures
/// as retryable.
pub trait Backend: Send + Sync {
    /// Loads the blob for `name`, or `None` if no such series is visible.
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Stores the blob for `name`, replacing any previous one.
    fn save(&self, name: &str, bytes: &[u8]) -> Result<()>;

    /// Returns up to `limit` series names in ascending order.
    fn list(&self, limit: usize) -> Result<Vec<String>>;

    /// Returns `true` if a blob for `name` exists.
    fn exists(&self, name: &str) -> Result<bool>;

    /// Removes the blob for `name`. Returns `false` if there was none.
    fn delete(&self, name: &str) -> Result<bool>;

    /// Removes every blob.
    fn delete_all(&self) -> Result<()>;
}

/// In-memory backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(name).cloned())
    }

    fn save(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.blobs.write().insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn list(&self, limit: usize) -> Result<Vec<String>> {
        Ok(self.blobs.read().keys().take(limit).cloned().collect())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.blobs.read().contains_key(name))
    }

    fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.blobs.write().remove(name).is_some())
    }

    fn delete_all(&self) -> Result<()> {
        self.blobs.write().clear();
        Ok(())
    }
}

/// Directory backend storing one file per series.
///
/// Saves write a temporary file and rename it over the target, so a crash
/// never leaves a half-written blob behind.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Opens (creating if needed) a backend rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Io`] if the directory cannot be created.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        Ok(Self { dir })
    }

    /// Returns the backend directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{BLOB_EXTENSION}", escape_name(name)))
    }

    /// Fails with [`BackendError::Unavailable`] once the directory is gone,
    /// e.g. an unmounted volume.
    fn check_dir(&self, name: &str) -> Result<()> {
        if self.dir.is_dir() {
            return Ok(());
        }
        Err(BackendError::Unavailable {
            name: name.to_string(),
            reason: format!("store directory '{}' is missing", self.dir.display()),
        }
        .into())
    }

    /// Names of all stored series, sorted.
    fn names(&self) -> Result<Vec<String>> {
        self.check_dir("*")?;
        let entries = fs::read_dir(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(name) = unescape_name(stem) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

impl Backend for FileBackend {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    fn save(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.check_dir(name)?;
        let path = self.blob_path(name);
        let tmp = path.with_extension(format!("{BLOB_EXTENSION}.tmp"));
        fs::write(&tmp, bytes).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_error(&path, e))?;
        debug!(series = %name, bytes = bytes.len(), "saved series blob");
        Ok(())
    }

    fn list(&self, limit: usize) -> Result<Vec<String>> {
        let mut names = self.names()?;
        names.truncate(limit);
        Ok(names)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.blob_path(name).is_file())
    }

    fn delete(&self, name: &str) -> Result<bool> {
        let path = self.blob_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    fn delete_all(&self) -> Result<()> {
        for name in self.names()? {
            self.delete(&name)?;
        }
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> crate::error::HistoryError {
    BackendError::Io {
        path: path.display().to_string(),
        source,
    }
    .into()
}

fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && i > 0);
        if plain {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn unescape_name(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    impl MemoryBackend {
        fn is_empty(&self) -> bool {
            self.blobs.read().is_empty()
        }
    }

    fn exercise(backend: &dyn Backend) {
        assert_eq!(backend.load("solr.jvm").unwrap(), None);
        assert!(!backend.exists("solr.jvm").unwrap());

        backend.save("solr.jvm", b"one").unwrap();
        backend.save("solr.core.main", b"two").unwrap();
        backend.save("solr.node", b"three").unwrap();
        assert_eq!(backend.load("solr.jvm").unwrap(), Some(b"one".to_vec()));
        assert!(backend.exists("solr.node").unwrap());

        backend.save("solr.jvm", b"replaced").unwrap();
        assert_eq!(backend.load("solr.jvm").unwrap(), Some(b"replaced".to_vec()));

        assert_eq!(
            backend.list(100).unwrap(),
            vec!["solr.core.main", "solr.jvm", "solr.node"]
        );
        assert_eq!(backend.list(2).unwrap(), vec!["solr.core.main", "solr.jvm"]);

        assert!(backend.delete("solr.jvm").unwrap());
        assert!(!backend.delete("solr.jvm").unwrap());
        assert_eq!(backend.load("solr.jvm").unwrap(), None);

        backend.delete_all().unwrap();
        assert!(backend.list(100).unwrap().is_empty());
    }

    #[test]
    fn test_memory_backend() {
        let backend = MemoryBackend::new();
        exercise(&backend);
        assert!(backend.is_empty());
    }

    #[test]
    fn test_file_backend() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::open(temp_dir.path().join("store")).unwrap();
        exercise(&backend);
    }

    #[test]
    fn test_file_backend_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        FileBackend::open(temp_dir.path())
            .unwrap()
            .save("solr.jvm", b"blob")
            .unwrap();

        let reopened = FileBackend::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.load("solr.jvm").unwrap(), Some(b"blob".to_vec()));
    }

    #[test]
    fn test_file_backend_ignores_foreign_files() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::open(temp_dir.path()).unwrap();
        fs::write(temp_dir.path().join("notes.txt"), b"x").unwrap();
        fs::write(temp_dir.path().join("half.rhs.tmp"), b"x").unwrap();
        backend.save("solr.jvm", b"blob").unwrap();
        assert_eq!(backend.list(100).unwrap(), vec!["solr.jvm"]);
    }

    #[test]
    fn test_file_backend_missing_dir_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("store");
        let backend = FileBackend::open(&dir).unwrap();
        fs::remove_dir_all(&dir).unwrap();

        let err = backend.save("solr.jvm", b"blob").unwrap_err();
        assert!(matches!(
            err,
            crate::error::HistoryError::Backend(BackendError::Unavailable { .. })
        ));
        assert!(backend.list(100).is_err());
        assert_eq!(backend.load("solr.jvm").unwrap(), None);
    }

    #[test]
    fn test_name_escaping() {
        for name in ["solr.jvm", "a/b", ".hidden", "100%", "space name", "ünï"] {
            let escaped = escape_name(name);
            assert!(!escaped.contains('/'));
            assert!(!escaped.starts_with('.'));
            assert_eq!(unescape_name(&escaped).as_deref(), Some(name));
        }
        assert_eq!(escape_name("solr.core.main"), "solr.core.main");
        assert_eq!(unescape_name("%G1"), None);
    }
}
