//! Durable storage for the queue's last-dispatch timestamp.
//!
//! The queue reads the timestamp once at construction and writes it on every
//! dispatch so that pacing survives a process restart. Both paths are
//! best-effort: a [`StoreError`] is logged by the queue and otherwise ignored.
//!
//! Two backends are provided:
//!
//! - [`MemoryStore`]: an in-process map, shared between queue instances that
//!   hold the same `Arc`.
//! - [`FileStore`]: a JSON object on disk used as a small key-value store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use thiserror::Error;

/// Key under which the last-dispatch timestamp is stored.
pub const LAST_DISPATCH_KEY: &str = "sluice.last_dispatch_ms";

/// Errors produced by a [`DispatchStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON in store: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stored value for `{key}` is not a timestamp")]
    Corrupt { key: String },
}

/// A key-value backend able to persist a single timestamp.
///
/// The queue calls [`load`](Self::load) once at construction and
/// [`save`](Self::save) once per dispatch. Saves run on Tokio's blocking pool,
/// so implementations may do synchronous I/O.
pub trait DispatchStore: Send + Sync + 'static {
    /// Loads the timestamp stored under `key`, or `None` if nothing is stored.
    fn load(&self, key: &str) -> Result<Option<SystemTime>, StoreError>;

    /// Stores `at` under `key`, replacing any previous value.
    fn save(&self, key: &str, at: SystemTime) -> Result<(), StoreError>;
}

/// Converts a wall-clock time to whole milliseconds since the Unix epoch.
///
/// Times before the epoch clamp to zero.
pub fn to_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Converts milliseconds since the Unix epoch back to a wall-clock time.
pub fn from_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

/// In-process store. Values live as long as the store itself.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, u64>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DispatchStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<SystemTime>, StoreError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).copied().map(from_millis))
    }

    fn save(&self, key: &str, at: SystemTime) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_owned(), to_millis(at));
        Ok(())
    }
}

/// File-backed store holding a flat JSON object of `key → milliseconds`.
///
/// Writes are read-modify-write, so keys written by other components are
/// preserved. A missing file reads as empty.
///
/// # Examples
///
/// ```no_run
/// use std::time::SystemTime;
/// use sluice::storage::{DispatchStore, FileStore, LAST_DISPATCH_KEY};
///
/// let store = FileStore::new("/var/lib/myapp/state.json");
/// store.save(LAST_DISPATCH_KEY, SystemTime::now())?;
/// assert!(store.load(LAST_DISPATCH_KEY)?.is_some());
/// # Ok::<(), sluice::storage::StoreError>(())
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles from this process.
    guard: Mutex<()>,
}

impl FileStore {
    /// Creates a store backed by the JSON file at `path`. The file is not
    /// touched until the first load or save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<Map<String, Value>, StoreError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Map::new());
        }
        match serde_json::from_slice(&raw)? {
            Value::Object(map) => Ok(map),
            _ => Err(StoreError::Corrupt {
                key: String::new(),
            }),
        }
    }
}

impl DispatchStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<SystemTime>, StoreError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let map = self.read_map()?;
        match map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .map(from_millis)
                .map(Some)
                .ok_or_else(|| StoreError::Corrupt {
                    key: key.to_owned(),
                }),
        }
    }

    fn save(&self, key: &str, at: SystemTime) -> Result<(), StoreError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        // Corrupt content is overwritten rather than blocking every future
        // save. An unreadable file is left alone so other keys survive.
        let mut map = match self.read_map() {
            Ok(map) => map,
            Err(StoreError::Json(_) | StoreError::Corrupt { .. }) => Map::new(),
            Err(e) => return Err(e),
        };
        map.insert(key.to_owned(), Value::from(to_millis(at)));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(&Value::Object(map))?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
