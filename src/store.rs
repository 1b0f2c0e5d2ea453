//! Durable string key-value store backing the persisted tracking state.
//!
//! [`KvStore`] is the seam between the scheduler's bookkeeping and whatever
//! actually holds the bytes. Two implementations ship:
//!
//! - [`FileStore`]: a single JSON object on disk, re-read and rewritten
//!   atomically (temp file in the same directory, then rename) under an
//!   exclusive `flock(2)` on every operation.
//! - [`MemoryStore`]: process-local map, used by tests and by callers that
//!   do not need persistence across restarts.
//!
//! [`KvStore::compare_and_swap`] is atomic against every other operation on
//! the same backing data: one async mutex for [`MemoryStore`], the file lock
//! for [`FileStore`] (across instances and processes).

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use nix::fcntl::{Flock, FlockArg};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// File name of the state file inside the data directory.
pub const STATE_FILE: &str = "tracking-state.json";

/// Sidecar file that carries the `flock(2)` guarding [`STATE_FILE`].
pub const LOCK_FILE: &str = "tracking-state.lock";

static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Minimal async key-value contract.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    async fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError>;

    /// Replace the value under `key` with `new` (or delete it when `new` is
    /// `None`) only if the current value equals `expected`. Returns whether
    /// the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError>;
}

fn swap_entry(
    map: &mut BTreeMap<String, String>,
    key: &str,
    expected: Option<&str>,
    new: Option<&str>,
) -> bool {
    if map.get(key).map(String::as_str) != expected {
        return false;
    }
    match new {
        Some(v) => {
            map.insert(key.to_string(), v.to_string());
        }
        None => {
            map.remove(key);
        }
    }
    true
}

// ── In-memory ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        Ok(swap_entry(
            &mut *self.entries.lock().await,
            key,
            expected,
            new,
        ))
    }
}

// ── File-backed ─────────────────────────────────────────────────────

/// JSON-file store shared by every process pointed at the same data
/// directory.
///
/// Nothing is cached: each operation takes an exclusive `flock(2)` on a
/// sidecar lock file, reads the current map from disk, applies its change
/// and writes the map back (temp file + rename) before unlocking. Two
/// daemons on one `data_dir` therefore see each other's keys and contend on
/// the same send lock.
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    // keeps same-process callers off the blocking pool while one waits on flock
    local: Mutex<()>,
}

impl FileStore {
    /// Open (or create) the state file under `data_dir`.
    ///
    /// An unreadable or corrupt state file is logged and treated as empty:
    /// everything stored here can be rebuilt by a fresh start request.
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(data_dir).await?;
        let store = Self {
            path: data_dir.join(STATE_FILE),
            lock_path: data_dir.join(LOCK_FILE),
            local: Mutex::new(()),
        };
        let keys = store.transact(|entries| (entries.len(), false)).await?;
        debug!("Store: {} key(s) in {}", keys, store.path.display());
        Ok(store)
    }

    /// Path of the backing JSON file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` on the on-disk map under the file lock. `op` returns its
    /// result and whether it changed the map.
    async fn transact<R, F>(&self, op: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> (R, bool) + Send + 'static,
        R: Send + 'static,
    {
        let _local = self.local.lock().await;
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || -> Result<R, StoreError> {
            let _lock = lock_exclusive(&lock_path)?;
            let mut entries = read_entries(&path)?;
            let (result, changed) = op(&mut entries);
            if changed {
                write_entries(&path, &entries)?;
            }
            Ok(result)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

fn lock_exclusive(path: &Path) -> Result<Flock<File>, StoreError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| StoreError::Io(std::io::Error::from(errno)))
}

fn read_entries(path: &Path) -> Result<BTreeMap<String, String>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice(&bytes) {
        Ok(map) => Ok(map),
        Err(e) => {
            warn!("Store: {} is corrupt ({e}), treating as empty", path.display());
            Ok(BTreeMap::new())
        }
    }
}

fn write_entries(path: &Path, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(entries)?;
    let parent = path.parent().unwrap_or(Path::new("/"));
    let seq = WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_path = parent.join(format!(".rider_tracker_tmp_{}_{seq}", std::process::id()));

    std::fs::write(&temp_path, &bytes)?;
    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.transact(move |entries| (entries.get(&key).cloned(), false))
            .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.transact(move |entries| {
            let changed = entries.get(&key) != Some(&value);
            entries.insert(key, value);
            ((), changed)
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.transact(move |entries| ((), entries.remove(&key).is_some()))
            .await
    }

    async fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
        self.transact(move |entries| {
            let before = entries.len();
            for key in &keys {
                entries.remove(key);
            }
            ((), entries.len() != before)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        let key = key.to_string();
        let expected = expected.map(str::to_string);
        let new = new.map(str::to_string);
        self.transact(move |entries| {
            let swapped = swap_entry(entries, &key, expected.as_deref(), new.as_deref());
            (swapped, swapped)
        })
        .await
    }
}
