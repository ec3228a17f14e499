//! Thread store: durable mapping from WhatsApp user id (wa_id) to assistant thread id.
//!
//! Backed by a JSON object on disk. Every operation reads the file, so several gateway
//! processes can share one store. Writes take an exclusive advisory lock on a sidecar
//! `.lock` file for the whole read-modify-write and replace the data file by rename.

use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

type ThreadMap = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("thread store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("thread store at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("thread store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Persistent wa_id -> thread id mapping.
pub struct ThreadStore {
    path: PathBuf,
    /// Serialises writers within this process; the file lock covers other processes.
    write_lock: Mutex<()>,
}

impl ThreadStore {
    /// Open the store at `path`. A missing file is an empty store; an unreadable one is an error.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = path.clone();
        let count = tokio::task::spawn_blocking(move || read_map(&file).map(|m| m.len())).await??;
        log::info!(
            "thread store opened at {} ({} mapping(s))",
            path.display(),
            count
        );
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Thread id for this user, if one was stored.
    pub async fn lookup(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let map = tokio::task::spawn_blocking(move || read_map(&path)).await??;
        Ok(map.get(&user_id).cloned())
    }

    /// Store a mapping unconditionally (last write wins).
    pub async fn store(&self, user_id: &str, thread_id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let thread_id = thread_id.to_string();
        tokio::task::spawn_blocking(move || {
            with_exclusive(&path, |map| {
                map.insert(user_id, thread_id);
                ((), true)
            })
        })
        .await?
    }

    /// Store `thread_id` for this user unless a mapping already exists.
    /// Returns whichever thread id is mapped once the call completes.
    pub async fn insert_if_absent(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> Result<String, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let thread_id = thread_id.to_string();
        tokio::task::spawn_blocking(move || {
            with_exclusive(&path, |map| match map.get(&user_id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    map.insert(user_id, thread_id.clone());
                    (thread_id, true)
                }
            })
        })
        .await?
    }

    /// Number of stored mappings.
    pub async fn len(&self) -> Result<usize, StoreError> {
        let path = self.path.clone();
        let map = tokio::task::spawn_blocking(move || read_map(&path)).await??;
        Ok(map.len())
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn read_map(path: &Path) -> Result<ThreadMap, StoreError> {
    let s = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ThreadMap::new()),
        Err(e) => return Err(io_err(path)(e)),
    };
    if s.trim().is_empty() {
        return Ok(ThreadMap::new());
    }
    serde_json::from_str(&s).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_map(path: &Path, map: &ThreadMap) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(map).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = tmp_path(path);
    let mut f = File::create(&tmp).map_err(io_err(&tmp))?;
    f.write_all(json.as_bytes()).map_err(io_err(&tmp))?;
    f.sync_all().map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))
}

/// Run `f` on the current map while holding the exclusive file lock.
/// `f` returns its result and whether the map changed and must be written back.
fn with_exclusive<T>(
    path: &Path,
    f: impl FnOnce(&mut ThreadMap) -> (T, bool),
) -> Result<T, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let lock = lock_path(path);
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock)
        .map_err(io_err(&lock))?;
    lock_file.lock_exclusive().map_err(io_err(&lock))?;
    let result = read_map(path).and_then(|mut map| {
        let (out, dirty) = f(&mut map);
        if dirty {
            write_map(path, &map)?;
        }
        Ok(out)
    });
    if let Err(e) = FileExt::unlock(&lock_file) {
        log::debug!("thread store: unlocking {}: {}", lock.display(), e);
    }
    result
}
