//! Crash-safe JSON documents on a shared filesystem.
//!
//! Several host processes read and rewrite the same small documents.  Each
//! document `<name>.json` gets two siblings:
//!
//! * `<name>.json.lock` is only ever advisory-locked, never read.
//! * `<name>.json.tmp` receives a full new copy which is fsynced and then
//!   renamed over the target, so a reader sees either the old or the new
//!   document and never a torn one.
//!
//! The store never propagates an error.  Reads fall back to the document's
//! `Default`, writes report `false`, and the caller decides what that means.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const LOCK_POLL: Duration = Duration::from_millis(100);
const MAX_ATTEMPTS: usize = 3;
const DECODE_BACKOFF: Duration = Duration::from_millis(500);
const LOCK_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct LockedStore {
    path: PathBuf,
    lock_timeout: Duration,
}

/// Holds the advisory lock; released on drop so every exit path unlocks.
struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            error!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

impl LockedStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name: OsString = self.path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn acquire(&self) -> Result<LockGuard, StoreError> {
        let lock_path = self.sibling(".lock");
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e))?;

        let contended = fs2::lock_contended_error().raw_os_error();
        let started = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    return Ok(LockGuard {
                        file,
                        path: lock_path,
                    })
                }
                Err(e) if e.raw_os_error() == contended => {
                    if started.elapsed() >= self.lock_timeout {
                        return Err(StoreError::LockTimeout {
                            path: lock_path,
                            timeout: self.lock_timeout,
                        });
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(StoreError::io(&lock_path, e)),
            }
        }
    }

    /// Reads the target while the caller holds the lock.  `None` means the
    /// file is missing or blank.
    fn read_document<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        let mut content = String::new();
        match File::open(&self.path) {
            Ok(mut file) => {
                file.read_to_string(&mut content)
                    .map_err(|e| StoreError::io(&self.path, e))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        }
        if content.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                path: self.path.clone(),
                source,
            })
    }

    /// Writes a temporary sibling, forces it to disk, then renames it over
    /// the target.  Caller holds the lock.
    fn replace(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = self.sibling(".tmp");
        let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| StoreError::io(&tmp, e))?;
        file.flush().map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))
    }

    fn backoff(err: &StoreError) -> Duration {
        match err {
            StoreError::LockTimeout { .. } => LOCK_BACKOFF,
            _ => DECODE_BACKOFF,
        }
    }

    pub fn read_blocking<T: DeserializeOwned + Default>(&self) -> T {
        for attempt in 1..=MAX_ATTEMPTS {
            if !self.path.exists() {
                return T::default();
            }
            let loaded = self
                .acquire()
                .and_then(|_guard| self.read_document::<T>());
            match loaded {
                Ok(doc) => return doc.unwrap_or_default(),
                Err(e) => {
                    warn!("Read attempt {}/{} failed: {}", attempt, MAX_ATTEMPTS, e);
                    if attempt < MAX_ATTEMPTS {
                        thread::sleep(Self::backoff(&e));
                    }
                }
            }
        }
        T::default()
    }

    #[cfg(test)]
    pub fn write_blocking<T: Serialize>(&self, doc: &T) -> bool {
        let bytes = match serde_json::to_vec_pretty(doc) {
            Ok(b) => b,
            Err(e) => {
                error!("Failed to encode {}: {}", self.path.display(), e);
                return false;
            }
        };
        for attempt in 1..=MAX_ATTEMPTS {
            match self.acquire().and_then(|_guard| self.replace(&bytes)) {
                Ok(()) => return true,
                Err(e) => {
                    warn!("Write attempt {}/{} failed: {}", attempt, MAX_ATTEMPTS, e);
                    if attempt < MAX_ATTEMPTS {
                        thread::sleep(Self::backoff(&e));
                    }
                }
            }
        }
        error!("Giving up on writing {}", self.path.display());
        false
    }

    /// Read-modify-write under a single lock hold.  `mutate` returns whether
    /// the document changed; an unchanged document is not rewritten.  Returns
    /// `true` only when a new document was persisted.
    pub fn modify_blocking<T, F>(&self, mut mutate: F) -> bool
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnMut(&mut T) -> bool,
    {
        for attempt in 1..=MAX_ATTEMPTS {
            let outcome = self.acquire().and_then(|_guard| {
                let mut doc = match self.read_document::<T>() {
                    Ok(doc) => doc.unwrap_or_default(),
                    Err(err @ StoreError::Decode { .. }) if attempt == MAX_ATTEMPTS => {
                        warn!("{}; rebuilding from an empty document", err);
                        T::default()
                    }
                    Err(err) => return Err(err),
                };
                if !mutate(&mut doc) {
                    return Ok(false);
                }
                let bytes = serde_json::to_vec_pretty(&doc)?;
                self.replace(&bytes)?;
                Ok(true)
            });
            match outcome {
                Ok(written) => {
                    if !written {
                        debug!("No change to {}", self.path.display());
                    }
                    return written;
                }
                Err(e) => {
                    warn!("Update attempt {}/{} failed: {}", attempt, MAX_ATTEMPTS, e);
                    if attempt < MAX_ATTEMPTS {
                        thread::sleep(Self::backoff(&e));
                    }
                }
            }
        }
        error!("Giving up on updating {}", self.path.display());
        false
    }

    pub async fn read<T>(&self) -> T
    where
        T: DeserializeOwned + Default + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.read_blocking())
            .await
            .unwrap_or_else(|e| {
                error!("Store read task failed: {}", e);
                T::default()
            })
    }

    #[cfg(test)]
    pub async fn write<T>(&self, doc: T) -> bool
    where
        T: Serialize + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.write_blocking(&doc))
            .await
            .unwrap_or_else(|e| {
                error!("Store write task failed: {}", e);
                false
            })
    }

    pub async fn modify<T, F>(&self, mutate: F) -> bool
    where
        T: DeserializeOwned + Serialize + Default + 'static,
        F: FnMut(&mut T) -> bool + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.modify_blocking::<T, F>(mutate))
            .await
            .unwrap_or_else(|e| {
                error!("Store update task failed: {}", e);
                false
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    type Doc = BTreeMap<String, Vec<String>>;

    fn store(dir: &TempDir) -> LockedStore {
        LockedStore::new(dir.path().join("doc.json"))
    }

    #[test]
    fn missing_and_blank_files_read_as_default() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert_eq!(s.read_blocking::<Doc>(), Doc::new());

        fs::write(&s.path, "  \n").unwrap();
        assert_eq!(s.read_blocking::<Doc>(), Doc::new());
    }

    #[test]
    fn malformed_file_falls_back_and_releases_lock() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        fs::write(&s.path, "{\"a\": [").unwrap();
        assert_eq!(s.read_blocking::<Doc>(), Doc::new());

        let mut doc = Doc::new();
        doc.insert("a".into(), vec!["x".into()]);
        assert!(s.write_blocking(&doc));
        assert_eq!(s.read_blocking::<Doc>(), doc);
    }

    #[test]
    fn write_leaves_no_temporary_file() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert!(s.write_blocking(&Doc::new()));
        assert!(s.path.exists());
        assert!(!s.sibling(".tmp").exists());
    }

    #[test]
    fn unchanged_document_is_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert!(!s.modify_blocking(|_: &mut Doc| false));
        assert!(!s.path.exists());
    }

    #[test]
    fn lock_timeout_reports_failure() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir).with_lock_timeout(Duration::from_millis(150));
        let held = s.acquire().unwrap();
        assert!(!s.write_blocking(&Doc::new()));
        drop(held);
        assert!(s.write_blocking(&Doc::new()));
    }

    #[test]
    fn concurrent_modifications_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");

        let workers: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|who| {
                // Separate handles stand in for separate processes.
                let s = LockedStore::new(&path);
                thread::spawn(move || {
                    for i in 0..25 {
                        let item = format!("{}-{}", who, i);
                        assert!(s.modify_blocking(move |doc: &mut Doc| {
                            doc.entry("items".into()).or_default().push(item.clone());
                            true
                        }));
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let doc: Doc = LockedStore::new(&path).read_blocking();
        assert_eq!(doc["items"].len(), 50);
    }

    #[tokio::test]
    async fn async_facade_round_trips() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert!(
            s.modify(|doc: &mut Doc| {
                doc.insert("k".into(), vec!["v".into()]);
                true
            })
            .await
        );
        let doc: Doc = s.read().await;
        assert_eq!(doc["k"], vec!["v".to_string()]);

        assert!(s.write(Doc::new()).await);
        assert!(s.read::<Doc>().await.is_empty());
    }
}
