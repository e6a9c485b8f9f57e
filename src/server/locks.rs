//! Per-destination mutual exclusion between sessions.
//!
//! Two clients writing the same path would otherwise interleave deletes and
//! truncating opens, with the last opener winning. When enabled, a session
//! holds the lock for its resolved destination from validation until the
//! file and its lock file are finished.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Entry = Weak<AsyncMutex<()>>;

#[derive(Debug, Clone, Default)]
pub struct PathLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Entry>>>,
}

/// Resolve the parent through symlinks so aliases of one file share a lock.
async fn lock_key(path: &Path) -> PathBuf {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    let parent = match parent {
        Some(parent) => tokio::fs::canonicalize(parent)
            .await
            .unwrap_or_else(|_| parent.to_path_buf()),
        None => tokio::fs::canonicalize(".")
            .await
            .unwrap_or_else(|_| PathBuf::from(".")),
    };
    match path.file_name() {
        Some(name) => parent.join(name),
        None => path.to_path_buf(),
    }
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, path: &Path) -> OwnedMutexGuard<()> {
        let key = lock_key(path).await;
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.retain(|_, entry| entry.strong_count() > 0);
            match map.get(&key).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    map.insert(key, Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    /// Destinations with a live holder or waiter.
    pub fn active(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.values().filter(|entry| entry.strong_count() > 0).count()
    }
}
