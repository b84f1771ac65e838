//! Per-identity mutation locks.
//!
//! Two layers: an async mutex per identity for callers inside this process,
//! and an exclusive lock file (`create_new`) next to the record for callers in
//! other processes sharing the same token directory.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::StoreError;
use crate::models::Identity;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// How long a caller waits before giving up with `LockTimeout`.
    pub timeout: Duration,
    /// Lock files older than this are assumed abandoned by a crashed process.
    pub stale_after: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            stale_after: Duration::from_secs(30),
        }
    }
}

/// Guard for a held identity lock. Releases both layers on drop.
pub struct IdentityLock {
    // field order matters: the lock file goes before the local mutex so the
    // next in-process waiter finds the file already gone
    _file: Option<LockFile>,
    _local: OwnedMutexGuard<()>,
}

impl IdentityLock {
    pub(crate) fn new(local: OwnedMutexGuard<()>, file: Option<LockFile>) -> Self {
        Self {
            _file: file,
            _local: local,
        }
    }
}

/// In-process half: one async mutex per identity.
#[derive(Clone, Default)]
pub struct LockTable {
    locks: Arc<DashMap<Identity, Arc<Mutex<()>>>>,
}

impl LockTable {
    pub async fn acquire(
        &self,
        identity: &Identity,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, StoreError> {
        let mutex = self.locks.entry(identity.clone()).or_default().clone();
        tokio::time::timeout(timeout, mutex.lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout(identity.to_string()))
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Cross-process half: an exclusive lock file removed on drop.
pub(crate) struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub(crate) async fn acquire(
        path: PathBuf,
        identity: &Identity,
        settings: LockSettings,
    ) -> Result<Self, StoreError> {
        let deadline = tokio::time::Instant::now() + settings.timeout;
        loop {
            let attempt = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;

            match attempt {
                Ok(mut file) => {
                    // owner pid is informational only
                    let _ = file
                        .write_all(format!("{}\n", std::process::id()).as_bytes())
                        .await;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if is_stale(&path, settings.stale_after).await {
                        tracing::warn!(identity = %identity, "breaking stale token lock");
                        match tokio::fs::remove_file(&path).await {
                            Ok(()) => continue,
                            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                            Err(source) => {
                                return Err(StoreError::Write {
                                    identity: identity.to_string(),
                                    source,
                                })
                            }
                        }
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StoreError::LockTimeout(identity.to_string()));
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(source) => {
                    return Err(StoreError::Write {
                        identity: identity.to_string(),
                        source,
                    })
                }
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to release token lock");
            }
        }
    }
}

async fn is_stale(path: &std::path::Path, stale_after: Duration) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > stale_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_local_lock_times_out_while_held() {
        let table = LockTable::default();
        let _held = table.acquire(&id("svc-a"), Duration::from_secs(1)).await.unwrap();

        let err = table
            .acquire(&id("svc-a"), Duration::from_millis(20))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::LockTimeout(_)));

        // unrelated identities are not blocked
        assert!(table.acquire(&id("svc-b"), Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_entries() {
        let table = LockTable::default();
        let held = table.acquire(&id("svc-a"), Duration::from_secs(1)).await.unwrap();
        drop(table.acquire(&id("svc-b"), Duration::from_secs(1)).await.unwrap());

        assert_eq!(table.prune(), 1);
        assert_eq!(table.len(), 1);
        drop(held);
        assert_eq!(table.prune(), 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_lock_file_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc-a.lock");
        let settings = LockSettings {
            timeout: Duration::from_millis(50),
            stale_after: Duration::from_secs(60),
        };

        let first = LockFile::acquire(path.clone(), &id("svc-a"), settings).await.unwrap();
        let err = LockFile::acquire(path.clone(), &id("svc-a"), settings)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::LockTimeout(_)));

        drop(first);
        assert!(!path.exists());
        assert!(LockFile::acquire(path, &id("svc-a"), settings).await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_lock_file_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc-a.lock");
        std::fs::write(&path, "12345\n").unwrap();

        let settings = LockSettings {
            timeout: Duration::from_secs(2),
            stale_after: Duration::ZERO,
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(LockFile::acquire(path, &id("svc-a"), settings).await.is_ok());
    }
}
