//! On-disk token store.
//!
//! Layout under the token directory:
//!
//! ```text
//! tokens/
//!   svc-a.json     # the record
//!   svc-a.lock     # present only while a mutation of svc-a is in flight
//!   .tmpXXXXXX     # in-progress write, renamed over svc-a.json when complete
//! ```

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use super::lock::{IdentityLock, LockFile, LockSettings, LockTable};
use super::{StoreError, TokenStore};
use crate::models::{Identity, TokenRecord};

const RECORD_EXT: &str = "json";
const LOCK_EXT: &str = "lock";

pub struct FileTokenStore {
    root: PathBuf,
    locks: LockTable,
    settings: LockSettings,
}

impl FileTokenStore {
    /// Open (and create, if missing) the token directory.
    pub fn open(root: impl Into<PathBuf>, settings: LockSettings) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| StoreError::Unavailable(format!("cannot create token directory: {}", e)))?;

        tracing::info!(dir = %root.display(), "token store opened");
        Ok(Self {
            root,
            locks: LockTable::default(),
            settings,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, identity: &Identity) -> PathBuf {
        self.root.join(format!("{}.{}", identity, RECORD_EXT))
    }

    fn lock_path(&self, identity: &Identity) -> PathBuf {
        self.root.join(format!("{}.{}", identity, LOCK_EXT))
    }

    /// Every record in the directory, sorted by identity. With `strict`, the
    /// first unreadable record fails the call; otherwise it is skipped.
    async fn read_all(&self, strict: bool) -> Result<Vec<TokenRecord>, StoreError> {
        let unavailable =
            |e: io::Error| StoreError::Unavailable(format!("cannot read token directory: {}", e));

        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(unavailable)?;
        let mut records = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(identity) = Identity::parse(stem) else {
                tracing::warn!(file = %path.display(), "ignoring file with an invalid identity name");
                continue;
            };

            let decoded = match tokio::fs::read(&path).await {
                Ok(bytes) => decode(&identity, &bytes),
                // purged between read_dir and read
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => Err(StoreError::Read {
                    identity: identity.to_string(),
                    reason: e.to_string(),
                }),
            };

            match decoded {
                Ok(record) => records.push(record),
                Err(e) if strict => return Err(e),
                Err(e) => {
                    tracing::warn!(file = %path.display(), "skipping unreadable token record: {}", e);
                }
            }
        }

        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(records)
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn put(&self, record: &TokenRecord) -> Result<(), StoreError> {
        let identity = record.identity.to_string();
        let bytes = serde_json::to_vec_pretty(record).map_err(|e| StoreError::Write {
            identity: identity.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;

        let dir = self.root.clone();
        let target = self.record_path(&record.identity);

        // the blocking task runs to completion even if this future is dropped
        tokio::task::spawn_blocking(move || write_atomic(&dir, &target, &bytes))
            .await
            .map_err(|e| StoreError::Unavailable(format!("write task failed: {}", e)))?
            .map_err(|source| StoreError::Write { identity, source })?;

        tracing::debug!(identity = %record.identity, "token record written");
        Ok(())
    }

    async fn get(&self, identity: &Identity) -> Result<Option<TokenRecord>, StoreError> {
        let bytes = match tokio::fs::read(self.record_path(identity)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Read {
                    identity: identity.to_string(),
                    reason: e.to_string(),
                })
            }
        };
        decode(identity, &bytes).map(Some)
    }

    async fn delete(&self, identity: &Identity) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.record_path(identity)).await {
            Ok(()) => {
                tracing::debug!(identity = %identity, "token record deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Write {
                identity: identity.to_string(),
                source,
            }),
        }
    }

    async fn list(&self) -> Result<Vec<TokenRecord>, StoreError> {
        self.read_all(true).await
    }

    async fn scan(&self) -> Result<Vec<TokenRecord>, StoreError> {
        self.read_all(false).await
    }

    async fn lock(&self, identity: &Identity) -> Result<IdentityLock, StoreError> {
        let local = self.locks.acquire(identity, self.settings.timeout).await?;
        let file = LockFile::acquire(self.lock_path(identity), identity, self.settings).await?;
        Ok(IdentityLock::new(local, Some(file)))
    }

    async fn check_health(&self) -> Result<(), StoreError> {
        let dir = self.root.clone();
        tokio::task::spawn_blocking(move || NamedTempFile::new_in(&dir).map(drop))
            .await
            .map_err(|e| StoreError::Unavailable(format!("health check failed: {}", e)))?
            .map_err(|e| StoreError::Unavailable(format!("token directory not writable: {}", e)))
    }

    fn prune_locks(&self) -> usize {
        self.locks.prune()
    }
}

/// Write `bytes` to a temp file in `dir`, fsync, then rename over `target`.
fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;

    // make the rename itself durable
    if let Err(e) = sync_dir(dir) {
        tracing::warn!(
            dir = %dir.display(),
            error = %e,
            "token directory fsync failed; the last rename may not survive a crash"
        );
    }
    Ok(())
}

/// fsync a directory so renames inside it are durable.
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

fn decode(identity: &Identity, bytes: &[u8]) -> Result<TokenRecord, StoreError> {
    let record: TokenRecord = serde_json::from_slice(bytes).map_err(|e| StoreError::Read {
        identity: identity.to_string(),
        reason: format!("corrupted record: {}", e),
    })?;

    if &record.identity != identity {
        return Err(StoreError::Read {
            identity: identity.to_string(),
            reason: format!("record belongs to '{}'", record.identity),
        });
    }
    Ok(record)
}
