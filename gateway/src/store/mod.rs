//! Token persistence.
//!
//! [`TokenStore`] is the only stateful seam in the service. Two backends:
//!   - [`FileTokenStore`]: one JSON document per identity under the token
//!     directory, written by temp-file + rename, with lock files for
//!     cross-process serialization. Safe to share between deployments.
//!   - [`MemoryTokenStore`]: process-local, for development and tests.

use std::io;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Identity, TokenRecord};

pub mod file;
pub mod lock;
pub mod memory;

pub use file::FileTokenStore;
pub use lock::{IdentityLock, LockSettings};
pub use memory::MemoryTokenStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write token record for '{identity}': {source}")]
    Write {
        identity: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read token record for '{identity}': {reason}")]
    Read { identity: String, reason: String },

    #[error("timed out waiting for the lock on '{0}'")]
    LockTimeout(String),

    #[error("token store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient failures may succeed on retry; a corrupted record will not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Read { .. })
    }
}

/// Durable storage of token records keyed by identity.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Write or overwrite the record for `record.identity`. Atomic.
    async fn put(&self, record: &TokenRecord) -> Result<(), StoreError>;

    /// The current record, or `None` if the identity has never been stored
    /// (or was purged).
    async fn get(&self, identity: &Identity) -> Result<Option<TokenRecord>, StoreError>;

    /// Remove the record. Deleting an absent identity succeeds.
    async fn delete(&self, identity: &Identity) -> Result<(), StoreError>;

    /// Every stored record, sorted by identity.
    async fn list(&self) -> Result<Vec<TokenRecord>, StoreError>;

    /// Like `list`, but records that cannot be decoded are logged and left
    /// out instead of failing the call. Used by maintenance sweeps.
    async fn scan(&self) -> Result<Vec<TokenRecord>, StoreError> {
        self.list().await
    }

    /// Acquire the mutation lock for `identity`. Held until the guard drops.
    async fn lock(&self, identity: &Identity) -> Result<IdentityLock, StoreError>;

    async fn check_health(&self) -> Result<(), StoreError>;

    /// Forget idle in-process lock entries. Returns how many were dropped.
    fn prune_locks(&self) -> usize {
        0
    }
}
