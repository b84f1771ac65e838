//! Token lifecycle policy over a [`TokenStore`].
//!
//! The service owns no state of its own: every call goes to the store, and
//! every mutation (issue, revoke, renew, purge) runs under the identity lock
//! on a detached task, so a caller that goes away mid-request cannot leave a
//! mutation half applied.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    digest_value, Identity, IdentityError, IssuedToken, TokenRecord, TokenSecret, TokenStatus,
};
use crate::store::{StoreError, TokenStore};

/// Upper bound on any TTL, whatever the configured maximum (100 years).
const TTL_CEILING: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(#[from] IdentityError),

    #[error("invalid ttl: {0}")]
    InvalidTtl(String),

    #[error("a live token already exists for '{0}'")]
    IdentityConflict(Identity),

    #[error("no token record for '{0}'")]
    NotFound(Identity),

    #[error("token for '{0}' is revoked or expired")]
    Inactive(Identity),

    #[error("token service unavailable: {0}")]
    Unavailable(#[from] StoreError),
}

impl ServiceError {
    /// Policy violations are the caller's fault; storage failures are ours.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ServiceError::Unavailable(_))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Unavailable(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// What `issue` does when the identity already holds a live token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Refuse with `IdentityConflict`.
    #[default]
    Reject,
    /// Overwrite it; the previous value stops validating immediately.
    Replace,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "replace" => Ok(Self::Replace),
            other => Err(format!("unknown conflict policy '{}': expected reject or replace", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuancePolicy {
    pub on_conflict: ConflictPolicy,
    /// Applied when a caller gives no TTL. `None` issues non-expiring tokens.
    pub default_ttl: Option<Duration>,
    pub max_ttl: Option<Duration>,
    /// Remaining lifetime at or below which status reports `needs_renewal`.
    pub renewal_margin: Duration,
}

impl Default for IssuancePolicy {
    fn default() -> Self {
        Self {
            on_conflict: ConflictPolicy::Reject,
            default_ttl: None,
            max_ttl: None,
            renewal_margin: Duration::from_secs(600),
        }
    }
}

#[derive(Clone)]
pub struct TokenService {
    store: Arc<dyn TokenStore>,
    policy: Arc<IssuancePolicy>,
}

impl TokenService {
    pub fn new(store: Arc<dyn TokenStore>, policy: IssuancePolicy) -> Self {
        Self {
            store,
            policy: Arc::new(policy),
        }
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    pub fn policy(&self) -> &IssuancePolicy {
        &self.policy
    }

    /// Issue a new token for `identity`. The returned value is the only copy.
    pub async fn issue(
        &self,
        identity: Identity,
        ttl: Option<Duration>,
    ) -> Result<IssuedToken, ServiceError> {
        let ttl = self.resolve_ttl(ttl)?;
        let this = self.clone();
        detached(async move { this.issue_locked(identity, ttl).await }).await
    }

    async fn issue_locked(
        &self,
        identity: Identity,
        ttl: Option<chrono::Duration>,
    ) -> Result<IssuedToken, ServiceError> {
        let _guard = self.store.lock(&identity).await?;
        let now = Utc::now();

        if let Some(existing) = self.store.get(&identity).await? {
            if existing.is_live(now) {
                match self.policy.on_conflict {
                    ConflictPolicy::Reject => {
                        tracing::info!(identity = %identity, "issuance refused: live token exists");
                        return Err(ServiceError::IdentityConflict(identity));
                    }
                    ConflictPolicy::Replace => {
                        tracing::info!(identity = %identity, "replacing live token");
                    }
                }
            }
        }

        let value = TokenSecret::generate();
        let record = TokenRecord::new(identity, &value, now, ttl.map(|t| now + t));
        self.store.put(&record).await?;

        tracing::info!(
            identity = %record.identity,
            expires_at = ?record.expires_at,
            "token issued"
        );
        Ok(IssuedToken { record, value })
    }

    /// True only for the current value of a live token. Never says which check failed.
    pub async fn validate(&self, identity: &Identity, value: &str) -> Result<bool, ServiceError> {
        let Some(record) = self.store.get(identity).await? else {
            // same digest work as a real comparison
            let _ = digest_value(value);
            return Ok(false);
        };

        let matches = record.matches(value);
        let valid = matches && record.is_live(Utc::now());
        tracing::debug!(identity = %identity, valid, "token validated");
        Ok(valid)
    }

    /// Mark the token permanently invalid. Revoking twice is not an error.
    pub async fn revoke(&self, identity: Identity) -> Result<TokenRecord, ServiceError> {
        let this = self.clone();
        detached(async move { this.revoke_locked(identity).await }).await
    }

    async fn revoke_locked(&self, identity: Identity) -> Result<TokenRecord, ServiceError> {
        let _guard = self.store.lock(&identity).await?;
        let mut record = self
            .store
            .get(&identity)
            .await?
            .ok_or_else(|| ServiceError::NotFound(identity.clone()))?;

        if record.revoked {
            return Ok(record);
        }

        record.revoked = true;
        record.revoked_at = Some(Utc::now());
        self.store.put(&record).await?;

        tracing::info!(identity = %identity, "token revoked");
        Ok(record)
    }

    /// Push out the expiry of a live token.
    pub async fn renew(
        &self,
        identity: Identity,
        ttl: Option<Duration>,
    ) -> Result<TokenRecord, ServiceError> {
        let ttl = self.resolve_ttl(ttl)?;
        let this = self.clone();
        detached(async move { this.renew_locked(identity, ttl).await }).await
    }

    async fn renew_locked(
        &self,
        identity: Identity,
        ttl: Option<chrono::Duration>,
    ) -> Result<TokenRecord, ServiceError> {
        let _guard = self.store.lock(&identity).await?;
        let now = Utc::now();
        let mut record = self
            .store
            .get(&identity)
            .await?
            .ok_or_else(|| ServiceError::NotFound(identity.clone()))?;

        if !record.is_live(now) {
            return Err(ServiceError::Inactive(identity));
        }

        // without an explicit or default ttl, grant the lifetime of the last
        // issue/renew again; non-expiring records stay non-expiring
        let ttl = ttl.or_else(|| {
            record
                .expires_at
                .map(|exp| exp - record.renewed_at.unwrap_or(record.issued_at))
        });
        record.expires_at = ttl.map(|t| now + t);
        record.renewed_at = Some(now);
        self.store.put(&record).await?;

        tracing::info!(identity = %identity, expires_at = ?record.expires_at, "token renewed");
        Ok(record)
    }

    pub async fn status(&self, identity: &Identity) -> Result<TokenStatus, ServiceError> {
        let record = self
            .store
            .get(identity)
            .await?
            .ok_or_else(|| ServiceError::NotFound(identity.clone()))?;
        Ok(TokenStatus::from_record(&record, Utc::now(), self.renewal_margin()))
    }

    pub async fn list(&self) -> Result<Vec<TokenStatus>, ServiceError> {
        let now = Utc::now();
        let margin = self.renewal_margin();
        Ok(self
            .store
            .list()
            .await?
            .iter()
            .map(|r| TokenStatus::from_record(r, now, margin))
            .collect())
    }

    /// Physically delete a record, live or not. Idempotent.
    pub async fn purge(&self, identity: Identity) -> Result<(), ServiceError> {
        let this = self.clone();
        detached(async move { this.purge_locked(identity).await }).await
    }

    async fn purge_locked(&self, identity: Identity) -> Result<(), ServiceError> {
        let _guard = self.store.lock(&identity).await?;
        self.store.delete(&identity).await?;
        tracing::info!(identity = %identity, "token record purged");
        Ok(())
    }

    /// Delete records that have been revoked or expired for longer than
    /// `retention`. Returns the number of records removed.
    ///
    /// Unreadable records and per-identity failures are logged and skipped so
    /// one bad entry cannot stall retention for the rest.
    pub async fn prune(&self, retention: Duration) -> Result<usize, ServiceError> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|_| ServiceError::InvalidTtl("retention out of range".into()))?;
        let now = Utc::now();
        let past_retention =
            |r: &TokenRecord| r.dead_since(now).is_some_and(|since| since + retention <= now);

        let candidates: Vec<Identity> = self
            .store
            .scan()
            .await?
            .into_iter()
            .filter(|r| past_retention(r))
            .map(|r| r.identity)
            .collect();

        let mut purged = 0;
        let mut skipped = 0;
        for identity in candidates {
            match self.prune_one(&identity, &past_retention).await {
                Ok(true) => purged += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(identity = %identity, "skipping record during prune: {}", e);
                    skipped += 1;
                }
            }
        }

        let idle_locks = self.store.prune_locks();
        tracing::info!(purged, skipped, idle_locks, "token retention sweep finished");
        Ok(purged)
    }

    async fn prune_one<F>(&self, identity: &Identity, past_retention: &F) -> Result<bool, StoreError>
    where
        F: Fn(&TokenRecord) -> bool,
    {
        let _guard = self.store.lock(identity).await?;
        // may have been reissued since the scan
        match self.store.get(identity).await? {
            Some(current) if past_retention(&current) => {
                self.store.delete(identity).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remaining lifetime at or below which a token is flagged for renewal.
    pub fn renewal_margin(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.policy.renewal_margin).unwrap_or(chrono::Duration::zero())
    }

    fn resolve_ttl(&self, ttl: Option<Duration>) -> Result<Option<chrono::Duration>, ServiceError> {
        let Some(ttl) = ttl.or(self.policy.default_ttl) else {
            return Ok(None);
        };

        if ttl.is_zero() {
            return Err(ServiceError::InvalidTtl("ttl must be positive".into()));
        }
        if let Some(max) = self.policy.max_ttl {
            if ttl > max {
                return Err(ServiceError::InvalidTtl(format!(
                    "ttl exceeds the maximum of {}s",
                    max.as_secs()
                )));
            }
        }
        if ttl > TTL_CEILING {
            return Err(ServiceError::InvalidTtl("ttl out of range".into()));
        }

        chrono::Duration::from_std(ttl)
            .map(Some)
            .map_err(|_| ServiceError::InvalidTtl("ttl out of range".into()))
    }
}

/// Run a mutation on its own task so a dropped caller cannot abandon it half way.
async fn detached<T, F>(fut: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut).await.map_err(|e| {
        ServiceError::Unavailable(StoreError::Unavailable(format!("mutation task failed: {}", e)))
    })?
}
