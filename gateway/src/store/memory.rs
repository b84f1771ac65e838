use async_trait::async_trait;
use dashmap::DashMap;

use super::lock::{IdentityLock, LockSettings, LockTable};
use super::{StoreError, TokenStore};
use crate::models::{Identity, TokenRecord};

/// In-memory token store (useful for development and testing).
///
/// Records vanish with the process and are not shared between deployments.
#[derive(Default)]
pub struct MemoryTokenStore {
    records: DashMap<Identity, TokenRecord>,
    locks: LockTable,
    settings: LockSettings,
}

impl MemoryTokenStore {
    pub fn new(settings: LockSettings) -> Self {
        Self {
            records: DashMap::new(),
            locks: LockTable::default(),
            settings,
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn put(&self, record: &TokenRecord) -> Result<(), StoreError> {
        self.records.insert(record.identity.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, identity: &Identity) -> Result<Option<TokenRecord>, StoreError> {
        Ok(self.records.get(identity).map(|r| r.value().clone()))
    }

    async fn delete(&self, identity: &Identity) -> Result<(), StoreError> {
        self.records.remove(identity);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TokenRecord>, StoreError> {
        let mut records: Vec<TokenRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(records)
    }

    async fn lock(&self, identity: &Identity) -> Result<IdentityLock, StoreError> {
        let local = self.locks.acquire(identity, self.settings.timeout).await?;
        Ok(IdentityLock::new(local, None))
    }

    async fn check_health(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn prune_locks(&self) -> usize {
        self.locks.prune()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TokenSecret;
    use chrono::Utc;

    #[tokio::test]
    async fn test_memory_store_roundtrip_and_sorting() {
        let store = MemoryTokenStore::default();
        for name in ["svc-c", "svc-a", "svc-b"] {
            let rec = TokenRecord::new(
                Identity::parse(name).unwrap(),
                &TokenSecret::generate(),
                Utc::now(),
                None,
            );
            store.put(&rec).await.unwrap();
        }

        let ids: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.identity.to_string())
            .collect();
        assert_eq!(ids, vec!["svc-a", "svc-b", "svc-c"]);

        let id = Identity::parse("svc-b").unwrap();
        store.delete(&id).await.unwrap();
        store.delete(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
    }
}
