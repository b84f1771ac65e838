//! Background job: prune token records that have been revoked or expired
//! for longer than the retention window.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::service::TokenService;

/// Spawn the background cleanup task. Call this once at startup.
pub fn spawn(service: TokenService, every: Duration, retention: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            run_once(&service, retention).await;
        }
    })
}

/// One sweep. Failures are logged; the next tick tries again.
pub async fn run_once(service: &TokenService, retention: Duration) -> usize {
    match service.prune(retention).await {
        Ok(purged) => {
            if purged > 0 {
                tracing::info!(purged, "pruned dead token records");
            }
            purged
        }
        Err(e) => {
            tracing::error!("cleanup job failed: {}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;

    use crate::models::{Identity, TokenRecord, TokenSecret};
    use crate::service::IssuancePolicy;
    use crate::store::{MemoryTokenStore, TokenStore};

    #[tokio::test]
    async fn test_run_once_prunes_old_revocations() {
        let store = Arc::new(MemoryTokenStore::default());
        let service = TokenService::new(store.clone(), IssuancePolicy::default());

        let now = Utc::now();
        let mut old = TokenRecord::new(
            Identity::parse("old").unwrap(),
            &TokenSecret::generate(),
            now - chrono::Duration::days(30),
            None,
        );
        old.revoked = true;
        old.revoked_at = Some(now - chrono::Duration::days(20));
        store.put(&old).await.unwrap();
        service.issue(Identity::parse("fresh").unwrap(), None).await.unwrap();

        let purged = run_once(&service, Duration::from_secs(7 * 24 * 3600)).await;
        assert_eq!(purged, 1);
        assert!(store.get(&old.identity).await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
