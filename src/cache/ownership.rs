//! Refresh-ownership leases.
//!
//! When several gateway instances serve the same fleet, only one should
//! refresh a given cached id at a time. Ownership is a lease row in the
//! shared store, taken and renewed with conditional writes. The protocol
//! is advisory: on any store trouble the caller proceeds unsynchronized
//! rather than failing the request.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::core::error::{GatewayError, GatewayResult};
use crate::store::{LeaseRecord, MetaStore};

use std::time::Duration;

pub const LEASE_DURATION: Duration = Duration::from_secs(60);
/// An owner starts renewing once less than this much of its lease remains.
pub const RENEWAL_WINDOW: Duration = Duration::from_secs(30);

/// What the caller should do about refreshing one id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshDirective {
    /// This instance owns the lease; refresh locally until the deadline.
    Local { deadline_ms: u64 },
    /// Another instance owns the lease; forward to it.
    Forward(String),
    /// The store could not arbitrate; refresh locally, unsynchronized.
    Unsynchronized,
}

/// Whether a lease row may be (re)claimed now: never granted, expired, or
/// our own lease inside the renewal window.
pub fn lease_grantable(existing: &LeaseRecord, own_forward: &str, now_ms: u64) -> bool {
    existing.deadline_ms == 0
        || existing.deadline_ms < now_ms
        || (existing.forward == own_forward
            && existing.deadline_ms < now_ms + RENEWAL_WINDOW.as_millis() as u64)
}

pub struct OwnershipCoordinator {
    store: Arc<dyn MetaStore>,
    own_endpoint: String,
    /// Ids this instance has already written a tracking row for. Purely a
    /// performance cache; losing it only costs one redundant write.
    seen: DashMap<String, ()>,
}

impl OwnershipCoordinator {
    pub fn new(store: Arc<dyn MetaStore>, own_endpoint: String) -> Self {
        Self {
            store,
            own_endpoint,
            seen: DashMap::new(),
        }
    }

    /// Arbitrate the refresh of `id`. Store failures fail open.
    pub async fn coordinate(&self, id: &str) -> RefreshDirective {
        match self.try_coordinate(id).await {
            Ok(directive) => directive,
            Err(e) => {
                log::warn!("lease coordination for {id} failed, proceeding unsynchronized: {e}");
                RefreshDirective::Unsynchronized
            }
        }
    }

    async fn try_coordinate(&self, id: &str) -> GatewayResult<RefreshDirective> {
        let now_ms = unix_ms()?;

        if !self.seen.contains_key(id) {
            // Tracking row so the id exists; losing this write to a peer
            // is fine, the row is there either way.
            let _ = self
                .store
                .lease_put_if(id, None, &LeaseRecord::tracking())
                .await?;
            self.seen.insert(id.to_string(), ());
        }

        let claimed = LeaseRecord {
            forward: self.own_endpoint.clone(),
            deadline_ms: now_ms + LEASE_DURATION.as_millis() as u64,
        };

        let current = match self.store.lease_get(id).await? {
            Some(lease) => {
                if lease_grantable(&lease.record, &self.own_endpoint, now_ms) {
                    // Conditional claim; on a lost race read the winner back.
                    let _ = self
                        .store
                        .lease_put_if(id, Some(lease.revision), &claimed)
                        .await?;
                    self.store.lease_get(id).await?
                } else {
                    Some(lease)
                }
            }
            None => {
                let _ = self.store.lease_put_if(id, None, &claimed).await?;
                self.store.lease_get(id).await?
            }
        };

        Ok(match current {
            Some(lease)
                if lease.record.forward == self.own_endpoint
                    && lease.record.deadline_ms > now_ms =>
            {
                RefreshDirective::Local {
                    deadline_ms: lease.record.deadline_ms,
                }
            }
            Some(lease)
                if !lease.record.forward.is_empty() && lease.record.deadline_ms > now_ms =>
            {
                RefreshDirective::Forward(lease.record.forward)
            }
            // row missing or still a tracking/expired row we failed to claim
            _ => RefreshDirective::Unsynchronized,
        })
    }
}

fn unix_ms() -> GatewayResult<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| GatewayError::Internal(e.to_string()))?
        .as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use crate::store::memory::MemoryStore;
    use crate::store::{ClusterRecord, ResultSet, VersionColor, VersionedLease};

    use super::*;

    fn coordinator(store: Arc<dyn MetaStore>, endpoint: &str) -> OwnershipCoordinator {
        OwnershipCoordinator::new(store, endpoint.to_string())
    }

    #[test]
    fn test_lease_grantable_rules() {
        let now = 1_000_000;
        // never granted
        assert!(lease_grantable(&LeaseRecord::tracking(), "me", now));
        // expired
        let expired = LeaseRecord {
            forward: "other".into(),
            deadline_ms: now - 1,
        };
        assert!(lease_grantable(&expired, "me", now));
        // foreign, still valid
        let foreign = LeaseRecord {
            forward: "other".into(),
            deadline_ms: now + 50_000,
        };
        assert!(!lease_grantable(&foreign, "me", now));
        // own lease outside the renewal window
        let own_fresh = LeaseRecord {
            forward: "me".into(),
            deadline_ms: now + 50_000,
        };
        assert!(!lease_grantable(&own_fresh, "me", now));
        // own lease inside the renewal window
        let own_aging = LeaseRecord {
            forward: "me".into(),
            deadline_ms: now + 10_000,
        };
        assert!(lease_grantable(&own_aging, "me", now));
    }

    #[tokio::test]
    async fn test_first_caller_claims_locally() {
        let store = Arc::new(MemoryStore::default());
        let coord = coordinator(store, "http://gw-1");
        match coord.coordinate("db1").await {
            RefreshDirective::Local { deadline_ms } => assert!(deadline_ms > 0),
            other => panic!("expected local ownership, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_renewal_is_idempotent_for_owner() {
        let store = Arc::new(MemoryStore::default());
        let coord = coordinator(store, "http://gw-1");
        let first = coord.coordinate("db1").await;
        let second = coord.coordinate("db1").await;
        // repeated acquisition by the owner keeps a single live lease
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_valid_foreign_lease_forwards() {
        let store = Arc::new(MemoryStore::default());
        let lease = LeaseRecord {
            forward: "http://gw-2".into(),
            deadline_ms: unix_ms().unwrap() + 60_000,
        };
        store.lease_put_if("db1", None, &lease).await.unwrap();

        let coord = coordinator(store, "http://gw-1");
        assert_eq!(
            coord.coordinate("db1").await,
            RefreshDirective::Forward("http://gw-2".into())
        );
    }

    #[tokio::test]
    async fn test_expired_foreign_lease_is_claimed() {
        let store = Arc::new(MemoryStore::default());
        let lease = LeaseRecord {
            forward: "http://gw-2".into(),
            deadline_ms: unix_ms().unwrap() - 1,
        };
        store.lease_put_if("db1", None, &lease).await.unwrap();

        let coord = coordinator(store, "http://gw-1");
        assert!(matches!(
            coord.coordinate("db1").await,
            RefreshDirective::Local { .. }
        ));
    }

    #[tokio::test]
    async fn test_race_yields_single_owner() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::default());
        let a = coordinator(store.clone(), "http://gw-1");
        let b = coordinator(store, "http://gw-2");

        let (da, db) = tokio::join!(a.coordinate("db1"), b.coordinate("db1"));
        let locals = [&da, &db]
            .iter()
            .filter(|d| matches!(d, RefreshDirective::Local { .. }))
            .count();
        assert_eq!(locals, 1, "exactly one instance may own the lease: {da:?} {db:?}");
    }

    struct BrokenStore;

    #[async_trait]
    impl MetaStore for BrokenStore {
        async fn list_clusters(&self) -> GatewayResult<ResultSet> {
            Err(GatewayError::Unavailable("down".into()))
        }
        async fn get_cluster(&self, _: &str) -> GatewayResult<Option<ClusterRecord>> {
            Err(GatewayError::Unavailable("down".into()))
        }
        async fn version_colors(&self) -> GatewayResult<Vec<VersionColor>> {
            Err(GatewayError::Unavailable("down".into()))
        }
        async fn lease_get(&self, _: &str) -> GatewayResult<Option<VersionedLease>> {
            Err(GatewayError::Unavailable("down".into()))
        }
        async fn lease_put_if(
            &self,
            _: &str,
            _: Option<i64>,
            _: &LeaseRecord,
        ) -> GatewayResult<bool> {
            Err(GatewayError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let coord = coordinator(Arc::new(BrokenStore), "http://gw-1");
        assert_eq!(
            coord.coordinate("db1").await,
            RefreshDirective::Unsynchronized
        );
    }
}
