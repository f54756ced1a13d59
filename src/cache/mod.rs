//! Response caching.
//!
//! GET responses are cached per normalized URL under a policy chosen by
//! longest route prefix. An entry is fresh inside the refresh window,
//! stale but still servable inside the expiry window (a refresh runs in
//! the background), and gone after that. Policies with `keep_on_error`
//! retain the previous value when a refresh fails.

use bytes::Bytes;
use dashmap::DashMap;
use http::StatusCode;
use tokio::time::Instant;

use crate::config::CacheRoute;

pub mod ownership;

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct CachePolicy {
    pub time_to_expire: Duration,
    pub time_to_refresh: Duration,
    pub keep_on_error: bool,
}

#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Bytes,
    pub refreshed_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

pub struct ResponseCache {
    /// Route policies ordered by prefix length, longest first.
    policies: Vec<(String, CachePolicy)>,
    entries: DashMap<String, CachedResponse>,
}

impl ResponseCache {
    pub fn new(routes: &[CacheRoute]) -> Self {
        let mut policies: Vec<(String, CachePolicy)> = routes
            .iter()
            .map(|r| {
                (
                    r.prefix.clone(),
                    CachePolicy {
                        time_to_expire: Duration::from_secs(r.time_to_expire),
                        time_to_refresh: Duration::from_secs(r.time_to_refresh),
                        keep_on_error: r.keep_on_error,
                    },
                )
            })
            .collect();
        policies.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self {
            policies,
            entries: DashMap::new(),
        }
    }

    pub fn policy_for(&self, path: &str) -> Option<&CachePolicy> {
        self.policies
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, policy)| policy)
    }

    pub fn classify(entry: &CachedResponse, policy: &CachePolicy) -> Freshness {
        let age = entry.refreshed_at.elapsed();
        if age < policy.time_to_refresh {
            Freshness::Fresh
        } else if age < policy.time_to_expire {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// Entry for `key` with its freshness. Expired entries read as a miss;
    /// without `keep_on_error` they are evicted outright, with it they stay
    /// behind for `peek` until a refresh succeeds.
    pub fn lookup(&self, key: &str, policy: &CachePolicy) -> Option<(CachedResponse, Freshness)> {
        let entry = self.entries.get(key)?.clone();
        match Self::classify(&entry, policy) {
            Freshness::Expired => {
                if !policy.keep_on_error {
                    drop(self.entries.remove(key));
                }
                None
            }
            freshness => Some((entry, freshness)),
        }
    }

    /// Entry regardless of freshness, for keep-on-error serving.
    pub fn peek(&self, key: &str) -> Option<CachedResponse> {
        self.entries.get(key).map(|e| e.clone())
    }

    pub fn store(&self, key: &str, status: StatusCode, content_type: &str, body: Bytes) {
        self.entries.insert(
            key.to_string(),
            CachedResponse {
                status,
                content_type: content_type.to_string(),
                body,
                refreshed_at: Instant::now(),
            },
        );
    }

    pub fn evict(&self, key: &str) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ResponseCache {
        ResponseCache::new(&[
            CacheRoute {
                prefix: "/meta/clusters".into(),
                time_to_expire: 120,
                time_to_refresh: 30,
                keep_on_error: true,
            },
            CacheRoute {
                prefix: "/meta".into(),
                time_to_expire: 10,
                time_to_refresh: 5,
                keep_on_error: false,
            },
        ])
    }

    #[test]
    fn test_longest_prefix_wins() {
        let cache = cache();
        let policy = cache.policy_for("/meta/clusters?name=a").unwrap();
        assert_eq!(policy.time_to_expire, Duration::from_secs(120));
        let policy = cache.policy_for("/meta/config").unwrap();
        assert_eq!(policy.time_to_expire, Duration::from_secs(10));
        assert!(cache.policy_for("/ping").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_windows() {
        let cache = cache();
        let policy = cache.policy_for("/meta/clusters").unwrap().clone();
        cache.store(
            "/meta/clusters",
            StatusCode::OK,
            "application/json",
            Bytes::from_static(b"{}"),
        );

        let (_, f) = cache.lookup("/meta/clusters", &policy).unwrap();
        assert_eq!(f, Freshness::Fresh);

        tokio::time::advance(Duration::from_secs(31)).await;
        let (_, f) = cache.lookup("/meta/clusters", &policy).unwrap();
        assert_eq!(f, Freshness::Stale);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(cache.lookup("/meta/clusters", &policy).is_none());
        // keep_on_error retains the expired entry for error recovery
        assert!(cache.peek("/meta/clusters").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_evicted_without_keep_on_error() {
        let cache = cache();
        let policy = cache.policy_for("/meta/config").unwrap().clone();
        assert!(!policy.keep_on_error);
        cache.store(
            "/meta/config",
            StatusCode::OK,
            "application/json",
            Bytes::from_static(b"{}"),
        );

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.lookup("/meta/config", &policy).is_none());
        assert!(cache.peek("/meta/config").is_none());
    }
}
