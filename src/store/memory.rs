//! In-memory metadata store for config-seeded static fleets and tests.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::ClusterSeed;
use crate::core::error::GatewayResult;

use super::{
    clusters_result_set, ClusterRecord, LeaseRecord, MetaStore, ResultSet, VersionColor,
    VersionedLease,
};

#[derive(Default)]
pub struct MemoryStore {
    clusters: Vec<ClusterRecord>,
    colors: Vec<VersionColor>,
    leases: DashMap<String, VersionedLease>,
    next_revision: AtomicI64,
}

impl MemoryStore {
    pub fn from_seeds(seeds: &[ClusterSeed]) -> Self {
        Self {
            clusters: seeds.iter().map(ClusterRecord::from).collect(),
            ..Default::default()
        }
    }

    pub fn with_clusters(clusters: Vec<ClusterRecord>) -> Self {
        Self {
            clusters,
            ..Default::default()
        }
    }

    pub fn set_colors(&mut self, colors: Vec<VersionColor>) {
        self.colors = colors;
    }

    fn bump_revision(&self) -> i64 {
        self.next_revision.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl MetaStore for MemoryStore {
    async fn list_clusters(&self) -> GatewayResult<ResultSet> {
        let mut records = self.clusters.clone();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clusters_result_set(&records))
    }

    async fn get_cluster(&self, name: &str) -> GatewayResult<Option<ClusterRecord>> {
        Ok(self.clusters.iter().find(|c| c.name == name).cloned())
    }

    async fn version_colors(&self) -> GatewayResult<Vec<VersionColor>> {
        Ok(self.colors.clone())
    }

    async fn lease_get(&self, id: &str) -> GatewayResult<Option<VersionedLease>> {
        Ok(self.leases.get(id).map(|v| v.clone()))
    }

    async fn lease_put_if(
        &self,
        id: &str,
        expected: Option<i64>,
        record: &LeaseRecord,
    ) -> GatewayResult<bool> {
        // The entry guard makes the compare-and-put atomic per key.
        match self.leases.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                if expected.is_some() {
                    return Ok(false);
                }
                slot.insert(VersionedLease {
                    record: record.clone(),
                    revision: self.bump_revision(),
                });
                Ok(true)
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if expected != Some(slot.get().revision) {
                    return Ok(false);
                }
                *slot.get_mut() = VersionedLease {
                    record: record.clone(),
                    revision: self.bump_revision(),
                };
                Ok(true)
            }
        }
    }
}
