//! etcd-backed metadata store.
//!
//! Cluster rows live as JSON values under `{prefix}/clusters/`, the version
//! color table at `{prefix}/version_colors`, lease rows under
//! `{prefix}/leases/`. Lease writes go through transactions comparing the
//! row's mod revision, which is the conditional read-modify-write the
//! ownership protocol builds on.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, ConnectOptions, GetOptions, Txn, TxnOp};
use tokio::sync::Mutex;

use crate::config::Etcd;
use crate::core::error::{GatewayError, GatewayResult};

use super::{
    clusters_result_set, ClusterRecord, LeaseRecord, MetaStore, ResultSet, VersionColor,
    VersionedLease,
};

pub struct EtcdStore {
    config: Etcd,
    client: Mutex<Option<Client>>,
}

impl EtcdStore {
    pub fn new(config: Etcd) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    fn clusters_prefix(&self) -> String {
        format!("{}/clusters/", self.config.prefix)
    }

    fn cluster_key(&self, name: &str) -> String {
        format!("{}/clusters/{}", self.config.prefix, name)
    }

    fn colors_key(&self) -> String {
        format!("{}/version_colors", self.config.prefix)
    }

    fn lease_key(&self, id: &str) -> String {
        format!("{}/leases/{}", self.config.prefix, id)
    }

    async fn create_client(&self) -> Result<Client, etcd_client::Error> {
        let mut options = ConnectOptions::default();
        if let Some(timeout) = self.config.timeout {
            options = options.with_timeout(Duration::from_secs(timeout as u64));
        };
        if let Some(connect_timeout) = self.config.connect_timeout {
            options = options.with_connect_timeout(Duration::from_secs(connect_timeout as u64));
        };
        if let (Some(user), Some(password)) = (&self.config.user, &self.config.password) {
            options = options.with_user(user.clone(), password.clone());
        };

        Client::connect(self.config.host.clone(), Some(options)).await
    }

    /// Runs `op` against a connected client, dropping the client on failure
    /// so the next call reconnects.
    async fn with_client<T, F, Fut>(&self, op: F) -> GatewayResult<T>
    where
        F: FnOnce(Client) -> Fut,
        Fut: std::future::Future<Output = Result<T, etcd_client::Error>>,
    {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            log::info!("Creating new etcd client...");
            let client = self.create_client().await.map_err(|e| {
                GatewayError::Unavailable(format!("etcd connect failed: {e}"))
            })?;
            *guard = Some(client);
        }
        // etcd_client::Client is cheaply cloneable; run the op outside the lock
        let client = guard.as_ref().cloned();
        drop(guard);

        match op(client.ok_or_else(|| {
            GatewayError::Unavailable("etcd client is not initialized".to_string())
        })?)
        .await
        {
            Ok(v) => Ok(v),
            Err(e) => {
                log::warn!("etcd operation failed, resetting client: {e}");
                *self.client.lock().await = None;
                Err(GatewayError::Unavailable(format!("etcd error: {e}")))
            }
        }
    }
}

#[async_trait]
impl MetaStore for EtcdStore {
    async fn list_clusters(&self) -> GatewayResult<ResultSet> {
        let prefix = self.clusters_prefix();
        let response = self
            .with_client(|mut client| async move {
                client
                    .get(prefix.as_bytes(), Some(GetOptions::new().with_prefix()))
                    .await
            })
            .await?;

        let mut records = Vec::new();
        for kv in response.kvs() {
            match serde_json::from_slice::<ClusterRecord>(kv.value()) {
                Ok(rec) => records.push(rec),
                Err(e) => {
                    log::warn!(
                        "Skipping malformed cluster record {:?}: {e}",
                        String::from_utf8_lossy(kv.key())
                    );
                }
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clusters_result_set(&records))
    }

    async fn get_cluster(&self, name: &str) -> GatewayResult<Option<ClusterRecord>> {
        let key = self.cluster_key(name);
        let response = self
            .with_client(|mut client| async move { client.get(key.as_bytes(), None).await })
            .await?;

        match response.kvs().first() {
            Some(kv) => {
                let rec = serde_json::from_slice::<ClusterRecord>(kv.value()).map_err(|e| {
                    GatewayError::Internal(format!("malformed cluster record {name}: {e}"))
                })?;
                Ok(Some(rec))
            }
            None => Ok(None),
        }
    }

    async fn version_colors(&self) -> GatewayResult<Vec<VersionColor>> {
        let key = self.colors_key();
        let response = self
            .with_client(|mut client| async move { client.get(key.as_bytes(), None).await })
            .await?;

        match response.kvs().first() {
            Some(kv) => serde_json::from_slice::<Vec<VersionColor>>(kv.value()).map_err(|e| {
                GatewayError::Internal(format!("malformed version color table: {e}"))
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn lease_get(&self, id: &str) -> GatewayResult<Option<VersionedLease>> {
        let key = self.lease_key(id);
        let response = self
            .with_client(|mut client| async move { client.get(key.as_bytes(), None).await })
            .await?;

        match response.kvs().first() {
            Some(kv) => {
                let record = serde_json::from_slice::<LeaseRecord>(kv.value()).map_err(|e| {
                    GatewayError::Internal(format!("malformed lease record {id}: {e}"))
                })?;
                Ok(Some(VersionedLease {
                    record,
                    revision: kv.mod_revision(),
                }))
            }
            None => Ok(None),
        }
    }

    async fn lease_put_if(
        &self,
        id: &str,
        expected: Option<i64>,
        record: &LeaseRecord,
    ) -> GatewayResult<bool> {
        let key = self.lease_key(id);
        let value = serde_json::to_vec(record)
            .map_err(|e| GatewayError::Internal(format!("lease encode failed: {e}")))?;

        let compare = match expected {
            // mod revision 0 means the key does not exist
            None => Compare::mod_revision(key.as_bytes(), CompareOp::Equal, 0),
            Some(rev) => Compare::mod_revision(key.as_bytes(), CompareOp::Equal, rev),
        };
        let txn = Txn::new()
            .when(vec![compare])
            .and_then(vec![TxnOp::put(key.as_bytes(), value, None)]);

        let response = self
            .with_client(|mut client| async move { client.txn(txn).await })
            .await?;
        Ok(response.succeeded())
    }
}
