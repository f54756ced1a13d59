use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use serde_json::json;

use crate::core::error::GatewayResult;
use crate::orchestrator::HttpAnswer;

use super::{AppState, GatewayRequest, Handler};

/// Fleet listing straight from the store, optionally filtered by name.
pub struct DbClustersHandler;

#[async_trait]
impl Handler for DbClustersHandler {
    async fn handle(
        &self,
        state: Arc<AppState>,
        req: GatewayRequest,
    ) -> GatewayResult<HttpAnswer> {
        let rs = state.store.list_clusters().await?;
        let mut rows = rs.rows_as_json();
        if let Some(name) = req.query.get("name") {
            rows.retain(|row| row.get("name").and_then(|n| n.as_str()) == Some(name.as_str()));
        }
        Ok(HttpAnswer::json(StatusCode::OK, &json!({ "clusters": rows })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing;
    use crate::store::memory::MemoryStore;
    use crate::store::ClusterRecord;

    fn store() -> MemoryStore {
        MemoryStore::with_clusters(vec![
            ClusterRecord {
                name: "beta".into(),
                balancer: "balancer.beta".into(),
                control_plane: None,
                description: None,
                location: Some("vla".into()),
            },
            ClusterRecord {
                name: "alpha".into(),
                balancer: "balancer.alpha".into(),
                control_plane: Some("grpcs://cp@cms.alpha:2135/console".into()),
                description: Some("primary".into()),
                location: None,
            },
        ])
    }

    #[tokio::test]
    async fn test_lists_all_clusters_sorted() {
        let state = testing::state(store());
        let answer = DbClustersHandler
            .handle(state, testing::get_request("/meta/db_clusters"))
            .await
            .unwrap();
        assert_eq!(answer.status, StatusCode::OK);
        let doc: serde_json::Value = serde_json::from_slice(&answer.body).unwrap();
        let clusters = doc["clusters"].as_array().unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0]["name"], json!("alpha"));
        assert_eq!(clusters[0]["description"], json!("primary"));
        assert_eq!(clusters[1]["name"], json!("beta"));
    }

    #[tokio::test]
    async fn test_name_filter() {
        let state = testing::state(store());
        let answer = DbClustersHandler
            .handle(state, testing::get_request("/meta/db_clusters?name=beta"))
            .await
            .unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&answer.body).unwrap();
        let clusters = doc["clusters"].as_array().unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0]["name"], json!("beta"));

        let state = testing::state(store());
        let answer = DbClustersHandler
            .handle(state, testing::get_request("/meta/db_clusters?name=nope"))
            .await
            .unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&answer.body).unwrap();
        assert!(doc["clusters"].as_array().unwrap().is_empty());
    }
}
