//! Database lifecycle operations.
//!
//! One handler per control-plane method; all share the same shape. The
//! request body is forwarded as the operation payload after local
//! validation, the call is retried while the upstream reports the
//! database as still propagating, and the operation envelope comes back
//! to the caller verbatim on success.

use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use serde_json::{json, Value};

use crate::core::error::{GatewayError, GatewayResult};
use crate::orchestrator::{Decision, HttpAnswer, Orchestrator, Phase};

use super::common::{
    control_endpoint, control_plane_call, is_valid_database_id, lookup_cluster, resolve_auth,
    Parameters,
};
use super::{AppState, GatewayRequest, Handler};

pub struct DatabaseOpHandler {
    method: &'static str,
    /// Whether the payload must carry a well-formed `databaseId`.
    requires_database_id: bool,
}

impl DatabaseOpHandler {
    pub fn create() -> Self {
        Self {
            method: "CreateDatabase",
            requires_database_id: false,
        }
    }

    pub fn update() -> Self {
        Self {
            method: "UpdateDatabase",
            requires_database_id: true,
        }
    }

    pub fn delete() -> Self {
        Self {
            method: "DeleteDatabase",
            requires_database_id: true,
        }
    }

    pub fn start() -> Self {
        Self {
            method: "StartDatabase",
            requires_database_id: true,
        }
    }

    pub fn stop() -> Self {
        Self {
            method: "StopDatabase",
            requires_database_id: true,
        }
    }
}

#[async_trait]
impl Handler for DatabaseOpHandler {
    async fn handle(
        &self,
        state: Arc<AppState>,
        req: GatewayRequest,
    ) -> GatewayResult<HttpAnswer> {
        let params = Parameters::from_request(&req)?;

        // Validate everything locally before any upstream call goes out.
        let cluster = lookup_cluster(&state, &params).await?;
        let target = control_endpoint(&cluster)?;
        if self.requires_database_id {
            let id = params.require("databaseId")?;
            if !is_valid_database_id(&id) {
                return Err(GatewayError::BadRequest(format!(
                    "malformed databaseId {id:?}"
                )));
            }
        }

        let auth = resolve_auth(&req.headers, &state.tokens, &target.token_name);
        let payload = params.body().cloned().unwrap_or_else(|| json!({}));

        let orch = Orchestrator::new(state.request_timeout, state.phase_timeout);
        let call = control_plane_call(&state, target, auth, self.method, payload);
        let answer = orch
            .run(Phase::new(vec![call]), |mut results| {
                Decision::Finish(match results.remove(0).and_then(|op| op.into_result()) {
                    Ok(op) => HttpAnswer::json(StatusCode::OK, &op),
                    Err(e) => HttpAnswer::error(&e),
                })
            })
            .await;
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::control_plane::Operation;
    use crate::handlers::testing::{self, StubControlPlane};
    use crate::store::memory::MemoryStore;
    use crate::store::ClusterRecord;

    fn store() -> MemoryStore {
        MemoryStore::with_clusters(vec![ClusterRecord {
            name: "alpha".into(),
            balancer: "balancer.alpha".into(),
            control_plane: Some("grpcs://cp@cms.alpha:2135/console".into()),
            description: None,
            location: None,
        }])
    }

    fn operation(doc: Value) -> Operation {
        serde_json::from_value(doc).unwrap()
    }

    #[tokio::test]
    async fn test_create_forwards_operation_envelope() {
        let stub = Arc::new(StubControlPlane::new());
        stub.respond(
            "CreateDatabase",
            operation(json!({"ready": true, "status": "SUCCESS", "result": {"id": "etn42"}})),
        );
        let state = testing::state_with(store(), stub);
        let req = testing::post_request(
            "/meta/create_database",
            br#"{"cluster_name": "alpha", "resources": {"storage_units": 1}}"#,
            "application/json",
        );
        let answer = DatabaseOpHandler::create().handle(state, req).await.unwrap();
        assert_eq!(answer.status, StatusCode::OK);
        let doc: Value = serde_json::from_slice(&answer.body).unwrap();
        assert_eq!(doc["status"], json!("SUCCESS"));
        assert_eq!(doc["result"]["id"], json!("etn42"));
    }

    #[tokio::test]
    async fn test_update_rejects_malformed_database_id() {
        let stub = Arc::new(StubControlPlane::new());
        let state = testing::state_with(store(), stub.clone());
        let req = testing::post_request(
            "/meta/update_database",
            br#"{"cluster_name": "alpha", "databaseId": "not a valid id!"}"#,
            "application/json",
        );
        let err = DatabaseOpHandler::update().handle(state, req).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        // rejected before anything went upstream
        assert!(stub.calls.is_empty());
    }

    #[tokio::test]
    async fn test_validation_precedes_upstream_call() {
        let stub = Arc::new(StubControlPlane::new());
        let state = testing::state_with(store(), stub.clone());
        let req = testing::post_request(
            "/meta/delete_database",
            br#"{"databaseId": "etn42"}"#,
            "application/json",
        );
        let err = DatabaseOpHandler::delete().handle(state, req).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(stub.calls.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_propagation_failure_retried_then_reported() {
        let stub = Arc::new(StubControlPlane::new());
        stub.respond(
            "StartDatabase",
            operation(json!({
                "status": "GENERIC_ERROR",
                "issues": [{"message": "database unknown"}]
            })),
        );
        let state = testing::state_with(store(), stub.clone());
        let req = testing::post_request(
            "/meta/start_database",
            br#"{"cluster_name": "alpha", "databaseId": "etn42"}"#,
            "application/json",
        );
        let answer = DatabaseOpHandler::start().handle(state, req).await.unwrap();
        // propagation errors map like generic upstream failures once retries run out
        assert_eq!(answer.status, StatusCode::BAD_REQUEST);
        let attempts = stub.calls.get("StartDatabase").map(|c| *c).unwrap_or(0);
        assert!(attempts > 1, "expected retries, saw {attempts} attempts");
    }

    #[tokio::test]
    async fn test_failed_operation_maps_status() {
        let stub = Arc::new(StubControlPlane::new());
        stub.respond(
            "StopDatabase",
            operation(json!({
                "status": "NOT_FOUND",
                "issues": [{"message": "no such database"}]
            })),
        );
        let state = testing::state_with(store(), stub);
        let req = testing::post_request(
            "/meta/stop_database",
            br#"{"cluster_name": "alpha", "databaseId": "etn42"}"#,
            "application/json",
        );
        let answer = DatabaseOpHandler::stop().handle(state, req).await.unwrap();
        assert_eq!(answer.status, StatusCode::NOT_FOUND);
        let doc: Value = serde_json::from_slice(&answer.body).unwrap();
        assert!(doc["message"].as_str().unwrap().contains("no such database"));
    }
}
