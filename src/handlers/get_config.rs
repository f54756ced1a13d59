use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use serde_json::{json, Value};

use crate::core::error::GatewayResult;
use crate::orchestrator::{Decision, HttpAnswer, Orchestrator, Phase};

use super::common::{control_endpoint, control_plane_call, lookup_cluster, resolve_auth, Parameters};
use super::{AppState, GatewayRequest, Handler};

/// Fetches a cluster's control-plane configuration document.
pub struct GetConfigHandler;

#[async_trait]
impl Handler for GetConfigHandler {
    async fn handle(
        &self,
        state: Arc<AppState>,
        req: GatewayRequest,
    ) -> GatewayResult<HttpAnswer> {
        let params = Parameters::from_request(&req)?;
        let cluster = lookup_cluster(&state, &params).await?;
        let target = control_endpoint(&cluster)?;
        let auth = resolve_auth(&req.headers, &state.tokens, &target.token_name);

        let orch = Orchestrator::new(state.request_timeout, state.phase_timeout);
        let call = control_plane_call(&state, target, auth, "GetConfig", json!({}));
        let answer = orch
            .run(Phase::new(vec![call]), |mut results| {
                Decision::Finish(match results.remove(0).and_then(|op| op.into_result()) {
                    Ok(op) => {
                        HttpAnswer::json(StatusCode::OK, &op.result.unwrap_or(Value::Null))
                    }
                    Err(e) => HttpAnswer::error(&e),
                })
            })
            .await;
        Ok(answer)
    }
}
