use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;

use crate::core::error::GatewayResult;
use crate::orchestrator::HttpAnswer;

use super::{AppState, GatewayRequest, Handler};

/// Liveness check. Answers without touching any dependency.
pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(
        &self,
        _state: Arc<AppState>,
        req: GatewayRequest,
    ) -> GatewayResult<HttpAnswer> {
        Ok(HttpAnswer::text(StatusCode::OK, &format!("ok {}", req.path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn test_ping() {
        let state = testing::state(MemoryStore::default());
        let answer = PingHandler
            .handle(state, testing::get_request("/ping"))
            .await
            .unwrap();
        assert_eq!(answer.status, StatusCode::OK);
        assert_eq!(answer.body, b"ok /ping");
    }
}
