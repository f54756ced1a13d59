//! Route handlers.
//!
//! Each route is a `Handler` dispatched by the HTTP service with the
//! shared application state and a captured request. Handlers return an
//! `HttpAnswer` or a `GatewayError`, which the service renders with its
//! mapped status and JSON body.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, Method};

use crate::cache::ownership::OwnershipCoordinator;
use crate::cache::ResponseCache;
use crate::client::control_plane::ControlPlane;
use crate::client::HttpClient;
use crate::core::error::GatewayResult;
use crate::orchestrator::HttpAnswer;
use crate::store::MetaStore;
use crate::tokens::TokenManager;

pub mod clusters;
pub mod common;
pub mod cp_databases;
pub mod database;
pub mod db_clusters;
pub mod get_config;
pub mod ping;
pub mod proxy;

/// Shared state every handler runs against.
pub struct AppState {
    pub store: Arc<dyn MetaStore>,
    pub tokens: Arc<TokenManager>,
    pub cache: Arc<ResponseCache>,
    pub ownership: Option<Arc<OwnershipCoordinator>>,
    pub http: HttpClient,
    pub control_plane: Arc<dyn ControlPlane>,
    pub request_timeout: Duration,
    pub phase_timeout: Duration,
    pub proxy_timeout: Duration,
}

/// A captured inbound request: everything a handler needs, detached from
/// the server session so background cache refreshes can replay it.
#[derive(Clone, Debug)]
pub struct GatewayRequest {
    pub method: Method,
    pub path: String,
    /// Path plus query, the cache key.
    pub uri: String,
    pub params: BTreeMap<String, String>,
    pub query: std::collections::HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        state: Arc<AppState>,
        req: GatewayRequest,
    ) -> GatewayResult<HttpAnswer>;
}
