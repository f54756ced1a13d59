//! Gateway HTTP frontend.
//!
//! One `ServeHttp` app serves every route. The request is captured off
//! the session first so handlers run against plain data; the dispatch
//! path then applies the per-route response cache with stale-while-
//! revalidate semantics and the overall request deadline.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Response, StatusCode};
use matchit::{Match, Router};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};

use crate::cache::ownership::RefreshDirective;
use crate::cache::{CachePolicy, CachedResponse, Freshness};
use crate::core::error::GatewayError;
use crate::handlers::{
    clusters::ClustersHandler,
    common::{outbound_headers, REQUEST_ID_HEADER},
    cp_databases::CpDatabasesHandler,
    database::DatabaseOpHandler,
    db_clusters::DbClustersHandler,
    get_config::GetConfigHandler,
    ping::PingHandler,
    proxy::ProxyHandler,
    AppState, GatewayRequest, Handler,
};
use crate::orchestrator::HttpAnswer;
use crate::utils::request::{get_header_value, query_map};

pub struct GatewayHttpApp {
    state: Arc<AppState>,
    router: Router<HashMap<Method, Arc<dyn Handler>>>,
}

impl GatewayHttpApp {
    pub fn new(state: Arc<AppState>) -> Self {
        let mut this = Self {
            state,
            router: Router::new(),
        };

        this.route("/ping", Method::GET, Arc::new(PingHandler))
            .route("/meta/db_clusters", Method::GET, Arc::new(DbClustersHandler))
            .route("/meta/clusters", Method::GET, Arc::new(ClustersHandler))
            .route(
                "/meta/cp_databases",
                Method::GET,
                Arc::new(CpDatabasesHandler),
            )
            .route("/meta/config", Method::GET, Arc::new(GetConfigHandler))
            .route(
                "/meta/create_database",
                Method::POST,
                Arc::new(DatabaseOpHandler::create()),
            )
            .route(
                "/meta/update_database",
                Method::POST,
                Arc::new(DatabaseOpHandler::update()),
            )
            .route(
                "/meta/delete_database",
                Method::POST,
                Arc::new(DatabaseOpHandler::delete()),
            )
            .route(
                "/meta/start_database",
                Method::POST,
                Arc::new(DatabaseOpHandler::start()),
            )
            .route(
                "/meta/stop_database",
                Method::POST,
                Arc::new(DatabaseOpHandler::stop()),
            );

        let proxy: Arc<dyn Handler> = Arc::new(ProxyHandler);
        for method in [
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ] {
            this.route("/proxy/host/{host}/{*path}", method, proxy.clone());
        }

        this
    }

    fn route(&mut self, path: &str, method: Method, handler: Arc<dyn Handler>) -> &mut Self {
        if self.router.at(path).is_err() {
            let mut handlers = HashMap::new();
            handlers.insert(method, handler);
            self.router.insert(path, handlers).unwrap();
        } else {
            let routes = self.router.at_mut(path).unwrap();
            routes.value.insert(method, handler);
        }
        self
    }

    pub fn http_service(state: Arc<AppState>) -> Service<Self> {
        Service::new("Gateway HTTP".to_string(), Self::new(state))
    }

    async fn dispatch(&self, handler: Arc<dyn Handler>, req: GatewayRequest) -> HttpAnswer {
        let deadline = self.state.request_timeout;
        match tokio::time::timeout(deadline, self.dispatch_cached(handler, req)).await {
            Ok(answer) => answer,
            Err(_) => HttpAnswer::gateway_timeout(),
        }
    }

    /// Cache-aware dispatch. Only GETs with a configured policy touch the
    /// cache; everything else runs the handler directly.
    async fn dispatch_cached(&self, handler: Arc<dyn Handler>, req: GatewayRequest) -> HttpAnswer {
        let policy = if req.method == Method::GET {
            self.state.cache.policy_for(&req.path).cloned()
        } else {
            None
        };
        let Some(policy) = policy else {
            return run_handler(self.state.clone(), handler, req).await;
        };

        let key = req.uri.clone();
        if let Some((entry, freshness)) = self.state.cache.lookup(&key, &policy) {
            if freshness == Freshness::Stale {
                // serve stale, refresh behind the response
                let state = self.state.clone();
                let handler = handler.clone();
                let req = req.clone();
                tokio::spawn(async move {
                    refresh_entry(state, handler, req, policy).await;
                });
            }
            return cached_answer(&entry);
        }

        // cache miss: fill synchronously so the caller gets a live answer
        match fetch_fresh(self.state.clone(), handler, req, &policy).await {
            Ok(answer) => answer,
            Err(e) => {
                if policy.keep_on_error {
                    if let Some(entry) = self.state.cache.peek(&key) {
                        log::warn!("refresh of {key} failed, serving retained entry: {e}");
                        return cached_answer(&entry);
                    }
                }
                HttpAnswer::error(&e)
            }
        }
    }
}

fn cached_answer(entry: &CachedResponse) -> HttpAnswer {
    HttpAnswer::new(entry.status, &entry.content_type, entry.body.to_vec())
}

async fn run_handler(
    state: Arc<AppState>,
    handler: Arc<dyn Handler>,
    req: GatewayRequest,
) -> HttpAnswer {
    match handler.handle(state, req).await {
        Ok(answer) => answer,
        Err(e) => HttpAnswer::error(&e),
    }
}

/// Produce a fresh answer for a cacheable request and store it. When the
/// fleet runs several instances, the lease decides who actually refreshes;
/// a non-owner fetches the owner's copy instead.
async fn fetch_fresh(
    state: Arc<AppState>,
    handler: Arc<dyn Handler>,
    req: GatewayRequest,
    policy: &CachePolicy,
) -> Result<HttpAnswer, GatewayError> {
    let key = req.uri.clone();

    if let Some(ownership) = &state.ownership {
        if let RefreshDirective::Forward(owner) = ownership.coordinate(&key).await {
            match fetch_from_owner(&state, &req, &owner).await {
                Ok(answer) => {
                    if answer.status == StatusCode::OK {
                        state.cache.store(
                            &key,
                            answer.status,
                            &answer.content_type,
                            Bytes::from(answer.body.clone()),
                        );
                    }
                    return Ok(answer);
                }
                Err(e) => {
                    log::warn!("owner {owner} unreachable for {key}, refreshing locally: {e}");
                }
            }
        }
    }

    let answer = match handler.handle(state.clone(), req).await {
        Ok(answer) => answer,
        Err(e) => {
            // without keep_on_error a failed refresh drops the entry
            if !policy.keep_on_error {
                state.cache.evict(&key);
            }
            return Err(e);
        }
    };
    if answer.status == StatusCode::OK {
        state.cache.store(
            &key,
            answer.status,
            &answer.content_type,
            Bytes::from(answer.body.clone()),
        );
    } else if !policy.keep_on_error {
        state.cache.evict(&key);
    }
    Ok(answer)
}

async fn fetch_from_owner(
    state: &AppState,
    req: &GatewayRequest,
    owner: &str,
) -> Result<HttpAnswer, GatewayError> {
    let url = format!("{}{}", owner.trim_end_matches('/'), req.uri);
    let headers = outbound_headers(&req.headers, None);
    let response = state
        .http
        .request(Method::GET, &url, headers, None, state.request_timeout)
        .await?;
    Ok(HttpAnswer::new(
        response.status,
        &response.content_type,
        response.body.to_vec(),
    ))
}

/// Background stale-entry refresh.
async fn refresh_entry(
    state: Arc<AppState>,
    handler: Arc<dyn Handler>,
    req: GatewayRequest,
    policy: CachePolicy,
) {
    let key = req.uri.clone();
    match fetch_fresh(state, handler, req, &policy).await {
        Ok(_) => log::debug!("background refresh of {key} done"),
        Err(e) => {
            if policy.keep_on_error {
                log::warn!("background refresh of {key} failed, keeping stale entry: {e}");
            } else {
                log::warn!("background refresh of {key} failed, entry dropped: {e}");
            }
        }
    }
}

#[async_trait]
impl ServeHttp for GatewayHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        let (method, path, uri, query, headers) = {
            let req_header = http_session.req_header();
            (
                req_header.method.clone(),
                req_header.uri.path().to_string(),
                req_header
                    .uri
                    .path_and_query()
                    .map(|pq| pq.to_string())
                    .unwrap_or_else(|| req_header.uri.path().to_string()),
                query_map(req_header.uri.query()),
                req_header.headers.clone(),
            )
        };

        let (handler, params) = match self.router.at(&path) {
            Ok(Match { value, params }) => match value.get(&method) {
                Some(handler) => {
                    let params: BTreeMap<String, String> = params
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect();
                    (handler.clone(), params)
                }
                None => {
                    return HttpAnswer::error(&GatewayError::BadRequest(format!(
                        "method {method} not allowed for {path}"
                    )))
                    .into_response()
                }
            },
            Err(_) => {
                return HttpAnswer::error(&GatewayError::NotFound(format!("no route for {path}")))
                    .into_response()
            }
        };

        let body = match read_request_body(http_session).await {
            Ok(body) => body,
            Err(e) => {
                return HttpAnswer::error(&GatewayError::BadRequest(format!(
                    "failed to read request body: {e}"
                )))
                .into_response()
            }
        };

        let request_id = get_header_value(&headers, REQUEST_ID_HEADER)
            .unwrap_or("-")
            .to_string();
        let req = GatewayRequest {
            method: method.clone(),
            path: path.clone(),
            uri,
            params,
            query,
            headers,
            body,
        };
        let answer = self.dispatch(handler, req).await;
        log::info!(
            method:% = method,
            status = answer.status.as_u16(),
            request_id;
            "handled {path}"
        );
        answer.into_response()
    }
}

async fn read_request_body(
    http_session: &mut ServerSession,
) -> pingora_error::Result<Vec<u8>> {
    let mut body_data = Vec::new();
    while let Some(bytes) = http_session.read_request_body().await? {
        body_data.extend_from_slice(&bytes);
    }
    Ok(body_data)
}
