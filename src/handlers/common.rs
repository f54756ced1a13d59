//! Shared handler plumbing: request parameters, auth forwarding, cluster
//! lookup and endpoint construction.

use std::sync::Arc;

use http::{HeaderMap, HeaderValue};
use serde_json::Value;
use uuid::Uuid;

use crate::client::control_plane::Operation;
use crate::client::{crack_endpoint, Endpoint};
use crate::core::error::{GatewayError, GatewayResult};
use crate::orchestrator::{Call, CallError, RetryPolicy};
use crate::store::ClusterRecord;
use crate::tokens::TokenManager;
use crate::utils::request::get_header_value;

use super::{AppState, GatewayRequest};

/// Caller identity forwarded when no `Authorization` header is present.
pub const SUBJECT_TOKEN_HEADER: &str = "x-subject-token";
/// Database-native auth ticket header, mirrored alongside the bearer form.
pub const DB_TICKET_HEADER: &str = "x-db-auth-ticket";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const DEFAULT_VIEWER_PORT: &str = "8765";
const DEFAULT_VIEWER_PATH: &str = "/viewer";

/// Request parameters: URL query merged over the JSON body, URL winning.
pub struct Parameters {
    query: std::collections::HashMap<String, String>,
    body: Option<Value>,
}

impl Parameters {
    /// Parse parameters from the query string plus, for JSON requests, the
    /// body document. A malformed body is a client error.
    pub fn from_request(req: &GatewayRequest) -> GatewayResult<Self> {
        let body = if req.body.is_empty() {
            None
        } else {
            let is_json = get_header_value(&req.headers, "content-type")
                .map(|ct| ct.starts_with("application/json"))
                .unwrap_or(false);
            if !is_json {
                return Err(GatewayError::BadRequest(
                    "Content-Type must be application/json".to_string(),
                ));
            }
            Some(serde_json::from_slice::<Value>(&req.body)?)
        };
        Ok(Self {
            query: req.query.clone(),
            body,
        })
    }

    pub fn get(&self, name: &str) -> Option<String> {
        if let Some(value) = self.query.get(name) {
            return Some(value.clone());
        }
        match self.body.as_ref()?.get(name)? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn require(&self, name: &str) -> GatewayResult<String> {
        self.get(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::BadRequest(format!("missing parameter {name}")))
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }
}

/// Bearer token carried by the inbound request, from the `Authorization`
/// header (`Bearer` or `OAuth` scheme) or the subject-token header.
pub fn inbound_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = get_header_value(headers, "authorization") {
        for scheme in ["Bearer ", "OAuth "] {
            if auth.len() > scheme.len() && auth[..scheme.len()].eq_ignore_ascii_case(scheme) {
                return Some(auth[scheme.len()..].trim().to_string());
            }
        }
    }
    get_header_value(headers, SUBJECT_TOKEN_HEADER).map(|t| t.to_string())
}

/// Token to authenticate an outbound call with: the caller's own token
/// first, else the named service token. Exactly one scheme is forwarded.
pub fn resolve_auth(
    headers: &HeaderMap,
    tokens: &TokenManager,
    token_name: &str,
) -> Option<String> {
    if let Some(token) = inbound_token(headers) {
        return Some(token);
    }
    if token_name.is_empty() {
        return None;
    }
    let token = tokens.get_token(token_name);
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Headers for an outbound peer call: bearer auth, the mirrored database
/// ticket, and the correlation id (propagated from the inbound request or
/// freshly minted).
pub fn outbound_headers(inbound: &HeaderMap, auth: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(token) = auth {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(http::header::AUTHORIZATION, value);
        }
        if let Ok(value) = HeaderValue::from_str(token) {
            headers.insert(DB_TICKET_HEADER, value);
        }
    }
    let request_id = get_header_value(inbound, REQUEST_ID_HEADER)
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    headers
}

/// Database ids are short alphanumeric handles; anything else is rejected
/// before it reaches an upstream.
pub fn is_valid_database_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 20 && id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Data-plane viewer URL of a cluster balancer: scheme, default port and
/// viewer path are filled in when the address omits them.
pub fn api_url(balancer: &str) -> String {
    let (scheme, rest) = match balancer.split_once("://") {
        Some((s, r)) => (s, r),
        None => ("http", balancer),
    };
    // viewer speaks http(s) regardless of the balancer's wire scheme
    let scheme = if scheme == "grpcs" || scheme == "https" {
        "https"
    } else {
        "http"
    };
    let (host, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let host_with_port = if host.rsplit(':').next().map(|p| p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty()).unwrap_or(false)
        && host.contains(':')
    {
        host.to_string()
    } else {
        format!("{host}:{DEFAULT_VIEWER_PORT}")
    };
    let path = if path.is_empty() {
        DEFAULT_VIEWER_PATH
    } else {
        path
    };
    format!("{scheme}://{host_with_port}{path}")
}

/// Look up the cluster named by `cluster_name`; missing parameter is a
/// client error, unknown cluster a 404.
pub async fn lookup_cluster(
    state: &AppState,
    params: &Parameters,
) -> GatewayResult<ClusterRecord> {
    let name = params.require("cluster_name")?;
    state
        .store
        .get_cluster(&name)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("unknown cluster {name}")))
}

/// Control-plane endpoint of a cluster record.
pub fn control_endpoint(cluster: &ClusterRecord) -> GatewayResult<Endpoint> {
    let raw = cluster.control_plane.as_deref().ok_or_else(|| {
        GatewayError::BadRequest(format!(
            "cluster {} has no control plane endpoint",
            cluster.name
        ))
    })?;
    Ok(crack_endpoint(raw))
}

/// A control-plane invocation as an orchestrated call. Transport failures
/// and operations still propagating upstream count as transient; every
/// other failure is final.
pub fn control_plane_call(
    state: &Arc<AppState>,
    target: Endpoint,
    auth: Option<String>,
    method: &str,
    payload: Value,
) -> Call<Operation> {
    let control_plane = state.control_plane.clone();
    let timeout = state.phase_timeout;
    let method_name = method.to_string();
    Call::new(method, RetryPolicy::Transient, move || {
        let control_plane = control_plane.clone();
        let target = target.clone();
        let auth = auth.clone();
        let method = method_name.clone();
        let payload = payload.clone();
        Box::pin(async move {
            let outcome = control_plane
                .call(&target, auth.as_deref(), &method, payload, timeout)
                .await;
            match outcome {
                Ok(op) if op.is_retryable() => match op.into_result() {
                    Err(e) => Err(CallError::transient(e)),
                    Ok(op) => Ok(op),
                },
                Ok(op) => Ok(op),
                Err(e @ (GatewayError::Unavailable(_) | GatewayError::Timeout(_))) => {
                    Err(CallError::transient(e))
                }
                Err(e) => Err(CallError::terminal(e)),
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_token_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(SUBJECT_TOKEN_HEADER, HeaderValue::from_static("subject"));
        assert_eq!(inbound_token(&headers), Some("subject".to_string()));

        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer primary"),
        );
        assert_eq!(inbound_token(&headers), Some("primary".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("OAuth legacy"),
        );
        assert_eq!(inbound_token(&headers), Some("legacy".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcg=="),
        );
        assert_eq!(inbound_token(&headers), None);
    }

    #[test]
    fn test_outbound_headers_mirror_ticket_and_request_id() {
        let mut inbound = HeaderMap::new();
        inbound.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-7"));
        let headers = outbound_headers(&inbound, Some("tok"));
        assert_eq!(headers.get("authorization").unwrap(), "Bearer tok");
        assert_eq!(headers.get(DB_TICKET_HEADER).unwrap(), "tok");
        assert_eq!(headers.get(REQUEST_ID_HEADER).unwrap(), "req-7");

        // a fresh id is minted when the caller sent none
        let headers = outbound_headers(&HeaderMap::new(), None);
        assert!(headers.get("authorization").is_none());
        assert!(!headers.get(REQUEST_ID_HEADER).unwrap().is_empty());
    }

    #[test]
    fn test_is_valid_database_id() {
        assert!(is_valid_database_id("etn0123abc"));
        assert!(!is_valid_database_id(""));
        assert!(!is_valid_database_id("has space"));
        assert!(!is_valid_database_id("etn0123-abc"));
        assert!(!is_valid_database_id(&"x".repeat(21)));
    }

    #[test]
    fn test_api_url_defaults() {
        assert_eq!(api_url("balancer.a"), "http://balancer.a:8765/viewer");
        assert_eq!(
            api_url("grpcs://balancer.a:2135"),
            "https://balancer.a:2135/viewer"
        );
        assert_eq!(
            api_url("http://balancer.a:8765/custom"),
            "http://balancer.a:8765/custom"
        );
    }

    #[test]
    fn test_parameters_url_wins_over_body() {
        let mut req = crate::handlers::testing::post_request(
            "/meta/config?cluster_name=from-url",
            br#"{"cluster_name": "from-body", "databaseId": "db1"}"#,
            "application/json",
        );
        req.query = crate::utils::request::query_map(Some("cluster_name=from-url"));
        let params = Parameters::from_request(&req).unwrap();
        assert_eq!(params.get("cluster_name"), Some("from-url".to_string()));
        assert_eq!(params.get("databaseId"), Some("db1".to_string()));
        assert!(params.get("missing").is_none());
        assert!(params.require("missing").is_err());
    }

    #[test]
    fn test_parameters_reject_bad_body() {
        let req = crate::handlers::testing::post_request(
            "/meta/create_database",
            b"not json",
            "application/json",
        );
        assert!(Parameters::from_request(&req).is_err());

        let req = crate::handlers::testing::post_request(
            "/meta/create_database",
            br#"{"cluster_name": "a"}"#,
            "text/plain",
        );
        assert!(Parameters::from_request(&req).is_err());
    }
}
