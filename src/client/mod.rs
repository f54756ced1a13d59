//! Outbound HTTP plumbing.
//!
//! A thin wrapper over reqwest that applies per-call timeouts and maps
//! transport failures onto the gateway error classes, plus the endpoint
//! notation used by cluster records. JSON GETs to peers run through their
//! own response cache, keyed by URL, so a hot fleet endpoint is not
//! re-fetched for every inbound request.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde_json::Value;

use crate::cache::{Freshness, ResponseCache};
use crate::core::error::{GatewayError, GatewayResult};

pub mod control_plane;

/// A cracked `scheme://token-name@host/path?args` endpoint string: the
/// wire target, the name of the token to authenticate with, and the URL
/// path to call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub endpoint: String,
    pub token_name: String,
    pub url: String,
}

/// Split an endpoint string into target, token name and path.
pub fn crack_endpoint(raw: &str) -> Endpoint {
    let (scheme, rest) = match raw.split_once("://") {
        Some((s, r)) => (Some(s), r),
        None => (None, raw),
    };
    let (token_name, rest) = match rest.split_once('@') {
        Some((t, r)) => (t.to_string(), r),
        None => (String::new(), rest),
    };
    let (host, url) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, String::new()),
    };
    let endpoint = match scheme {
        Some(scheme) => format!("{scheme}://{host}"),
        None => host.to_string(),
    };
    Endpoint {
        endpoint,
        token_name,
        url,
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn json(&self) -> GatewayResult<Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| GatewayError::Internal(format!("invalid JSON from peer: {e}")))
    }
}

/// Shared outbound HTTP client. Timeouts are per call; redirects are not
/// followed so the host proxy can rewrite them.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    cache: Arc<ResponseCache>,
}

impl HttpClient {
    pub fn new() -> GatewayResult<Self> {
        Self::with_cache(Arc::new(ResponseCache::new(&[])))
    }

    /// Client whose JSON GETs run through `cache`, with policies matched
    /// by URL prefix.
    pub fn with_cache(cache: Arc<ResponseCache>) -> GatewayResult<Self> {
        let inner = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Configuration(format!("http client init failed: {e}")))?;
        Ok(Self { inner, cache })
    }

    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> GatewayResult<HttpResponse> {
        let mut builder = self
            .inner
            .request(method, url)
            .headers(headers)
            .timeout(timeout);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let content_type = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = response.bytes().await.map_err(map_transport_error)?;

        Ok(HttpResponse {
            status,
            content_type,
            headers,
            body,
        })
    }

    /// GET returning the parsed JSON body; non-2xx statuses map to errors.
    /// URLs with a cache policy are served with stale-while-revalidate
    /// semantics; the rest go straight to the wire.
    pub async fn get_json(
        &self,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
    ) -> GatewayResult<Value> {
        let Some(policy) = self.cache.policy_for(url).cloned() else {
            return self.fetch_json(url, headers, timeout).await;
        };

        if let Some((entry, freshness)) = self.cache.lookup(url, &policy) {
            if freshness == Freshness::Stale {
                let client = self.clone();
                let url = url.to_string();
                tokio::spawn(async move {
                    if let Err(e) = client.refresh_json(&url, headers, timeout, &policy).await {
                        log::warn!("background refresh of peer {url} failed: {e}");
                    }
                });
            }
            return parse_cached(&entry.body);
        }

        match self.refresh_json(url, headers, timeout, &policy).await {
            Ok(doc) => Ok(doc),
            Err(e) => {
                if policy.keep_on_error {
                    if let Some(entry) = self.cache.peek(url) {
                        log::warn!("peer {url} failed, serving retained entry: {e}");
                        return parse_cached(&entry.body);
                    }
                }
                Err(e)
            }
        }
    }

    /// One cache-filling fetch: store the body on success, evict the entry
    /// on failure unless the policy retains it.
    async fn refresh_json(
        &self,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
        policy: &crate::cache::CachePolicy,
    ) -> GatewayResult<Value> {
        let response = match self.request(Method::GET, url, headers, None, timeout).await {
            Ok(response) if response.status.is_success() => response,
            Ok(response) => {
                if !policy.keep_on_error {
                    self.cache.evict(url);
                }
                return Err(error_for_status(response.status, &response.body));
            }
            Err(e) => {
                if !policy.keep_on_error {
                    self.cache.evict(url);
                }
                return Err(e);
            }
        };
        let doc = response.json()?;
        self.cache.store(
            url,
            response.status,
            &response.content_type,
            response.body.clone(),
        );
        Ok(doc)
    }

    async fn fetch_json(
        &self,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
    ) -> GatewayResult<Value> {
        let response = self
            .request(Method::GET, url, headers, None, timeout)
            .await?;
        if !response.status.is_success() {
            return Err(error_for_status(response.status, &response.body));
        }
        response.json()
    }

    /// POST a JSON payload, returning the parsed JSON body.
    pub async fn post_json(
        &self,
        url: &str,
        mut headers: HeaderMap,
        payload: &Value,
        timeout: Duration,
    ) -> GatewayResult<Value> {
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        let body = serde_json::to_vec(payload)
            .map_err(|e| GatewayError::Internal(format!("payload encode failed: {e}")))?;
        let response = self
            .request(Method::POST, url, headers, Some(body), timeout)
            .await?;
        if !response.status.is_success() {
            return Err(error_for_status(response.status, &response.body));
        }
        response.json()
    }
}

fn parse_cached(body: &Bytes) -> GatewayResult<Value> {
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::Internal(format!("invalid JSON in cache: {e}")))
}

fn map_transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(format!("peer call timed out: {err}"))
    } else {
        GatewayError::Unavailable(format!("peer unreachable: {err}"))
    }
}

/// Map a non-2xx peer status onto the gateway error classes.
pub fn error_for_status(status: StatusCode, body: &[u8]) -> GatewayError {
    let message = String::from_utf8_lossy(body);
    let message = if message.trim().is_empty() {
        format!("peer returned {status}")
    } else {
        format!("peer returned {status}: {}", message.trim())
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Unauthorized(message),
        StatusCode::NOT_FOUND => GatewayError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => GatewayError::Overloaded(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            GatewayError::Timeout(message)
        }
        s if s.is_client_error() => GatewayError::BadRequest(message),
        _ => GatewayError::Unavailable(message),
    }
}
