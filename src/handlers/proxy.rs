//! Pass-through proxy to individual cluster hosts.
//!
//! Deep links into a node's monitoring UI go through the gateway so the
//! browser never needs direct reachability to the fleet. The upstream
//! answer is returned almost verbatim; redirects and HTML root links are
//! rewritten to stay under the `/proxy/host/` prefix.

use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use once_cell::sync::Lazy;
use regex::bytes::Regex as BytesRegex;
use regex::Regex;

use crate::core::error::{GatewayError, GatewayResult};
use crate::orchestrator::HttpAnswer;

use super::common::{inbound_token, outbound_headers};
use super::{AppState, GatewayRequest, Handler};

static HOST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.-]*(:[0-9]+)?$").unwrap());

/// Root-absolute href/src attributes in HTML bodies.
static LINK_RE: Lazy<BytesRegex> =
    Lazy::new(|| BytesRegex::new(r#"(?i)\b(href|src)="(/[^/"][^"]*|/)""#).unwrap());

/// End-to-end headers only; everything connection-scoped stays behind.
const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

pub struct ProxyHandler;

fn is_forwardable(name: &str) -> bool {
    !HOP_BY_HOP.contains(&name) && !name.starts_with("access-control-")
}

/// Rewrites an upstream redirect target back under the proxy prefix.
fn rewrite_location(location: &str, host: &str) -> String {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = location.strip_prefix(scheme) {
            let (target_host, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, "/"),
            };
            return format!("/proxy/host/{target_host}{path}");
        }
    }
    if location.starts_with('/') {
        return format!("/proxy/host/{host}{location}");
    }
    location.to_string()
}

/// Rewrites root-absolute links of an HTML body under the proxy prefix.
fn rewrite_html(body: &[u8], host: &str) -> Vec<u8> {
    let replacement = format!("$1=\"/proxy/host/{host}$2\"");
    LINK_RE
        .replace_all(body, replacement.as_bytes())
        .into_owned()
}

#[async_trait]
impl Handler for ProxyHandler {
    async fn handle(
        &self,
        state: Arc<AppState>,
        req: GatewayRequest,
    ) -> GatewayResult<HttpAnswer> {
        let host = req
            .params
            .get("host")
            .ok_or_else(|| GatewayError::BadRequest("missing host".to_string()))?
            .clone();
        if !HOST_RE.is_match(&host) {
            return Err(GatewayError::BadRequest(format!("malformed host {host:?}")));
        }
        let path = req.params.get("path").cloned().unwrap_or_default();
        let query = match req.uri.split_once('?') {
            Some((_, q)) => format!("?{q}"),
            None => String::new(),
        };
        let url = format!("http://{host}/{path}{query}");

        let mut headers = HeaderMap::new();
        for (name, value) in req.headers.iter() {
            if is_forwardable(name.as_str()) {
                headers.insert(name.clone(), value.clone());
            }
        }
        let auth = inbound_token(&req.headers);
        let forwarded = outbound_headers(&req.headers, auth.as_deref());
        for (name, value) in forwarded.iter() {
            headers.insert(name.clone(), value.clone());
        }

        let body = if req.body.is_empty() {
            None
        } else {
            Some(req.body.clone())
        };
        let response = state
            .http
            .request(req.method.clone(), &url, headers, body, state.proxy_timeout)
            .await?;

        let is_html = response.content_type.starts_with("text/html");
        let body = if is_html {
            rewrite_html(&response.body, &host)
        } else {
            response.body.to_vec()
        };

        let mut answer = HttpAnswer::new(response.status, &response.content_type, body);
        for (name, value) in response.headers.iter() {
            let name = name.as_str();
            if name == "content-type" || !is_forwardable(name) {
                continue;
            }
            let Ok(value) = value.to_str() else { continue };
            if name == "location" {
                answer
                    .headers
                    .push(("location".to_string(), rewrite_location(value, &host)));
            } else {
                answer.headers.push((name.to_string(), value.to_string()));
            }
        }
        answer
            .headers
            .push(("x-proxied-host".to_string(), host));
        Ok(answer)
    }
}
