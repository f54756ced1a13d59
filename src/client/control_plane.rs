//! Control-plane RPC collaborator.
//!
//! Cluster management calls go to the endpoint named by the cluster row
//! and come back as long-running `Operation` envelopes: a status code, a
//! tree of issues, and optional result and metadata documents. The
//! `ControlPlane` trait is the seam; the shipped implementation speaks
//! JSON over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{GatewayError, GatewayResult};

use super::{Endpoint, HttpClient};

/// Issue markers the upstream emits while a freshly created database is
/// still propagating; operations failing with one of these are retried.
pub const RETRYABLE_ISSUE_MARKERS: [&str; 2] = ["database unknown", "#200802"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Success,
    Unauthorized,
    BadRequest,
    SchemeError,
    GenericError,
    PreconditionFailed,
    AlreadyExists,
    NotFound,
    Unsupported,
    Overloaded,
    InternalError,
    Unavailable,
    Timeout,
    Cancelled,
    Undetermined,
    #[serde(other)]
    StatusCodeUnspecified,
}

impl OperationStatus {
    pub fn is_success(self) -> bool {
        self == OperationStatus::Success
    }

    /// HTTP status an operation outcome renders as.
    pub fn http_status(self) -> StatusCode {
        match self {
            OperationStatus::Success => StatusCode::OK,
            OperationStatus::Unauthorized => StatusCode::UNAUTHORIZED,
            OperationStatus::BadRequest
            | OperationStatus::SchemeError
            | OperationStatus::GenericError
            | OperationStatus::PreconditionFailed
            | OperationStatus::AlreadyExists
            | OperationStatus::Unsupported => StatusCode::BAD_REQUEST,
            OperationStatus::NotFound => StatusCode::NOT_FOUND,
            OperationStatus::Overloaded => StatusCode::TOO_MANY_REQUESTS,
            OperationStatus::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            OperationStatus::Timeout => StatusCode::GATEWAY_TIMEOUT,
            OperationStatus::Unavailable
            | OperationStatus::Cancelled
            | OperationStatus::Undetermined
            | OperationStatus::StatusCodeUnspecified => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Issue {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_code: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<Issue>,
}

impl Issue {
    fn contains_marker(&self) -> bool {
        RETRYABLE_ISSUE_MARKERS
            .iter()
            .any(|m| self.message.contains(m))
            || self.issues.iter().any(Issue::contains_marker)
    }

    fn collect_messages(&self, out: &mut Vec<String>) {
        if !self.message.is_empty() {
            out.push(self.message.clone());
        }
        for nested in &self.issues {
            nested.collect_messages(out);
        }
    }
}

/// A long-running operation envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub ready: bool,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<Issue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Operation {
    /// A failed operation worth redispatching: the upstream has not
    /// converged yet rather than rejected the request.
    pub fn is_retryable(&self) -> bool {
        !self.status.is_success() && self.issues.iter().any(Issue::contains_marker)
    }

    pub fn error_message(&self) -> String {
        let mut messages = Vec::new();
        for issue in &self.issues {
            issue.collect_messages(&mut messages);
        }
        if messages.is_empty() {
            format!("operation failed with status {:?}", self.status)
        } else {
            messages.join("; ")
        }
    }

    /// Turn a non-success outcome into the status-mapped gateway error.
    pub fn into_result(self) -> GatewayResult<Operation> {
        if self.status.is_success() {
            return Ok(self);
        }
        let issues = self
            .issues
            .iter()
            .filter_map(|i| serde_json::to_value(i).ok())
            .collect();
        Err(GatewayError::Upstream {
            status: self.status.http_status(),
            message: self.error_message(),
            issues,
        })
    }
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Invoke `method` at `target` with a JSON payload, forwarding the
    /// caller's bearer token when present.
    async fn call(
        &self,
        target: &Endpoint,
        auth: Option<&str>,
        method: &str,
        payload: Value,
        timeout: Duration,
    ) -> GatewayResult<Operation>;
}

/// JSON-over-HTTP control plane client.
pub struct HttpControlPlane {
    http: HttpClient,
}

impl HttpControlPlane {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn call(
        &self,
        target: &Endpoint,
        auth: Option<&str>,
        method: &str,
        payload: Value,
        timeout: Duration,
    ) -> GatewayResult<Operation> {
        let base = target.url.trim_end_matches('/');
        let url = format!("{}{}/{}", target.endpoint, base, method);

        let mut headers = HeaderMap::new();
        if let Some(token) = auth {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| GatewayError::Unauthorized(format!("invalid auth token: {e}")))?;
            headers.insert(http::header::AUTHORIZATION, value);
        }

        let body = self.http.post_json(&url, headers, &payload, timeout).await?;
        serde_json::from_value::<Operation>(body)
            .map_err(|e| GatewayError::Internal(format!("malformed operation envelope: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_status_http_mapping() {
        assert_eq!(OperationStatus::Success.http_status(), StatusCode::OK);
        assert_eq!(
            OperationStatus::Unauthorized.http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            OperationStatus::PreconditionFailed.http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            OperationStatus::AlreadyExists.http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            OperationStatus::NotFound.http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            OperationStatus::Overloaded.http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            OperationStatus::Timeout.http_status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            OperationStatus::Undetermined.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_unknown_status_parses_as_unspecified() {
        let op: Operation =
            serde_json::from_value(json!({"status": "SOMETHING_NEW"})).unwrap();
        assert_eq!(op.status, OperationStatus::StatusCodeUnspecified);
        assert_eq!(op.status.http_status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_retryable_markers() {
        let op: Operation = serde_json::from_value(json!({
            "status": "GENERIC_ERROR",
            "issues": [
                {"message": "outer", "issues": [{"message": "database unknown"}]}
            ]
        }))
        .unwrap();
        assert!(op.is_retryable());

        let op: Operation = serde_json::from_value(json!({
            "status": "GENERIC_ERROR",
            "issues": [{"message": "error #200802: not propagated"}]
        }))
        .unwrap();
        assert!(op.is_retryable());

        let op: Operation = serde_json::from_value(json!({
            "status": "BAD_REQUEST",
            "issues": [{"message": "name is malformed"}]
        }))
        .unwrap();
        assert!(!op.is_retryable());

        let op: Operation = serde_json::from_value(json!({
            "status": "SUCCESS",
            "issues": [{"message": "database unknown"}]
        }))
        .unwrap();
        assert!(!op.is_retryable());
    }

    #[test]
    fn test_into_result_carries_issues() {
        let op: Operation = serde_json::from_value(json!({
            "status": "PRECONDITION_FAILED",
            "issues": [{"message": "quota exceeded"}]
        }))
        .unwrap();
        let err = op.into_result().unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(&err.to_json_body()).unwrap();
        assert_eq!(body["issues"][0]["message"], "quota exceeded");
        assert!(body["message"].as_str().unwrap().contains("quota exceeded"));
    }
}
