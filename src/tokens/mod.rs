//! Service credential management.
//!
//! Named tokens are refreshed in the background on a min-heap schedule and
//! served to request handlers through a non-blocking lookup. The map and
//! heap sit behind one mutex that is held only for bookkeeping, never
//! across a network call; refreshes run outside the lock and report back.
//! Each name has at most one schedule entry: entries are pushed only at
//! seed time and when a popped refresh completes.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use http::{HeaderMap, HeaderValue};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use pingora_core::services::background::BackgroundService;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::client::HttpClient;
use crate::config::{TokenConfig, TokenSource};
use crate::core::error::{GatewayError, GatewayResult};

pub const REFRESH_CHECK_PERIOD: Duration = Duration::from_secs(30);
pub const SUCCESS_REFRESH_PERIOD: Duration = Duration::from_secs(3600);
pub const ERROR_REFRESH_PERIOD: Duration = Duration::from_secs(600);
pub const REFRESH_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Default)]
struct TokenRecord {
    value: String,
    subject: String,
}

#[derive(Default)]
struct TokenState {
    tokens: HashMap<String, TokenRecord>,
    queue: BinaryHeap<Reverse<(Instant, String)>>,
}

pub struct TokenManager {
    configs: HashMap<String, TokenConfig>,
    state: Mutex<TokenState>,
    // Signing keys are read once at startup; an unreadable key file is a
    // fatal configuration error.
    jwt_keys: HashMap<String, EncodingKey>,
    http: HttpClient,
}

impl TokenManager {
    pub fn new(configs: Vec<TokenConfig>, http: HttpClient) -> GatewayResult<Self> {
        let mut jwt_keys = HashMap::new();
        let mut state = TokenState::default();
        let now = Instant::now();

        for config in &configs {
            match &config.source {
                TokenSource::Jwt {
                    private_key_path, ..
                } => {
                    let pem = std::fs::read(private_key_path).map_err(|e| {
                        GatewayError::Configuration(format!(
                            "cannot read JWT key {private_key_path}: {e}"
                        ))
                    })?;
                    let key = EncodingKey::from_rsa_pem(&pem).map_err(|e| {
                        GatewayError::Configuration(format!(
                            "invalid JWT key {private_key_path}: {e}"
                        ))
                    })?;
                    jwt_keys.insert(config.name.clone(), key);
                }
                TokenSource::Static { value } => {
                    // static tokens are usable before the first refresh pass
                    state.tokens.insert(
                        config.name.clone(),
                        TokenRecord {
                            value: value.clone(),
                            subject: config.name.clone(),
                        },
                    );
                }
                _ => {}
            }
            state.queue.push(Reverse((now, config.name.clone())));
        }

        Ok(Self {
            configs: configs
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
            state: Mutex::new(state),
            jwt_keys,
            http,
        })
    }

    /// Current token value for `name`. Never blocks; unknown names and
    /// tokens that have not been obtained yet read as empty.
    pub fn get_token(&self, name: &str) -> String {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .tokens
            .get(name)
            .map(|r| r.value.clone())
            .unwrap_or_default()
    }

    pub fn get_subject(&self, name: &str) -> String {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .tokens
            .get(name)
            .map(|r| r.subject.clone())
            .unwrap_or_default()
    }

    /// Pop every schedule entry due at `now`.
    fn due_tokens(&self, now: Instant) -> Vec<String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut due = Vec::new();
        while let Some(Reverse((at, _))) = state.queue.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((_, name))) = state.queue.pop() {
                due.push(name);
            }
        }
        due
    }

    /// Record a refresh outcome and put the name back on the schedule.
    fn complete(&self, name: &str, outcome: GatewayResult<TokenRecord>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let next = match outcome {
            Ok(record) => {
                log::info!("token {name} refreshed, subject {}", record.subject);
                state.tokens.insert(name.to_string(), record);
                Instant::now() + SUCCESS_REFRESH_PERIOD
            }
            Err(e) => {
                // keep serving the stale value and retry sooner
                log::warn!("token {name} refresh failed: {e}");
                Instant::now() + ERROR_REFRESH_PERIOD
            }
        };
        state.queue.push(Reverse((next, name.to_string())));
    }

    /// Refresh every due token. Called by the background service; network
    /// calls happen with no lock held.
    pub async fn refresh_due(&self) {
        for name in self.due_tokens(Instant::now()) {
            let outcome = self.refresh(&name).await;
            self.complete(&name, outcome);
        }
    }

    async fn refresh(&self, name: &str) -> GatewayResult<TokenRecord> {
        let config = self
            .configs
            .get(name)
            .ok_or_else(|| GatewayError::Internal(format!("unknown token {name}")))?;

        match &config.source {
            TokenSource::Static { value } => Ok(TokenRecord {
                value: value.clone(),
                subject: name.to_string(),
            }),
            TokenSource::StaticCredentials {
                endpoint,
                user,
                password,
            } => {
                let mut headers = HeaderMap::new();
                let basic = general_purpose::STANDARD.encode(format!("{user}:{password}"));
                headers.insert(
                    http::header::AUTHORIZATION,
                    HeaderValue::from_str(&format!("Basic {basic}"))
                        .map_err(|e| GatewayError::Internal(e.to_string()))?,
                );
                let body = self
                    .http
                    .post_json(
                        endpoint,
                        headers,
                        &json!({"user": user, "password": password}),
                        REFRESH_CALL_TIMEOUT,
                    )
                    .await?;
                Ok(TokenRecord {
                    value: extract_token(&body)?,
                    subject: user.clone(),
                })
            }
            TokenSource::Oauth {
                endpoint,
                client_id,
                client_secret,
            } => {
                let body = self
                    .http
                    .post_json(
                        endpoint,
                        HeaderMap::new(),
                        &json!({
                            "grant_type": "client_credentials",
                            "client_id": client_id,
                            "client_secret": client_secret,
                        }),
                        REFRESH_CALL_TIMEOUT,
                    )
                    .await?;
                Ok(TokenRecord {
                    value: extract_token(&body)?,
                    subject: client_id.clone(),
                })
            }
            TokenSource::Jwt {
                endpoint,
                key_id,
                issuer,
                audience,
                ttl,
                ..
            } => {
                let key = self
                    .jwt_keys
                    .get(name)
                    .ok_or_else(|| GatewayError::Internal(format!("no JWT key for {name}")))?;
                let assertion = sign_jwt(key, key_id, issuer, audience, *ttl)?;
                let body = self
                    .http
                    .post_json(
                        endpoint,
                        HeaderMap::new(),
                        &json!({"jwt": assertion}),
                        REFRESH_CALL_TIMEOUT,
                    )
                    .await?;
                Ok(TokenRecord {
                    value: extract_token(&body)?,
                    subject: issuer.clone(),
                })
            }
            TokenSource::MetadataService { endpoint } => {
                let mut headers = HeaderMap::new();
                headers.insert("metadata-flavor", HeaderValue::from_static("Google"));
                let body = self
                    .http
                    .get_json(endpoint, headers, REFRESH_CALL_TIMEOUT)
                    .await?;
                Ok(TokenRecord {
                    value: extract_token(&body)?,
                    subject: "metadata".to_string(),
                })
            }
            TokenSource::TokenExchange {
                endpoint,
                subject_token,
            } => {
                let body = self
                    .http
                    .post_json(
                        endpoint,
                        HeaderMap::new(),
                        &json!({
                            "grant_type": "urn:ietf:params:oauth:grant-type:token-exchange",
                            "requested_token_type": "urn:ietf:params:oauth:token-type:access_token",
                            "subject_token_type": "urn:ietf:params:oauth:token-type:jwt",
                            "subject_token": subject_token,
                        }),
                        REFRESH_CALL_TIMEOUT,
                    )
                    .await?;
                Ok(TokenRecord {
                    value: extract_token(&body)?,
                    subject: name.to_string(),
                })
            }
        }
    }
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

fn sign_jwt(
    key: &EncodingKey,
    key_id: &str,
    issuer: &str,
    audience: &str,
    ttl: u64,
) -> GatewayResult<String> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| GatewayError::Internal(e.to_string()))?
        .as_secs();
    let claims = JwtClaims {
        iss: issuer,
        aud: audience,
        iat: now,
        exp: now + ttl,
    };
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(key_id.to_string());
    jsonwebtoken::encode(&header, &claims, key)
        .map_err(|e| GatewayError::Internal(format!("JWT signing failed: {e}")))
}

/// Auth endpoints disagree on the token field name.
fn extract_token(body: &Value) -> GatewayResult<String> {
    for field in ["token", "iamToken", "access_token"] {
        if let Some(value) = body.get(field).and_then(Value::as_str) {
            return Ok(value.to_string());
        }
    }
    Err(GatewayError::Internal(
        "auth response carries no token field".to_string(),
    ))
}

/// Background refresher: wakes periodically and refreshes due tokens.
pub struct TokenRefresher {
    manager: std::sync::Arc<TokenManager>,
}

impl TokenRefresher {
    pub fn new(manager: std::sync::Arc<TokenManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl BackgroundService for TokenRefresher {
    async fn start(&self, mut shutdown: pingora_core::server::ShutdownWatch) -> () {
        // obtain everything once at startup, then poll the schedule
        self.manager.refresh_due().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(REFRESH_CHECK_PERIOD) => {
                    self.manager.refresh_due().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_token(name: &str, value: &str) -> TokenConfig {
        TokenConfig {
            name: name.to_string(),
            source: TokenSource::Static {
                value: value.to_string(),
            },
        }
    }

    fn manager(configs: Vec<TokenConfig>) -> TokenManager {
        TokenManager::new(configs, HttpClient::new().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_token_reads_empty() {
        let mgr = manager(vec![static_token("cp", "abc")]);
        assert_eq!(mgr.get_token("nope"), "");
        assert_eq!(mgr.get_subject("nope"), "");
    }

    #[tokio::test]
    async fn test_static_token_available_immediately() {
        let mgr = manager(vec![static_token("cp", "abc")]);
        assert_eq!(mgr.get_token("cp"), "abc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_single_entry_per_name() {
        let mgr = manager(vec![static_token("a", "1"), static_token("b", "2")]);

        let mut due = mgr.due_tokens(Instant::now());
        due.sort();
        assert_eq!(due, vec!["a".to_string(), "b".to_string()]);
        // popped entries are gone until a completion reschedules them
        assert!(mgr.due_tokens(Instant::now()).is_empty());

        mgr.complete(
            "a",
            Ok(TokenRecord {
                value: "1".into(),
                subject: "a".into(),
            }),
        );
        assert!(mgr.due_tokens(Instant::now()).is_empty());
        tokio::time::advance(SUCCESS_REFRESH_PERIOD + Duration::from_secs(1)).await;
        assert_eq!(mgr.due_tokens(Instant::now()), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_stale_value_and_retries_sooner() {
        let mgr = manager(vec![static_token("cp", "abc")]);
        let _ = mgr.due_tokens(Instant::now());

        mgr.complete("cp", Err(GatewayError::Unavailable("auth down".into())));
        // stale value still served
        assert_eq!(mgr.get_token("cp"), "abc");

        // rescheduled at the error interval, well before the success one
        tokio::time::advance(ERROR_REFRESH_PERIOD + Duration::from_secs(1)).await;
        assert_eq!(mgr.due_tokens(Instant::now()), vec!["cp".to_string()]);
    }

    #[tokio::test]
    async fn test_refresh_due_updates_static_tokens() {
        let mgr = manager(vec![static_token("cp", "abc")]);
        mgr.refresh_due().await;
        assert_eq!(mgr.get_token("cp"), "abc");
        assert_eq!(mgr.get_subject("cp"), "cp");
    }

    #[test]
    fn test_extract_token_field_variants() {
        assert_eq!(extract_token(&json!({"token": "t"})).unwrap(), "t");
        assert_eq!(extract_token(&json!({"iamToken": "t"})).unwrap(), "t");
        assert_eq!(extract_token(&json!({"access_token": "t"})).unwrap(), "t");
        assert!(extract_token(&json!({"other": 1})).is_err());
    }
}
