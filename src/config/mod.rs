use std::fs;
use std::net::SocketAddr;

use log::{debug, trace};
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_cluster_source"))]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    /// Shared metadata store. When absent the gateway serves the static
    /// `clusters` list and skips the refresh-ownership protocol.
    pub store: Option<Etcd>,

    /// Static fleet definition, used when no store is configured and as
    /// a seed otherwise.
    #[validate(nested)]
    #[serde(default)]
    pub clusters: Vec<ClusterSeed>,

    #[validate(nested)]
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,

    /// Response cache policies, matched by longest route prefix.
    #[validate(nested)]
    #[serde(default)]
    pub cache: Vec<CacheRoute>,

    /// Cache policies for outbound peer GETs, matched by URL prefix.
    #[validate(nested)]
    #[serde(default)]
    pub client_cache: Vec<CacheRoute>,

    /// Externally reachable URL of this instance, recorded in refresh
    /// leases so peers can forward to the owner.
    pub self_endpoint: Option<String>,

    /// Overall per-request deadline in seconds.
    #[serde(default = "Config::default_request_timeout")]
    pub request_timeout: u64,

    /// Deadline for a single phase of outbound calls, in seconds.
    #[serde(default = "Config::default_phase_timeout")]
    pub phase_timeout: u64,

    /// Deadline for host-proxy requests, in seconds.
    #[serde(default = "Config::default_proxy_timeout")]
    pub proxy_timeout: u64,

    pub log: Option<Log>,
}

// Config file load and validation
impl Config {
    // Does not have to be async until we want runtime reload
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        // use validator to validate conf file
        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    #[allow(dead_code)]
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap()
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    fn validate_cluster_source(&self) -> std::result::Result<(), ValidationError> {
        if self.store.is_none() && self.clusters.is_empty() {
            return Err(ValidationError::new("store_or_clusters_required"));
        }
        if self.store.is_some() && self.self_endpoint.is_none() {
            // The lease protocol records this instance as the forward target.
            return Err(ValidationError::new("self_endpoint_required_for_store"));
        }
        Ok(())
    }

    fn default_request_timeout() -> u64 {
        60
    }

    fn default_phase_timeout() -> u64 {
        10
    }

    fn default_proxy_timeout() -> u64 {
        120
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Listener::validate_tls_for_offer_h2"))]
pub struct Listener {
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub offer_h2: bool,
}

impl Listener {
    fn validate_tls_for_offer_h2(&self) -> std::result::Result<(), ValidationError> {
        if self.offer_h2 && self.tls.is_none() {
            Err(ValidationError::new("tls_required_for_h2"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tls {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Etcd {
    #[validate(length(min = 1))]
    pub host: Vec<String>,
    #[serde(default = "Etcd::default_prefix")]
    pub prefix: String,
    pub timeout: Option<u32>,
    pub connect_timeout: Option<u32>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Etcd {
    fn default_prefix() -> String {
        "/metagate".to_string()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
}

/// A statically configured cluster record.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct ClusterSeed {
    #[validate(length(min = 1))]
    pub name: String,
    /// Data-plane balancer endpoint, e.g. `grpc://balancer.cluster-a:2135`
    /// or a bare host. Default viewer port and path are appended when the
    /// address carries neither.
    #[validate(length(min = 1))]
    pub balancer: String,
    /// Control-plane endpoint in `scheme://token-name@host/path` form.
    pub control_plane: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
}

/// Credential definition for the token manager.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct TokenConfig {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(flatten)]
    pub source: TokenSource,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenSource {
    /// Fixed token value from the config file.
    Static { value: String },
    /// Username/password login against an auth endpoint.
    StaticCredentials {
        endpoint: String,
        user: String,
        password: String,
    },
    /// OAuth client-credentials exchange.
    Oauth {
        endpoint: String,
        client_id: String,
        client_secret: String,
    },
    /// Locally signed JWT exchanged for a service token.
    Jwt {
        endpoint: String,
        key_id: String,
        issuer: String,
        audience: String,
        private_key_path: String,
        #[serde(default = "default_jwt_ttl")]
        ttl: u64,
    },
    /// Instance metadata service.
    MetadataService { endpoint: String },
    /// RFC 8693 style token exchange of a fixed subject token.
    TokenExchange {
        endpoint: String,
        subject_token: String,
    },
}

fn default_jwt_ttl() -> u64 {
    360
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "CacheRoute::validate_windows"))]
pub struct CacheRoute {
    #[validate(length(min = 1))]
    pub prefix: String,
    /// Seconds after which an entry may no longer be served at all.
    pub time_to_expire: u64,
    /// Seconds after which an entry is served stale while a refresh runs.
    pub time_to_refresh: u64,
    /// Keep serving the previous value when a refresh fails.
    #[serde(default)]
    pub keep_on_error: bool,
}

impl CacheRoute {
    fn validate_windows(&self) -> std::result::Result<(), ValidationError> {
        if self.time_to_refresh > self.time_to_expire {
            return Err(ValidationError::new("refresh_window_exceeds_expiry"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_load_file() {
        init_log();
        let conf_str = r#"
---
pingora:
  version: 1

listeners:
  - address: 0.0.0.0:8080
  - address: "[::1]:8443"
    tls:
      cert_path: /etc/ssl/server.crt
      key_path: /etc/ssl/server.key
    offer_h2: true

store:
  host:
    - "http://127.0.0.1:2379"
  prefix: /metagate

self_endpoint: "http://gw-1.internal:8080"

clusters:
  - name: cluster-a
    balancer: balancer.cluster-a
    control_plane: "grpcs://cp-token@cms.cluster-a:2135/console"

tokens:
  - name: cp-token
    kind: static
    value: secret-token
  - name: iam
    kind: jwt
    endpoint: "https://iam.example.com/tokens"
    key_id: kid-1
    issuer: svc@project
    audience: "https://iam.example.com/"
    private_key_path: /etc/keys/iam.pem

cache:
  - prefix: /meta/clusters
    time_to_expire: 120
    time_to_refresh: 30
    keep_on_error: true

client_cache:
  - prefix: "http://balancer.cluster-a:8765/"
    time_to_expire: 60
    time_to_refresh: 15
        "#
        .to_string();
        let conf = Config::from_yaml(&conf_str).unwrap();
        assert_eq!(1, conf.pingora.version);
        assert_eq!(2, conf.listeners.len());
        assert_eq!(1, conf.clusters.len());
        assert_eq!(2, conf.tokens.len());
        assert_eq!(1, conf.cache.len());
        assert_eq!(1, conf.client_cache.len());
        assert_eq!(60, conf.request_timeout);
        print!("{}", conf.to_yaml());
    }

    #[test]
    fn test_valid_listeners_length() {
        init_log();
        let conf_str = r#"
---
listeners: []

clusters:
  - name: cluster-a
    balancer: balancer.cluster-a
        "#
        .to_string();
        assert!(Config::from_yaml(&conf_str).is_err());
    }

    #[test]
    fn test_valid_listeners_tls_for_offer_h2() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: "[::1]:8080"
    offer_h2: true

clusters:
  - name: cluster-a
    balancer: balancer.cluster-a
        "#
        .to_string();
        assert!(Config::from_yaml(&conf_str).is_err());
    }

    #[test]
    fn test_valid_cluster_source_required() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: "[::1]:8080"
        "#
        .to_string();
        assert!(Config::from_yaml(&conf_str).is_err());
    }

    #[test]
    fn test_valid_self_endpoint_required_with_store() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: "[::1]:8080"

store:
  host:
    - "http://127.0.0.1:2379"
        "#
        .to_string();
        assert!(Config::from_yaml(&conf_str).is_err());
    }

    #[test]
    fn test_valid_token_kind_fields() {
        init_log();
        // jwt token without a private key path must not deserialize
        let conf_str = r#"
---
listeners:
  - address: "[::1]:8080"

clusters:
  - name: cluster-a
    balancer: balancer.cluster-a

tokens:
  - name: iam
    kind: jwt
    endpoint: "https://iam.example.com/tokens"
    key_id: kid-1
    issuer: svc@project
    audience: "https://iam.example.com/"
        "#
        .to_string();
        assert!(Config::from_yaml(&conf_str).is_err());
    }

    #[test]
    fn test_valid_cache_windows() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: "[::1]:8080"

clusters:
  - name: cluster-a
    balancer: balancer.cluster-a

cache:
  - prefix: /meta/clusters
    time_to_expire: 30
    time_to_refresh: 60
        "#
        .to_string();
        assert!(Config::from_yaml(&conf_str).is_err());
    }
}
