//! Fleet-wide cluster aggregation.
//!
//! The fleet table seeds the answer, then every cluster's balancer is
//! asked for its cluster summary and its node system states. All fetches
//! run concurrently and the bodies fold into one `{"clusters": [...]}`
//! document grouped by cluster name. A cluster whose balancer is down
//! still appears, carrying an `error` field instead of its live data.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use http::StatusCode;
use serde_json::{json, Value};

use crate::client::crack_endpoint;
use crate::core::error::GatewayResult;
use crate::merge::{
    merge, ErrorHandler, Filter, Mapper, MergePlan, MergeSource, Reducer,
};
use crate::orchestrator::{fan_out, HttpAnswer};
use crate::store::VersionColor;

use super::common::{api_url, outbound_headers, resolve_auth};
use super::{AppState, GatewayRequest, Handler};

pub struct ClustersHandler;

/// Maps a balancer `/cluster` body into one merged-document fragment: the
/// body lands whole under `cluster`, tagged with the cluster's name and
/// viewer endpoint. Processing of the peer stops after the root match.
fn cluster_mapper(name: String, endpoint: String) -> Mapper {
    Arc::new(move |value, ctx| {
        ctx.stop = true;
        Some(json!({"clusters": [{
            "name": name,
            "endpoint": endpoint,
            "cluster": value.clone(),
        }]}))
    })
}

/// Maps one `/sysinfo` node entry into a countable fragment: the node's
/// host with weight 1 and a `{role, version, count: 1}` entry. A node is
/// `storage` when its roles say so, `compute` otherwise.
fn sysinfo_mapper(name: String) -> Mapper {
    Arc::new(move |node, _ctx| {
        let host = node.get("Host").and_then(|h| h.as_str())?;
        let version = node
            .get("Version")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let is_storage = node
            .get("Roles")
            .and_then(|r| r.as_array())
            .map(|roles| roles.iter().any(|r| r == &json!("Storage")))
            .unwrap_or(false);
        let role = if is_storage { "storage" } else { "compute" };
        Some(json!({"clusters": [{
            "name": name,
            "hosts": { host: 1 },
            "versions": [{"role": role, "version": version, "count": 1}],
        }]}))
    })
}

/// A failed peer still contributes its cluster row, with the failure text.
fn cluster_error_handler(name: String) -> ErrorHandler {
    Arc::new(move |msg| json!({"clusters": [{"name": name, "error": msg}]}))
}

fn merge_plan(colors: Vec<VersionColor>) -> MergePlan {
    let mut plan = MergePlan::default();
    plan.reducers
        .insert(".clusters".into(), Reducer::GroupBy(vec!["name".into()]));
    plan.reducers
        .insert(".clusters[].name".into(), Reducer::Unique);
    plan.reducers.insert(
        ".clusters[].versions".into(),
        Reducer::GroupBy(vec!["role".into(), "version".into()]),
    );
    plan.reducers
        .insert(".clusters[].versions[].role".into(), Reducer::Unique);
    plan.reducers
        .insert(".clusters[].versions[].version".into(), Reducer::Unique);
    plan.reducers
        .insert(".clusters[].versions[].count".into(), Reducer::Sum);
    plan.reducers
        .insert(".clusters[].hosts".into(), Reducer::MapWithSum);
    if !colors.is_empty() {
        plan.filters
            .insert(".clusters[].versions[]".into(), color_filter(colors));
    }
    plan
}

/// Tags each version entry with the color class of the first base prefix
/// (in base order) its version string starts with.
fn color_filter(mut colors: Vec<VersionColor>) -> Filter {
    colors.sort_by(|a, b| a.base.cmp(&b.base));
    Arc::new(move |entry| {
        let Some(version) = entry.get("version").and_then(|v| v.as_str()) else {
            return;
        };
        let index = colors
            .iter()
            .find(|c| version.starts_with(&c.base))
            .map(|c| c.color_index);
        if let (Some(index), Value::Object(obj)) = (index, entry) {
            obj.insert("version_base_color_index".into(), json!(index));
        }
    })
}

struct ClusterTarget {
    name: String,
    url: String,
    token_name: String,
}

#[async_trait]
impl Handler for ClustersHandler {
    async fn handle(
        &self,
        state: Arc<AppState>,
        req: GatewayRequest,
    ) -> GatewayResult<HttpAnswer> {
        let rs = state.store.list_clusters().await?;
        let mut seed_rows = Vec::new();
        let mut targets = Vec::new();
        for row in rs.rows_as_json() {
            let Some(name) = row.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Some(filter) = req.query.get("name") {
                if name != filter {
                    continue;
                }
            }
            if let Some(balancer) = row.get("balancer").and_then(|v| v.as_str()) {
                let cracked = crack_endpoint(balancer);
                targets.push(ClusterTarget {
                    name: name.to_string(),
                    url: api_url(balancer),
                    token_name: cracked.token_name,
                });
            }
            seed_rows.push(row);
        }

        let mut fetches: Vec<BoxFuture<'static, MergeSource>> = Vec::new();
        for target in &targets {
            let auth = resolve_auth(&req.headers, &state.tokens, &target.token_name);
            let headers = outbound_headers(&req.headers, auth.as_deref());
            for peer in ["cluster", "sysinfo"] {
                let http = state.http.clone();
                let headers = headers.clone();
                let url = format!("{}/{peer}", target.url);
                let name = target.name.clone();
                let timeout = state.phase_timeout;
                let mappers = match peer {
                    "cluster" => vec![(
                        ".".to_string(),
                        cluster_mapper(name.clone(), target.url.clone()),
                    )],
                    _ => vec![(
                        ".SystemStateInfo[]".to_string(),
                        sysinfo_mapper(name.clone()),
                    )],
                };
                fetches.push(Box::pin(async move {
                    MergeSource {
                        name: format!("{name}/{peer}"),
                        result: http.get_json(&url, headers, timeout).await,
                        mappers,
                        error_handler: Some(cluster_error_handler(name)),
                    }
                }));
            }
        }

        let mut sources = vec![MergeSource::document(
            "fleet",
            json!({ "clusters": seed_rows }),
        )];
        sources.extend(fan_out(fetches).await);

        let colors = match state.store.version_colors().await {
            Ok(colors) => colors,
            Err(e) => {
                log::warn!("version color table unavailable: {e}");
                Vec::new()
            }
        };

        let out = merge(sources, &merge_plan(colors));
        Ok(HttpAnswer::json(StatusCode::OK, &out.doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::GatewayError;
    use crate::handlers::testing;
    use crate::store::memory::MemoryStore;
    use crate::store::ClusterRecord;

    fn sysinfo_body() -> Value {
        json!({"SystemStateInfo": [
            {"Host": "node-1", "Version": "24.3.1", "Roles": ["Storage"]},
            {"Host": "node-2", "Version": "24.3.1", "Roles": ["Tenant"]},
            {"Host": "node-3", "Version": "24.3.1", "Roles": ["Storage", "Bootstrapper"]},
        ]})
    }

    fn fleet_row(name: &str) -> MergeSource {
        MergeSource::document(
            "fleet",
            json!({"clusters": [{"name": name, "balancer": format!("balancer.{name}")}]}),
        )
    }

    #[tokio::test]
    async fn test_empty_fleet_yields_empty_listing() {
        let state = testing::state(MemoryStore::default());
        let answer = ClustersHandler
            .handle(state, testing::get_request("/meta/clusters"))
            .await
            .unwrap();
        assert_eq!(answer.status, StatusCode::OK);
        let doc: Value = serde_json::from_slice(&answer.body).unwrap();
        assert_eq!(doc, json!({"clusters": []}));
    }

    #[tokio::test]
    async fn test_fleet_rows_seed_the_answer_without_live_data() {
        // the balancer is unreachable, the row from the store still shows
        let state = testing::state(MemoryStore::with_clusters(vec![ClusterRecord {
            name: "alpha".into(),
            balancer: "127.0.0.1:1".into(),
            control_plane: None,
            description: Some("test fleet".into()),
            location: None,
        }]));
        let answer = ClustersHandler
            .handle(state, testing::get_request("/meta/clusters?name=alpha"))
            .await
            .unwrap();
        let doc: Value = serde_json::from_slice(&answer.body).unwrap();
        let clusters = doc["clusters"].as_array().unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0]["name"], json!("alpha"));
        assert_eq!(clusters[0]["description"], json!("test fleet"));
        assert!(clusters[0]["error"].is_string());
    }

    #[test]
    fn test_cluster_and_sysinfo_fragments_aggregate() {
        let sources = vec![
            fleet_row("alpha"),
            MergeSource {
                name: "alpha/cluster".into(),
                result: Ok(json!({"Overall": "Green", "NodesTotal": 3})),
                mappers: vec![(
                    ".".into(),
                    cluster_mapper("alpha".into(), "http://balancer.alpha:8765/viewer".into()),
                )],
                error_handler: Some(cluster_error_handler("alpha".into())),
            },
            MergeSource {
                name: "alpha/sysinfo".into(),
                result: Ok(sysinfo_body()),
                mappers: vec![(".SystemStateInfo[]".into(), sysinfo_mapper("alpha".into()))],
                error_handler: Some(cluster_error_handler("alpha".into())),
            },
        ];
        let out = merge(sources, &merge_plan(Vec::new()));
        let clusters = out.doc["clusters"].as_array().unwrap();
        assert_eq!(clusters.len(), 1);
        let cluster = &clusters[0];
        assert_eq!(cluster["name"], json!("alpha"));
        assert_eq!(cluster["balancer"], json!("balancer.alpha"));
        assert_eq!(cluster["cluster"]["Overall"], json!("Green"));
        assert_eq!(
            cluster["endpoint"],
            json!("http://balancer.alpha:8765/viewer")
        );
        assert_eq!(
            cluster["hosts"],
            json!({"node-1": 1, "node-2": 1, "node-3": 1})
        );
        let versions = cluster["versions"].as_array().unwrap();
        let storage = versions.iter().find(|v| v["role"] == json!("storage")).unwrap();
        assert_eq!(storage["count"], json!(2));
        let compute = versions.iter().find(|v| v["role"] == json!("compute")).unwrap();
        assert_eq!(compute["count"], json!(1));
    }

    #[test]
    fn test_failed_balancer_reports_error_row() {
        let sources = vec![
            MergeSource {
                name: "alpha/cluster".into(),
                result: Err(GatewayError::Unavailable("connect refused".into())),
                mappers: Vec::new(),
                error_handler: Some(cluster_error_handler("alpha".into())),
            },
            MergeSource {
                name: "beta/sysinfo".into(),
                result: Ok(sysinfo_body()),
                mappers: vec![(".SystemStateInfo[]".into(), sysinfo_mapper("beta".into()))],
                error_handler: Some(cluster_error_handler("beta".into())),
            },
        ];
        let out = merge(sources, &merge_plan(Vec::new()));
        let clusters = out.doc["clusters"].as_array().unwrap();
        assert_eq!(clusters.len(), 2);
        let alpha = clusters.iter().find(|c| c["name"] == json!("alpha")).unwrap();
        assert!(alpha["error"].as_str().unwrap().contains("connect refused"));
        let beta = clusters.iter().find(|c| c["name"] == json!("beta")).unwrap();
        assert!(beta.get("error").is_none());
    }

    #[test]
    fn test_color_filter_takes_first_base_in_order() {
        let colors = vec![
            VersionColor {
                base: "24.3".into(),
                color_index: 2,
            },
            VersionColor {
                base: "24".into(),
                color_index: 1,
            },
        ];
        let sources = vec![MergeSource {
            name: "alpha/sysinfo".into(),
            result: Ok(sysinfo_body()),
            mappers: vec![(".SystemStateInfo[]".into(), sysinfo_mapper("alpha".into()))],
            error_handler: None,
        }];
        let out = merge(sources, &merge_plan(colors));
        let versions = out.doc["clusters"][0]["versions"].as_array().unwrap();
        assert!(!versions.is_empty());
        for v in versions {
            assert_eq!(v["version_base_color_index"], json!(1));
        }
    }
}
