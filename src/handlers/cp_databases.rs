//! Database listing joined across the control plane and the balancer.
//!
//! The control plane knows every provisioned database; the balancer's
//! viewer knows the live tenants and their nodes. Both are fetched in one
//! phase and joined into a `databases` array: each live tenant is
//! enriched with its control-plane record and a monitoring endpoint
//! picked from its nodes, then the node list is dropped from the answer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use rand::Rng;
use serde_json::{json, Value};

use crate::client::control_plane::Operation;
use crate::core::error::{GatewayError, GatewayResult};
use crate::orchestrator::{Call, CallError, Decision, HttpAnswer, Orchestrator, Phase, RetryPolicy};
use crate::utils::request::query_map;

use super::common::{
    api_url, control_endpoint, control_plane_call, lookup_cluster, outbound_headers, resolve_auth,
    Parameters,
};
use super::{AppState, GatewayRequest, Handler};

pub struct CpDatabasesHandler;

enum CpEvent {
    Databases(Operation),
    Tenants(Value),
}

#[async_trait]
impl Handler for CpDatabasesHandler {
    async fn handle(
        &self,
        state: Arc<AppState>,
        req: GatewayRequest,
    ) -> GatewayResult<HttpAnswer> {
        let params = Parameters::from_request(&req)?;
        let cluster = lookup_cluster(&state, &params).await?;
        let target = control_endpoint(&cluster)?;
        let auth = resolve_auth(&req.headers, &state.tokens, &target.token_name);
        let headers = outbound_headers(&req.headers, auth.as_deref());

        // the location filter travels inside the endpoint record, not in
        // the inbound request
        let location_filter = target
            .url
            .split_once('?')
            .and_then(|(_, q)| query_map(Some(q)).remove("location_id"));
        let filter_database = params.get("database");

        let full = params.get("light").as_deref() == Some("0");
        let detail = u8::from(full);
        let offload = u8::from(params.get("offload").as_deref() == Some("1"));
        let tenants_url = format!(
            "{}/tenantinfo?tablets={detail}&offload_merge={offload}&storage={detail}&nodes=0&users=0&timeout=55000",
            api_url(&cluster.balancer),
        );

        let list_call = control_plane_call(
            &state,
            target,
            auth,
            "ListAllDatabases",
            json!({"database_view": "SERVERLESS_INTERNALS"}),
        );
        let list_call = Call::new("ListAllDatabases", list_call.retry, {
            let dispatch = list_call.dispatch;
            move || {
                let fut = dispatch();
                Box::pin(async move { fut.await.map(CpEvent::Databases) })
            }
        });

        let tenants_call = Call::new("tenantinfo", RetryPolicy::Transient, {
            let http = state.http.clone();
            let timeout = state.phase_timeout;
            move || {
                let http = http.clone();
                let url = tenants_url.clone();
                let headers = headers.clone();
                Box::pin(async move {
                    match http.get_json(&url, headers, timeout).await {
                        Ok(doc) => Ok(CpEvent::Tenants(doc)),
                        Err(e @ (GatewayError::Unavailable(_) | GatewayError::Timeout(_))) => {
                            Err(CallError::transient(e))
                        }
                        Err(e) => Err(CallError::terminal(e)),
                    }
                })
            }
        });

        let orch = Orchestrator::new(state.request_timeout, state.phase_timeout);
        let answer = orch
            .run(Phase::new(vec![list_call, tenants_call]), move |mut results| {
                let tenants = results.pop();
                let databases = results.pop();
                let tenants = match tenants {
                    Some(Ok(CpEvent::Tenants(doc))) => doc,
                    Some(Err(e)) => return Decision::Finish(HttpAnswer::error(&e)),
                    _ => {
                        return Decision::Finish(HttpAnswer::error(&GatewayError::Internal(
                            "tenant listing missing".into(),
                        )))
                    }
                };
                // the answer degrades to the live view when the control
                // plane cannot list databases
                let mut cp_databases = match databases {
                    Some(Ok(CpEvent::Databases(op))) => match op.into_result() {
                        Ok(op) => extract_databases(op.result.as_ref()),
                        Err(e) => {
                            log::warn!("database listing unavailable: {e}");
                            Vec::new()
                        }
                    },
                    Some(Err(e)) => {
                        log::warn!("database listing unavailable: {e}");
                        Vec::new()
                    }
                    _ => Vec::new(),
                };
                if let Some(location) = &location_filter {
                    cp_databases.retain(|db| {
                        db.get("location_id").and_then(|v| v.as_str()) == Some(location.as_str())
                    });
                }
                let doc = join_databases(&tenants, &cp_databases, filter_database.as_deref());
                Decision::Finish(HttpAnswer::json(StatusCode::OK, &doc))
            })
            .await;
        Ok(answer)
    }
}

fn extract_databases(result: Option<&Value>) -> Vec<Value> {
    result
        .and_then(|r| r.get("databases"))
        .and_then(|d| d.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Join live tenants with their control-plane records into the
/// `{"databases": [...]}` answer shape. The list is sorted by name unless
/// the caller asked for a single database.
fn join_databases(doc: &Value, cp_databases: &[Value], filter_database: Option<&str>) -> Value {
    let mut tenants: Vec<Value> = doc
        .get("TenantInfo")
        .and_then(|t| t.as_array())
        .cloned()
        .unwrap_or_default();
    if filter_database.is_none() {
        tenants.sort_by_key(|t| {
            t.get("Name")
                .and_then(|n| n.as_str())
                .unwrap_or("")
                .to_string()
        });
    }

    let mut databases: Vec<Value> = Vec::new();
    for mut tenant in tenants {
        if let Some(filter) = filter_database {
            if tenant.get("Name").and_then(|n| n.as_str()) != Some(filter) {
                continue;
            }
        }
        if let Some(record) = find_record(&tenant, cp_databases) {
            if let Value::Object(obj) = &mut tenant {
                obj.insert("ControlPlane".into(), record);
            }
        }
        databases.push(tenant);
    }

    attach_monitoring_endpoints(&mut databases);
    json!({ "databases": databases })
}

/// The control-plane record of a tenant, matched through the
/// `database_id` user attribute first and the tenant name second.
fn find_record(tenant: &Value, cp_databases: &[Value]) -> Option<Value> {
    let by_field = |field: &str, wanted: &str| {
        cp_databases
            .iter()
            .find(|db| db.get(field).and_then(|v| v.as_str()) == Some(wanted))
    };
    if let Some(database_id) = tenant
        .get("UserAttributes")
        .and_then(|a| a.get("database_id"))
        .and_then(|v| v.as_str())
    {
        if let Some(db) = by_field("id", database_id).or_else(|| by_field("name", database_id)) {
            return Some(db.clone());
        }
    }
    let name = tenant.get("Name").and_then(|v| v.as_str())?;
    by_field("name", name).cloned()
}

/// Attach a monitoring address picked from a random node of each
/// database, then drop the node lists to keep the answer small.
/// Serverless databases carry no nodes of their own; they borrow the
/// nodes of the resource database their `ResourceId` names.
fn attach_monitoring_endpoints(databases: &mut [Value]) {
    let index: HashMap<String, usize> = databases
        .iter()
        .enumerate()
        .filter_map(|(i, db)| Some((db.get("Id")?.as_str()?.to_string(), i)))
        .collect();

    let mut endpoints: Vec<(usize, Option<String>)> = Vec::new();
    for &i in index.values() {
        let mut data = &databases[i];
        if data.get("Nodes").is_none() {
            if let Some(resource) = data.get("ResourceId").and_then(|v| v.as_str()) {
                if let Some(&j) = index.get(resource) {
                    data = &databases[j];
                }
            }
        }
        endpoints.push((i, monitoring_endpoint(data)));
    }
    for (i, endpoint) in endpoints {
        if let Value::Object(obj) = &mut databases[i] {
            if let Some(endpoint) = endpoint {
                obj.insert("MonitoringEndpoint".into(), json!(endpoint));
            }
            obj.remove("Nodes");
        }
    }
}

/// Monitoring address of a random node. Spreading viewer traffic over
/// the nodes keeps one node from serving every deep link.
fn monitoring_endpoint(data: &Value) -> Option<String> {
    let nodes = data.get("Nodes")?.as_array()?;
    if nodes.is_empty() {
        return None;
    }
    let node = &nodes[rand::thread_rng().gen_range(0..nodes.len())];
    let host = node.get("Host")?.as_str()?;
    let address = node
        .get("Endpoints")?
        .as_array()?
        .iter()
        .find(|e| e.get("Name").and_then(|n| n.as_str()) == Some("http-mon"))?
        .get("Address")?
        .as_str()?;
    Some(format!("{host}{address}"))
}
