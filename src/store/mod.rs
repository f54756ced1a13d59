//! Shared metadata store access.
//!
//! The gateway reads its fleet description (cluster records, version color
//! table) from a shared store and coordinates refresh ownership through
//! conditional writes on lease rows. `MetaStore` is the seam; the etcd
//! backend is what ships, the in-memory backend serves static fleets and
//! tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ClusterSeed;
use crate::core::error::GatewayResult;

pub mod etcd;
pub mod memory;

/// A typed cell of a store result row.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    Text(String),
    Json(Value),
}

impl CellValue {
    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => json!(b),
            CellValue::Int(i) => json!(i),
            CellValue::Uint(u) => json!(u),
            CellValue::Double(d) => json!(d),
            CellValue::Text(s) => json!(s),
            CellValue::Json(v) => v.clone(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Column {
    pub name: String,
}

/// A result set of typed rows, readable positionally or by column name.
#[derive(Clone, Debug, Default)]
pub struct ResultSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<CellValue>>,
}

impl ResultSet {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns
                .iter()
                .map(|c| Column {
                    name: c.to_string(),
                })
                .collect(),
            rows: Vec::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn cell(&self, row: usize, name: &str) -> Option<&CellValue> {
        let idx = self.column_index(name)?;
        self.rows.get(row)?.get(idx)
    }

    /// Generic conversion of every row into a JSON object keyed by column
    /// name. Null cells are omitted.
    pub fn rows_as_json(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let mut obj = serde_json::Map::new();
                for (col, cell) in self.columns.iter().zip(row.iter()) {
                    if !matches!(cell, CellValue::Null) {
                        obj.insert(col.name.clone(), cell.to_json());
                    }
                }
                Value::Object(obj)
            })
            .collect()
    }
}

/// A cluster row of the fleet table.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClusterRecord {
    pub name: String,
    pub balancer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl From<&ClusterSeed> for ClusterRecord {
    fn from(seed: &ClusterSeed) -> Self {
        Self {
            name: seed.name.clone(),
            balancer: seed.balancer.clone(),
            control_plane: seed.control_plane.clone(),
            description: seed.description.clone(),
            location: seed.location.clone(),
        }
    }
}

/// Version-to-color mapping used by the clusters aggregation: a version
/// string starting with `base` renders with the color class at
/// `color_index`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VersionColor {
    pub base: String,
    pub color_index: u32,
}

/// A refresh-ownership lease row. `deadline_ms == 0` marks a tracking row
/// that has never been granted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LeaseRecord {
    pub forward: String,
    pub deadline_ms: u64,
}

impl LeaseRecord {
    pub fn tracking() -> Self {
        Self {
            forward: String::new(),
            deadline_ms: 0,
        }
    }
}

/// A lease row together with the store revision it was read at, for
/// conditional read-modify-write.
#[derive(Clone, Debug)]
pub struct VersionedLease {
    pub record: LeaseRecord,
    pub revision: i64,
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    /// All cluster rows of the fleet table.
    async fn list_clusters(&self) -> GatewayResult<ResultSet>;

    /// One cluster row by name.
    async fn get_cluster(&self, name: &str) -> GatewayResult<Option<ClusterRecord>>;

    /// The version color table. Missing table reads as empty.
    async fn version_colors(&self) -> GatewayResult<Vec<VersionColor>>;

    /// Current lease row for `id`, if any.
    async fn lease_get(&self, id: &str) -> GatewayResult<Option<VersionedLease>>;

    /// Conditionally write a lease row. `expected` is the revision the row
    /// was read at, or `None` when the row must not exist yet. Returns
    /// `false` when the condition no longer held.
    async fn lease_put_if(
        &self,
        id: &str,
        expected: Option<i64>,
        record: &LeaseRecord,
    ) -> GatewayResult<bool>;
}

/// Render cluster records as the fleet table result set.
pub fn clusters_result_set(records: &[ClusterRecord]) -> ResultSet {
    let mut rs = ResultSet::new(&[
        "name",
        "balancer",
        "control_plane",
        "description",
        "location",
    ]);
    for rec in records {
        let opt = |v: &Option<String>| {
            v.as_ref()
                .map(|s| CellValue::Text(s.clone()))
                .unwrap_or(CellValue::Null)
        };
        rs.rows.push(vec![
            CellValue::Text(rec.name.clone()),
            CellValue::Text(rec.balancer.clone()),
            opt(&rec.control_plane),
            opt(&rec.description),
            opt(&rec.location),
        ]);
    }
    rs
}
