//! Declarative JSON aggregation.
//!
//! Responses from several peers are folded into one document under
//! path-addressed rules. A peer contributes root-shaped fragments through
//! its mappers (or its whole body when it has none), fragments merge
//! structurally, then reducers collapse grouped arrays and filters rewrite
//! values in place. Reducers are associative, so the merged document does
//! not depend on peer completion order.
//!
//! Path expressions address values in the merged document: `.` is the
//! root, `.clusters` an object key, `.clusters[]` every element of an
//! array, `.clusters[].versions[].count` a field of nested elements.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::core::error::GatewayError;

/// One step of a parsed path expression.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Step {
    Key(String),
    Each,
}

fn parse_path(expr: &str) -> Vec<Step> {
    let mut steps = Vec::new();
    for seg in expr.trim_start_matches('.').split('.') {
        if seg.is_empty() {
            continue;
        }
        let (name, each) = match seg.strip_suffix("[]") {
            Some(name) => (name, true),
            None => (seg, false),
        };
        if !name.is_empty() {
            steps.push(Step::Key(name.to_string()));
        }
        if each {
            steps.push(Step::Each);
        }
    }
    steps
}

fn visit<'a>(value: &'a Value, steps: &[Step], f: &mut dyn FnMut(&'a Value) -> bool) -> bool {
    match steps.first() {
        None => f(value),
        Some(Step::Key(k)) => match value.get(k) {
            Some(child) => visit(child, &steps[1..], f),
            None => true,
        },
        Some(Step::Each) => {
            if let Value::Array(items) = value {
                for item in items {
                    if !visit(item, &steps[1..], f) {
                        return false;
                    }
                }
            }
            true
        }
    }
}

fn visit_mut(value: &mut Value, steps: &[Step], f: &mut dyn FnMut(&mut Value)) {
    match steps.first() {
        None => f(value),
        Some(Step::Key(k)) => {
            if let Some(child) = value.get_mut(k) {
                visit_mut(child, &steps[1..], f);
            }
        }
        Some(Step::Each) => {
            if let Value::Array(items) = value {
                for item in items {
                    visit_mut(item, &steps[1..], f);
                }
            }
        }
    }
}

/// Mutable context handed to mappers. Setting `stop` ends processing of
/// the current peer document.
#[derive(Default)]
pub struct MergeContext {
    pub stop: bool,
    pub notes: Vec<String>,
}

pub type Mapper = Arc<dyn Fn(&Value, &mut MergeContext) -> Option<Value> + Send + Sync>;
pub type Filter = Arc<dyn Fn(&mut Value) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&str) -> Value + Send + Sync>;

/// Reduction applied at a path of the merged document.
#[derive(Clone, Debug)]
pub enum Reducer {
    /// Group array elements sharing the named key values into one element.
    GroupBy(Vec<String>),
    /// Numeric addition of the grouped members' values.
    Sum,
    /// All members must agree; a disagreement is noted and the first value
    /// kept.
    Unique,
    /// Union of object maps, adding numeric values of shared keys.
    MapWithSum,
}

/// Global reduce and filter rules of one aggregation.
#[derive(Clone, Default)]
pub struct MergePlan {
    pub reducers: BTreeMap<String, Reducer>,
    pub filters: BTreeMap<String, Filter>,
}

/// One peer's contribution: its fetch outcome plus the rules shaping it.
pub struct MergeSource {
    pub name: String,
    pub result: Result<Value, GatewayError>,
    /// Mappers keyed by path into the peer document, applied in order.
    /// Each produces a fragment shaped like the merged document root.
    pub mappers: Vec<(String, Mapper)>,
    /// Replaces the default `{"error": ...}` fragment on peer failure.
    pub error_handler: Option<ErrorHandler>,
}

impl MergeSource {
    pub fn document(name: &str, doc: Value) -> Self {
        Self {
            name: name.to_string(),
            result: Ok(doc),
            mappers: Vec::new(),
            error_handler: None,
        }
    }
}

pub struct MergeOutput {
    pub doc: Value,
    /// Internal consistency notes (for example unique-value disagreements).
    pub notes: Vec<String>,
}

/// Merge peer outcomes into one document under `plan`.
pub fn merge(sources: Vec<MergeSource>, plan: &MergePlan) -> MergeOutput {
    let mut doc = Value::Null;
    let mut notes = Vec::new();

    for source in sources {
        for frag in source_fragments(source, &mut notes) {
            fold(&mut doc, frag, &mut notes);
        }
    }

    // Grouping passes run in path order, outer arrays before nested ones.
    let reducers = plan.reducers.clone();
    for (path, reducer) in &reducers {
        if let Reducer::GroupBy(keys) = reducer {
            let steps = parse_path(path);
            visit_mut(&mut doc, &steps, &mut |v| {
                if let Value::Array(items) = v {
                    let taken = std::mem::take(items);
                    *items = group_items(taken, keys, path, &reducers, &mut notes);
                }
            });
        }
    }

    for (path, filter) in &plan.filters {
        let steps = parse_path(path);
        visit_mut(&mut doc, &steps, &mut |v| filter(v));
    }

    for note in &notes {
        log::warn!("merge inconsistency: {note}");
    }

    MergeOutput { doc, notes }
}

fn source_fragments(source: MergeSource, notes: &mut Vec<String>) -> Vec<Value> {
    match source.result {
        Err(e) => {
            let msg = e.to_string();
            log::debug!("peer {} failed: {msg}", source.name);
            let frag = match &source.error_handler {
                Some(handler) => handler(&msg),
                None => json!({"error": msg}),
            };
            vec![frag]
        }
        Ok(doc) => {
            if source.mappers.is_empty() {
                return vec![doc];
            }
            let mut ctx = MergeContext::default();
            let mut frags = Vec::new();
            for (path, mapper) in &source.mappers {
                let steps = parse_path(path);
                visit(&doc, &steps, &mut |value| {
                    if let Some(frag) = mapper(value, &mut ctx) {
                        frags.push(frag);
                    }
                    !ctx.stop
                });
                if ctx.stop {
                    break;
                }
            }
            notes.append(&mut ctx.notes);
            frags
        }
    }
}

/// Structural fold of one fragment into the accumulator: objects union
/// recursively, arrays concatenate, the first scalar wins.
fn fold(acc: &mut Value, frag: Value, notes: &mut Vec<String>) {
    match (acc, frag) {
        (acc @ Value::Null, frag) => *acc = frag,
        (_, Value::Null) => {}
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                match a.get_mut(&k) {
                    Some(slot) => fold(slot, v, notes),
                    None => {
                        a.insert(k, v);
                    }
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => a.extend(b),
        (a, b) => {
            if *a != b {
                log::debug!("fold conflict, keeping first value: {a} vs {b}");
            }
        }
    }
}

fn group_items(
    items: Vec<Value>,
    keys: &[String],
    base_path: &str,
    reducers: &BTreeMap<String, Reducer>,
    notes: &mut Vec<String>,
) -> Vec<Value> {
    let elem_path = format!("{base_path}[]");
    let mut groups: Vec<(String, Value)> = Vec::new();

    for item in items {
        let group_key: String = keys
            .iter()
            .map(|k| match item.get(k) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            })
            .collect::<Vec<_>>()
            .join("\u{1f}");

        match groups.iter_mut().find(|(k, _)| *k == group_key) {
            Some((_, acc)) => merge_members(acc, item, &elem_path, reducers, notes),
            None => groups.push((group_key, item)),
        }
    }

    // Key order, not arrival order, so the result is permutation independent.
    groups.sort_by(|a, b| a.0.cmp(&b.0));
    groups.into_iter().map(|(_, v)| v).collect()
}

/// Merge one grouped member into the accumulated element, honoring leaf
/// reducers addressed relative to `elem_path`.
fn merge_members(
    acc: &mut Value,
    member: Value,
    elem_path: &str,
    reducers: &BTreeMap<String, Reducer>,
    notes: &mut Vec<String>,
) {
    match (acc, member) {
        (acc @ Value::Null, member) => *acc = member,
        (_, Value::Null) => {}
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                let child_path = format!("{elem_path}.{k}");
                match a.get_mut(&k) {
                    None => {
                        a.insert(k, v);
                    }
                    Some(slot) => match reducers.get(&child_path) {
                        Some(Reducer::Sum) => *slot = add_numbers(slot, &v),
                        Some(Reducer::Unique) => {
                            if *slot != v {
                                notes.push(format!(
                                    "conflicting values at {child_path}: {slot} vs {v}"
                                ));
                            }
                        }
                        Some(Reducer::MapWithSum) => map_sum(slot, v),
                        _ => merge_members(slot, v, &child_path, reducers, notes),
                    },
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => a.extend(b),
        (a, b) => {
            if *a != b {
                log::debug!("group merge conflict, keeping first value: {a} vs {b}");
            }
        }
    }
}

fn add_numbers(a: &Value, b: &Value) -> Value {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return json!(x + y);
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return json!(x + y);
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => json!(x + y),
        _ => a.clone(),
    }
}

/// Union of two object maps, adding numeric values of shared keys.
fn map_sum(acc: &mut Value, other: Value) {
    if let (Value::Object(a), Value::Object(b)) = (acc, other) {
        for (k, v) in b {
            match a.get_mut(&k) {
                Some(slot) => *slot = add_numbers(slot, &v),
                None => {
                    a.insert(k, v);
                }
            }
        }
    }
}
