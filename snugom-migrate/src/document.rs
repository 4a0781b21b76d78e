//! Document model shared by every backend.
//!
//! Documents are JSON objects carrying an `_id`. Filters understand plain
//! equality plus `$ne`, `$exists` and `$in`; updates understand `$set`,
//! `$unset`, `$inc` and `$setOnInsert`, or a replacement document. The Lua
//! scripts in `lua/` implement the same rules server-side.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::{
    errors::{MigrationError, MigrationResult},
    id::generate_document_id,
    statement::{SortKey, SortOrder},
};

pub type Document = Map<String, Value>;

pub const ID_FIELD: &str = "_id";

/// Storage key for a document id. Strings are used verbatim, everything else
/// by its JSON text, so `1` and `"1"` share a slot.
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Assigns a generated `_id` when the document has none.
pub fn ensure_id(doc: &mut Document) -> String {
    if let Some(id) = doc.get(ID_FIELD) {
        return id_key(id);
    }
    let id = generate_document_id();
    doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
    id
}

pub fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(field, condition)| field_matches(doc.get(field), condition))
}

fn field_matches(actual: Option<&Value>, condition: &Value) -> bool {
    match condition {
        Value::Object(ops) if is_operator_object(ops) => ops.iter().all(|(op, operand)| match op.as_str() {
            "$ne" => !values_equal(actual, operand),
            "$exists" => actual.is_some() == operand.as_bool().unwrap_or(true),
            "$in" => operand
                .as_array()
                .is_some_and(|candidates| candidates.iter().any(|c| values_equal(actual, c))),
            "$eq" => values_equal(actual, operand),
            _ => false,
        }),
        expected => values_equal(actual, expected),
    }
}

fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

/// Missing fields compare equal to `null`.
fn values_equal(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (None | Some(Value::Null), Value::Null) => true,
        (None, _) => false,
        (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Some(a), b) => a == b,
    }
}

pub fn is_operator_update(update: &Document) -> bool {
    update.keys().any(|k| k.starts_with('$'))
}

/// Applies an update to `doc` in place.
pub fn apply_update(doc: &mut Document, update: &Document, inserting: bool) -> MigrationResult<()> {
    if !is_operator_update(update) {
        let id = doc.get(ID_FIELD).cloned();
        *doc = update.clone();
        if let Some(id) = id {
            doc.insert(ID_FIELD.to_string(), id);
        }
        return Ok(());
    }

    for (op, fields) in update {
        let fields = fields.as_object().ok_or_else(|| MigrationError::Other {
            message: format!("update operator {op} expects a document").into(),
        })?;
        match op.as_str() {
            "$set" => {
                for (field, value) in fields {
                    doc.insert(field.clone(), value.clone());
                }
            }
            "$setOnInsert" => {
                if inserting {
                    for (field, value) in fields {
                        doc.insert(field.clone(), value.clone());
                    }
                }
            }
            "$unset" => {
                for field in fields.keys() {
                    doc.remove(field);
                }
            }
            "$inc" => {
                for (field, delta) in fields {
                    let next = match (doc.get(field), delta) {
                        (None | Some(Value::Null), d) => d.clone(),
                        (Some(Value::Number(a)), Value::Number(b)) => add_numbers(a, b),
                        _ => {
                            return Err(MigrationError::Other {
                                message: format!("cannot $inc non-numeric field {field}").into(),
                            });
                        }
                    };
                    doc.insert(field.clone(), next);
                }
            }
            other => {
                return Err(MigrationError::Other {
                    message: format!("unsupported update operator {other}").into(),
                });
            }
        }
    }
    Ok(())
}

fn add_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Value {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => Value::from(x.saturating_add(y)),
        _ => Value::from(a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default()),
    }
}

/// Document inserted by an upsert that matched nothing.
pub fn upsert_seed(filter: &Document, update: &Document) -> MigrationResult<Document> {
    let mut doc = Document::new();
    if is_operator_update(update) {
        for (field, condition) in filter {
            if !matches!(condition, Value::Object(ops) if is_operator_object(ops)) {
                doc.insert(field.clone(), condition.clone());
            }
        }
    } else if let Some(id) = filter.get(ID_FIELD) {
        doc.insert(ID_FIELD.to_string(), id.clone());
    }
    apply_update(&mut doc, update, true)?;
    ensure_id(&mut doc);
    Ok(doc)
}

/// Keeps only the named fields, in the order requested.
pub fn project(doc: &Document, fields: &[String]) -> Document {
    fields
        .iter()
        .filter_map(|field| doc.get(field).map(|value| (field.clone(), value.clone())))
        .collect()
}

pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(Value::Object(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Bool(_)) => 5,
        }
    }
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .unwrap_or_default()
            .partial_cmp(&y.as_f64().unwrap_or_default())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

pub fn sort_documents(docs: &mut [Document], keys: &[SortKey]) {
    docs.sort_by(|a, b| {
        keys.iter()
            .map(|key| {
                let ord = compare_values(a.get(&key.field), b.get(&key.field));
                match key.order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            })
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
}

/// Evaluates an aggregation pipeline over an in-memory document set.
///
/// Supported stages: `$match`, `$sort`, `$skip`, `$limit`, `$project`
/// (inclusion only) and `$count`.
pub fn run_pipeline(mut docs: Vec<Document>, pipeline: &[Value]) -> MigrationResult<Vec<Document>> {
    for stage in pipeline {
        let stage = stage.as_object().filter(|s| s.len() == 1).ok_or_else(|| MigrationError::Other {
            message: "aggregation stage must be a single-key document".into(),
        })?;
        let Some((name, operand)) = stage.iter().next() else {
            continue;
        };
        match name.as_str() {
            "$match" => {
                let filter = operand.as_object().cloned().unwrap_or_default();
                docs.retain(|doc| matches(doc, &filter));
            }
            "$sort" => {
                let keys: Vec<SortKey> = operand
                    .as_object()
                    .into_iter()
                    .flatten()
                    .map(|(field, dir)| SortKey {
                        field: field.clone(),
                        order: if dir.as_i64() == Some(-1) { SortOrder::Desc } else { SortOrder::Asc },
                    })
                    .collect();
                sort_documents(&mut docs, &keys);
            }
            "$skip" => {
                let n = operand.as_u64().unwrap_or(0) as usize;
                docs = docs.into_iter().skip(n).collect();
            }
            "$limit" => {
                docs.truncate(operand.as_u64().unwrap_or(0) as usize);
            }
            "$project" => {
                let fields: Vec<String> = operand
                    .as_object()
                    .into_iter()
                    .flatten()
                    .filter(|(_, include)| include.as_i64() == Some(1) || include.as_bool() == Some(true))
                    .map(|(field, _)| field.clone())
                    .collect();
                docs = docs.iter().map(|doc| project(doc, &fields)).collect();
            }
            "$count" => {
                let field = operand.as_str().unwrap_or("count").to_string();
                let mut out = Document::new();
                out.insert(field, Value::from(docs.len() as u64));
                docs = vec![out];
            }
            other => {
                return Err(MigrationError::Other {
                    message: format!("unsupported aggregation stage {other}").into(),
                });
            }
        }
    }
    Ok(docs)
}

/// Shorthand for building documents from `json!` literals.
pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}
