//! Conversions from bson values to the json documents a search index understands.
use bson::{Bson, Document};
use chrono::{TimeZone, Utc};
use serde_json::{Map, Value};

use crate::ID_KEY;

/// Map a mongodb `_id` to an index document identifier.
///
/// ObjectId becomes its hex form, strings and integers are used as they are, anything else
/// is rendered as relaxed extended json.
pub fn doc_id(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        Bson::Int32(i) => i.to_string(),
        Bson::Int64(i) => i.to_string(),
        other => other.clone().into_relaxed_extjson().to_string(),
    }
}

/// Convert a mongodb document into an index document, `_id` is removed because it's carried
/// by the bulk request metadata.
pub fn to_index_doc(doc: &Document) -> Map<String, Value> {
    doc.iter()
        .filter(|(k, _)| k.as_str() != ID_KEY)
        .map(|(k, v)| (k.clone(), to_index_value(v)))
        .collect()
}

/// Convert one bson value into json.
pub fn to_index_value(value: &Bson) -> Value {
    match value {
        Bson::Document(d) => Value::Object(
            d.iter()
                .map(|(k, v)| (k.clone(), to_index_value(v)))
                .collect(),
        ),
        Bson::Array(items) => Value::Array(items.iter().map(to_index_value).collect()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => match Utc.timestamp_millis_opt(dt.timestamp_millis()).single() {
            Some(d) => Value::String(d.to_rfc3339()),
            None => Value::from(dt.timestamp_millis()),
        },
        other => other.clone().into_relaxed_extjson(),
    }
}

/// Insert `value` into `target` under a dotted `path`, creating intermediate objects.
///
/// Returns false when an intermediate path segment already holds a non-object value.
pub fn set_path(target: &mut Map<String, Value>, path: &str, value: Value) -> bool {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
            true
        }
        Some((head, rest)) => {
            let child = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match child {
                Value::Object(map) => set_path(map, rest, value),
                _ => false,
            }
        }
    }
}

/// Deep merge `patch` into `target`: objects are merged key by key, any other value replaces.
pub fn merge(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge(existing, incoming),
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// true when any segment of a dotted path is an array index, like `tags.1`.
pub fn is_array_path(path: &str) -> bool {
    path.split('.')
        .any(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()) || seg == "$")
}
