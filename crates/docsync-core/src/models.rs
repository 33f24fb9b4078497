//! Core data models used throughout docsync.
//!
//! A [`ChangeEvent`] is the unit of work that flows from the readers through
//! the filter, relate, mapping and indexing stages. Identifiers coming from
//! the source store are heterogeneous, so they are carried as a [`DocId`]
//! with a total conversion to the string form used for index document ids.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A JSON document as stored in the source and sent to the index.
pub type Document = serde_json::Map<String, Value>;

/// Field holding the document identifier in source documents.
pub const ID_FIELD: &str = "_id";

/// Source document identifier.
///
/// Values arrive as JSON, using the extended forms `{"$oid": "<hex>"}` for
/// object ids and `{"$binary": {"base64": "...", "subType": "00"}}` for
/// binary ids. Anything else that is an object is treated as a structured id.
#[derive(Debug, Clone, PartialEq)]
pub enum DocId {
    ObjectId(String),
    String(String),
    Int(i64),
    Float(f64),
    Binary { subtype: u8, bytes: Vec<u8> },
    Document(Document),
}

impl DocId {
    /// Parse an identifier from its JSON representation.
    ///
    /// Returns `None` for `null`, booleans and arrays, which the source store
    /// never uses as identifiers.
    pub fn from_value(value: &Value) -> Option<DocId> {
        match value {
            Value::String(s) => Some(DocId::String(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(DocId::Int(i))
                } else {
                    n.as_f64().map(DocId::Float)
                }
            }
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(Value::String(hex)) = map.get("$oid") {
                        return Some(DocId::ObjectId(hex.to_lowercase()));
                    }
                    if let Some(Value::Object(bin)) = map.get("$binary") {
                        let data = bin.get("base64").and_then(|v| v.as_str());
                        let subtype = bin
                            .get("subType")
                            .and_then(|v| v.as_str())
                            .and_then(|s| u8::from_str_radix(s, 16).ok())
                            .unwrap_or(0);
                        if let Some(bytes) = data.and_then(|d| STANDARD.decode(d).ok()) {
                            return Some(DocId::Binary { subtype, bytes });
                        }
                    }
                }
                Some(DocId::Document(map.clone()))
            }
            _ => None,
        }
    }

    /// Read the `_id` field of a document.
    pub fn from_document(doc: &Document) -> Option<DocId> {
        doc.get(ID_FIELD).and_then(DocId::from_value)
    }

    /// Convert back to the JSON representation accepted by [`DocId::from_value`].
    pub fn to_value(&self) -> Value {
        match self {
            DocId::ObjectId(hex) => serde_json::json!({ "$oid": hex }),
            DocId::String(s) => Value::String(s.clone()),
            DocId::Int(i) => Value::from(*i),
            DocId::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            DocId::Binary { subtype, bytes } => serde_json::json!({
                "$binary": { "base64": STANDARD.encode(bytes), "subType": format!("{:02x}", subtype) }
            }),
            DocId::Document(map) => Value::Object(map.clone()),
        }
    }

    /// Stable string form used as the index document id and for metadata keys.
    ///
    /// Integral floats render without a fractional part so that `1.0` and `1`
    /// address the same index document. Structured ids render as compact JSON
    /// with sorted keys.
    pub fn to_stable_string(&self) -> String {
        match self {
            DocId::ObjectId(hex) => hex.clone(),
            DocId::String(s) => s.clone(),
            DocId::Int(i) => i.to_string(),
            DocId::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() && f.abs() < 9.007_199_254_740_992e15 {
                    format!("{}", *f as i64)
                } else {
                    format!("{}", f)
                }
            }
            DocId::Binary { bytes, .. } => STANDARD.encode(bytes),
            DocId::Document(map) => {
                let sorted: std::collections::BTreeMap<&String, &Value> = map.iter().collect();
                serde_json::to_string(&sorted).unwrap_or_default()
            }
        }
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_stable_string())
    }
}

/// Kind of mutation described by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    DropCollection,
    DropDatabase,
}

impl Operation {
    /// Short code stored in the replication log.
    pub fn as_code(&self) -> &'static str {
        match self {
            Operation::Insert => "i",
            Operation::Update => "u",
            Operation::Delete => "d",
            Operation::DropCollection => "c",
            Operation::DropDatabase => "dd",
        }
    }

    pub fn from_code(code: &str) -> Option<Operation> {
        match code {
            "i" => Some(Operation::Insert),
            "u" => Some(Operation::Update),
            "d" => Some(Operation::Delete),
            "c" => Some(Operation::DropCollection),
            "dd" => Some(Operation::DropDatabase),
            _ => None,
        }
    }

    /// Lowercase name exposed to scripts and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::DropCollection => "drop_collection",
            Operation::DropDatabase => "drop_database",
        }
    }

    pub fn is_drop(&self) -> bool {
        matches!(self, Operation::DropCollection | Operation::DropDatabase)
    }
}

/// Where a change event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    LiveFeed,
    DirectRead,
    DerivedJoin,
}

/// Logical position in the replication log: seconds plus an ordinal within
/// that second. Ordering is lexicographic on `(t, i)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpTimestamp {
    pub t: u32,
    pub i: u32,
}

impl OpTimestamp {
    pub fn new(t: u32, i: u32) -> Self {
        Self { t, i }
    }

    /// Current wall clock time, with the ordinal taken from the sub-second part.
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            t: now.timestamp() as u32,
            i: now.timestamp_subsec_nanos(),
        }
    }

    /// Current wall clock time in whole seconds.
    pub fn now_seconds() -> Self {
        Self {
            t: Utc::now().timestamp() as u32,
            i: 0,
        }
    }

    /// External version number: high 32 bits seconds, low 32 bits ordinal.
    pub fn version(&self) -> i64 {
        ((self.t as i64) << 32) | self.i as i64
    }

    /// Inverse of [`OpTimestamp::version`].
    pub fn from_version(version: i64) -> Self {
        Self {
            t: (version >> 32) as u32,
            i: (version & 0xFFFF_FFFF) as u32,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.t == 0 && self.i == 0
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.t as i64, 0)
            .single()
            .unwrap_or_default()
    }
}

impl fmt::Display for OpTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.t, self.i)
    }
}

/// Opaque continuation marker for one replication stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub stream_id: String,
    pub token: Value,
}

/// Partial-update description attached to update events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    #[serde(default)]
    pub updated_fields: Document,
    #[serde(default)]
    pub removed_fields: Vec<String>,
}

impl UpdateDescription {
    /// Flatten into a partial document: updated fields as-is, removed fields as null.
    pub fn to_partial_document(&self) -> Document {
        let mut doc = self.updated_fields.clone();
        for field in &self.removed_fields {
            doc.insert(field.clone(), Value::Null);
        }
        doc
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Normalized record describing one document mutation.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub id: DocId,
    pub namespace: String,
    pub operation: Operation,
    pub document: Option<Document>,
    pub update_description: Option<UpdateDescription>,
    pub source: EventSource,
    pub timestamp: OpTimestamp,
    pub resume_token: Option<ResumeToken>,
}

impl ChangeEvent {
    /// Build a live-feed event with no document payload.
    pub fn new(namespace: impl Into<String>, id: DocId, operation: Operation) -> Self {
        Self {
            id,
            namespace: namespace.into(),
            operation,
            document: None,
            update_description: None,
            source: EventSource::LiveFeed,
            timestamp: OpTimestamp::default(),
            resume_token: None,
        }
    }

    pub fn insert(namespace: impl Into<String>, id: DocId, document: Document) -> Self {
        let mut event = Self::new(namespace, id, Operation::Insert);
        event.document = Some(document);
        event
    }

    pub fn update(namespace: impl Into<String>, id: DocId, document: Document) -> Self {
        let mut event = Self::new(namespace, id, Operation::Update);
        event.document = Some(document);
        event
    }

    pub fn delete(namespace: impl Into<String>, id: DocId) -> Self {
        Self::new(namespace, id, Operation::Delete)
    }

    /// Drop of a whole collection; `namespace` is `db.collection`.
    pub fn drop_collection(namespace: impl Into<String>) -> Self {
        Self::new(namespace, DocId::String(String::new()), Operation::DropCollection)
    }

    /// Drop of a whole database; `namespace` is the database name.
    pub fn drop_database(database: impl Into<String>) -> Self {
        Self::new(database, DocId::String(String::new()), Operation::DropDatabase)
    }

    pub fn with_timestamp(mut self, ts: OpTimestamp) -> Self {
        self.timestamp = ts;
        self
    }

    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }

    pub fn database(&self) -> &str {
        split_namespace(&self.namespace).0
    }

    pub fn collection(&self) -> &str {
        split_namespace(&self.namespace).1
    }

    pub fn is_insert(&self) -> bool {
        self.operation == Operation::Insert
    }

    pub fn is_update(&self) -> bool {
        self.operation == Operation::Update
    }

    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }

    pub fn is_drop(&self) -> bool {
        self.operation.is_drop()
    }

    pub fn is_live(&self) -> bool {
        self.source == EventSource::LiveFeed
    }

    pub fn is_direct(&self) -> bool {
        self.source == EventSource::DirectRead
    }

    /// Copy of the event without its resume token, for fan-out to side stages.
    pub fn detached(&self) -> ChangeEvent {
        let mut copy = self.clone();
        copy.resume_token = None;
        copy
    }
}

/// Split `db.collection` at the first dot. A bare database name yields an
/// empty collection.
pub fn split_namespace(namespace: &str) -> (&str, &str) {
    match namespace.split_once('.') {
        Some((db, col)) => (db, col),
        None => (namespace, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stable_string_forms() {
        assert_eq!(DocId::String("abc".into()).to_stable_string(), "abc");
        assert_eq!(DocId::Int(42).to_stable_string(), "42");
        assert_eq!(DocId::Float(3.0).to_stable_string(), "3");
        assert_eq!(DocId::Float(2.5).to_stable_string(), "2.5");
        let oid = DocId::from_value(&json!({"$oid": "5F1D7E3B9C2A4B6D8E0F1A2B"})).unwrap();
        assert_eq!(oid.to_stable_string(), "5f1d7e3b9c2a4b6d8e0f1a2b");
    }

    #[test]
    fn test_structured_id_is_key_order_independent() {
        let a = DocId::from_value(&json!({"b": 1, "a": 2})).unwrap();
        let b = DocId::from_value(&json!({"a": 2, "b": 1})).unwrap();
        assert_eq!(a.to_stable_string(), b.to_stable_string());
        assert_eq!(a.to_stable_string(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn test_binary_id_roundtrips_through_value() {
        let id = DocId::Binary {
            subtype: 4,
            bytes: vec![1, 2, 3, 250],
        };
        let back = DocId::from_value(&id.to_value()).unwrap();
        assert_eq!(back, id);
        assert_eq!(id.to_stable_string(), "AQID+g==");
    }

    #[test]
    fn test_timestamp_version_layout() {
        let ts = OpTimestamp::new(1_700_000_000, 7);
        assert_eq!(ts.version(), (1_700_000_000i64 << 32) | 7);
        assert_eq!(OpTimestamp::from_version(ts.version()), ts);
        assert!(OpTimestamp::new(5, 1) > OpTimestamp::new(4, 99));
        assert!(OpTimestamp::new(5, 2) > OpTimestamp::new(5, 1));
    }

    #[test]
    fn test_split_namespace() {
        assert_eq!(split_namespace("db.col.sub"), ("db", "col.sub"));
        assert_eq!(split_namespace("db"), ("db", ""));
    }

    #[test]
    fn test_partial_document_marks_removed_fields_null() {
        let mut desc = UpdateDescription::default();
        desc.updated_fields.insert("a".into(), json!(1));
        desc.removed_fields.push("b".into());
        let doc = desc.to_partial_document();
        assert_eq!(doc.get("a"), Some(&json!(1)));
        assert_eq!(doc.get("b"), Some(&Value::Null));
    }
}
