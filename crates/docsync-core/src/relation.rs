//! Relations between namespaces and the selector helpers used to expand them.
//!
//! A [`Relation`] says: when a document in `namespace` changes, find the
//! documents in `with_namespace` whose `match_field` equals the changed
//! document's `src_field`, and re-emit them. Relations are loaded once at
//! startup into a [`RelationTable`] and never change afterwards.
//!
//! Selectors are plain JSON objects. A selector key may be a dotted path
//! (`"a.b"`) or a nested object (`{"a": {"b": v}}`); both are matched
//! field-by-field, so the two forms select the same documents.

use std::collections::HashMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{DocId, Document, ID_FIELD};

/// Coercion applied to the extracted source value before querying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchFieldType {
    #[serde(rename = "objectId")]
    ObjectId,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "int", alias = "long")]
    Int,
    #[serde(rename = "decimal")]
    Decimal,
}

impl MatchFieldType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "objectId" => Some(MatchFieldType::ObjectId),
            "string" => Some(MatchFieldType::String),
            "int" | "long" => Some(MatchFieldType::Int),
            "decimal" => Some(MatchFieldType::Decimal),
            _ => None,
        }
    }
}

/// One configured join.
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub namespace: String,
    pub with_namespace: String,
    pub src_field: String,
    pub match_field: String,
    pub match_field_type: Option<MatchFieldType>,
    pub keep_src: bool,
    pub max_depth: i32,
    pub dot_notation: bool,
}

impl Relation {
    /// A relation from `namespace` to `with_namespace` on `_id`.
    pub fn new(namespace: impl Into<String>, with_namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            with_namespace: with_namespace.into(),
            src_field: ID_FIELD.to_string(),
            match_field: ID_FIELD.to_string(),
            match_field_type: None,
            keep_src: false,
            max_depth: 0,
            dot_notation: false,
        }
    }

    pub fn fields(mut self, src_field: &str, match_field: &str) -> Self {
        self.src_field = if src_field.is_empty() { ID_FIELD } else { src_field }.to_string();
        self.match_field = if match_field.is_empty() { ID_FIELD } else { match_field }.to_string();
        self
    }

    pub fn keep_src(mut self, keep: bool) -> Self {
        self.keep_src = keep;
        self
    }

    pub fn max_depth(mut self, depth: i32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn match_type(mut self, ty: MatchFieldType) -> Self {
        self.match_field_type = Some(ty);
        self
    }

    pub fn dot_notation(mut self, on: bool) -> Self {
        self.dot_notation = on;
        self
    }

    /// Both sides of the join are the document id.
    pub fn is_identity(&self) -> bool {
        self.src_field == ID_FIELD && self.match_field == ID_FIELD
    }

    /// Extract and coerce the value to join on. `None` when the source
    /// document lacks the field.
    pub fn source_value(&self, doc: &Document) -> Result<Option<Value>> {
        match extract_data(&self.src_field, doc) {
            Some(v) if !v.is_null() => Ok(Some(coerce(v, self.match_field_type)?)),
            _ => Ok(None),
        }
    }

    pub fn selector(&self, value: Value) -> Document {
        build_selector(&self.match_field, value, self.dot_notation)
    }
}

/// Relations indexed by source namespace.
#[derive(Debug, Clone, Default)]
pub struct RelationTable {
    by_namespace: HashMap<String, Vec<Relation>>,
}

impl RelationTable {
    pub fn new(relations: impl IntoIterator<Item = Relation>) -> Self {
        let mut by_namespace: HashMap<String, Vec<Relation>> = HashMap::new();
        for r in relations {
            by_namespace.entry(r.namespace.clone()).or_default().push(r);
        }
        Self { by_namespace }
    }

    pub fn is_empty(&self) -> bool {
        self.by_namespace.is_empty()
    }

    pub fn for_namespace(&self, namespace: &str) -> &[Relation] {
        self.by_namespace
            .get(namespace)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn has_relations(&self, namespace: &str) -> bool {
        !self.for_namespace(namespace).is_empty()
    }

    /// Whether the source document of a related namespace is still indexed
    /// on its own. True when any relation on the namespace keeps it.
    pub fn keeps_source(&self, namespace: &str) -> bool {
        let relations = self.for_namespace(namespace);
        relations.is_empty() || relations.iter().any(|r| r.keep_src)
    }
}

/// Read a possibly dotted field path from a document.
pub fn extract_data<'a>(path: &str, doc: &'a Document) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Build an equality selector for `field == value`.
///
/// With `dot_notation` the dotted path is kept as a single key; otherwise it
/// is expanded into nested objects.
pub fn build_selector(field: &str, value: Value, dot_notation: bool) -> Document {
    let mut selector = Document::new();
    if dot_notation || !field.contains('.') {
        selector.insert(field.to_string(), value);
        return selector;
    }
    let mut parts: Vec<&str> = field.split('.').collect();
    let last = parts.pop().unwrap_or(field);
    let mut inner = Document::new();
    inner.insert(last.to_string(), value);
    while let Some(part) = parts.pop() {
        let mut outer = Document::new();
        outer.insert(part.to_string(), Value::Object(inner));
        inner = outer;
    }
    inner
}

/// Coerce an extracted value to the configured match type.
pub fn coerce(value: &Value, ty: Option<MatchFieldType>) -> Result<Value> {
    let Some(ty) = ty else {
        return Ok(value.clone());
    };
    match ty {
        MatchFieldType::ObjectId => match DocId::from_value(value) {
            Some(DocId::ObjectId(hex)) => Ok(serde_json::json!({ "$oid": hex })),
            Some(DocId::String(s)) if is_object_id_hex(&s) => {
                Ok(serde_json::json!({ "$oid": s.to_lowercase() }))
            }
            _ => bail!("cannot coerce {} to objectId", value),
        },
        MatchFieldType::String => match DocId::from_value(value) {
            Some(id) => Ok(Value::String(id.to_stable_string())),
            None => bail!("cannot coerce {} to string", value),
        },
        MatchFieldType::Int => match value {
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Ok(Value::from(i)),
                (None, Some(f)) if f.fract() == 0.0 => Ok(Value::from(f as i64)),
                _ => bail!("cannot coerce {} to int", value),
            },
            Value::String(s) => match s.trim().parse::<i64>() {
                Ok(i) => Ok(Value::from(i)),
                Err(_) => bail!("cannot coerce {:?} to int", s),
            },
            _ => bail!("cannot coerce {} to int", value),
        },
        MatchFieldType::Decimal => match value {
            Value::Number(n) => match n.as_f64() {
                Some(f) => Ok(Value::from(f)),
                None => bail!("cannot coerce {} to decimal", value),
            },
            Value::String(s) => match s.trim().parse::<f64>() {
                Ok(f) => Ok(Value::from(f)),
                Err(_) => bail!("cannot coerce {:?} to decimal", s),
            },
            _ => bail!("cannot coerce {} to decimal", value),
        },
    }
}

fn is_object_id_hex(s: &str) -> bool {
    s.len() == 24 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Flatten a selector into `(dotted path, expected value)` pairs.
///
/// Objects whose keys start with `$` (extended JSON such as `{"$oid": ..}`)
/// are values, not nesting.
pub fn flatten_selector(selector: &Document) -> Vec<(String, Value)> {
    fn walk(prefix: &str, map: &Document, out: &mut Vec<(String, Value)>) {
        for (key, value) in map {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", prefix, key)
            };
            match value {
                Value::Object(inner)
                    if !inner.is_empty() && !inner.keys().any(|k| k.starts_with('$')) =>
                {
                    walk(&path, inner, out)
                }
                other => out.push((path, other.clone())),
            }
        }
    }
    let mut out = Vec::new();
    walk("", selector, &mut out);
    out
}

/// Whether a document satisfies an equality selector.
///
/// Numbers compare by value (`5` matches `5.0`) and an array field matches
/// when any element equals the expected value.
pub fn matches_selector(doc: &Document, selector: &Document) -> bool {
    flatten_selector(selector)
        .iter()
        .all(|(path, expected)| match extract_data(path, doc) {
            Some(actual) => values_match(actual, expected),
            None => expected.is_null(),
        })
}

fn values_match(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        (Value::Array(items), e) if !e.is_array() => items.iter().any(|i| values_match(i, e)),
        (a, e) => a == e,
    }
}
