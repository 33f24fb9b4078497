//! Mapper chain and pipeline stage handling.
//!
//! The mapper chain runs the global transformer and then the namespace
//! transformer for every event that carries a document. Each step sees the
//! output document of the previous one; metadata overrides accumulate with
//! later steps winning.
//!
//! Pipelines returned by a [`PipelineBuilder`](crate::plugins::PipelineBuilder)
//! are reduced here to an equality selector. Only `$match` stages are
//! understood.

use anyhow::{bail, Context, Result};
use docsync_core::meta::MetaOverrides;
use docsync_core::models::{ChangeEvent, Document};
use serde_json::Value;

use crate::plugins::{PluginRegistry, TransformAction, TransformInput};

/// Result of running the chain over one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Mapped {
    /// Write the (possibly replaced) document with these overrides.
    Write(MetaOverrides),
    /// No index write for this event.
    Drop,
    /// No index write, but the event counts as applied.
    Skip,
}

/// Run every transformer for the event's namespace, rewriting
/// `event.document` in place.
pub fn apply_mappers(plugins: &PluginRegistry, event: &mut ChangeEvent) -> Result<Mapped> {
    let transformers = plugins.transformers_for(&event.namespace);
    let mut meta = MetaOverrides::default();
    if transformers.is_empty() {
        return Ok(Mapped::Write(meta));
    }
    let Some(mut document) = event.document.take() else {
        return Ok(Mapped::Write(meta));
    };

    for t in transformers {
        let output = {
            let input = TransformInput {
                namespace: &event.namespace,
                operation: event.operation,
                document: &document,
                update: event.update_description.as_ref(),
            };
            t.transform(&input)?
        };
        meta.merge(output.meta);
        match output.action {
            TransformAction::Passthrough => {}
            TransformAction::Replace(doc) => document = doc,
            TransformAction::Drop => return Ok(Mapped::Drop),
            TransformAction::Skip => return Ok(Mapped::Skip),
        }
    }

    event.document = Some(document);
    if meta.skip {
        return Ok(Mapped::Skip);
    }
    Ok(Mapped::Write(meta))
}

/// Reduce aggregation stages to a single equality selector.
///
/// `None` when there are no stages. Multiple `$match` stages are merged.
pub fn pipeline_selector(stages: &[Value]) -> Result<Option<Document>> {
    let mut selector = Document::new();
    for stage in stages {
        let Some(obj) = stage.as_object() else {
            bail!("pipeline stage must be an object, got {}", stage);
        };
        let (op, body) = match obj.iter().next() {
            Some(entry) if obj.len() == 1 => entry,
            _ => bail!("pipeline stage must have exactly one operator: {}", stage),
        };
        match (op.as_str(), body) {
            ("$match", Value::Object(m)) => {
                selector.extend(m.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            ("$match", _) => bail!("$match takes an object"),
            (other, _) => bail!("unsupported pipeline stage '{}': only $match is supported", other),
        }
    }
    Ok((!stages.is_empty()).then_some(selector))
}

/// Selector for a namespace from its registered pipeline builder.
pub fn namespace_selector(
    plugins: &PluginRegistry,
    namespace: &str,
    change_events: bool,
) -> Result<Option<Document>> {
    match plugins.pipeline_for(namespace) {
        Some(builder) => pipeline_selector(&builder.pipeline(namespace, change_events)?),
        None => Ok(None),
    }
}

/// [`namespace_selector`] on a blocking thread, since pipeline builders may
/// run scripts.
pub async fn load_selector(
    plugins: &PluginRegistry,
    namespace: &str,
    change_events: bool,
) -> Result<Option<Document>> {
    if !plugins.has_pipelines() {
        return Ok(None);
    }
    let plugins = plugins.clone();
    let namespace = namespace.to_string();
    tokio::task::spawn_blocking(move || namespace_selector(&plugins, &namespace, change_events))
        .await
        .context("pipeline task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{TransformOutput, Transformer};
    use docsync_core::models::DocId;
    use serde_json::json;
    use std::sync::Arc;

    struct AddField(&'static str);

    impl Transformer for AddField {
        fn name(&self) -> &str {
            self.0
        }

        fn transform(&self, input: &TransformInput) -> Result<TransformOutput> {
            let mut doc = input.document.clone();
            doc.insert(self.0.to_string(), json!(true));
            Ok(TransformOutput::replace(doc).with_meta(MetaOverrides {
                index: Some(format!("idx-{}", self.0)),
                ..Default::default()
            }))
        }
    }

    struct Dropper;

    impl Transformer for Dropper {
        fn name(&self) -> &str {
            "dropper"
        }

        fn transform(&self, _input: &TransformInput) -> Result<TransformOutput> {
            Ok(TransformOutput::drop())
        }
    }

    fn event() -> ChangeEvent {
        let doc = json!({"_id": 1, "a": 1}).as_object().unwrap().clone();
        ChangeEvent::insert("db.col", DocId::Int(1), doc)
    }

    #[test]
    fn test_global_then_namespace() {
        let mut reg = PluginRegistry::new();
        reg.register_transformer(None, Arc::new(AddField("global"))).unwrap();
        reg.register_transformer(Some("db.col"), Arc::new(AddField("local"))).unwrap();
        let mut e = event();
        let mapped = apply_mappers(&reg, &mut e).unwrap();
        let doc = e.document.unwrap();
        assert_eq!(doc.get("global"), Some(&json!(true)));
        assert_eq!(doc.get("local"), Some(&json!(true)));
        match mapped {
            Mapped::Write(meta) => assert_eq!(meta.index.as_deref(), Some("idx-local")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_drop_stops_chain() {
        let mut reg = PluginRegistry::new();
        reg.register_transformer(None, Arc::new(Dropper)).unwrap();
        reg.register_transformer(Some("db.col"), Arc::new(AddField("local"))).unwrap();
        let mut e = event();
        assert_eq!(apply_mappers(&reg, &mut e).unwrap(), Mapped::Drop);
    }

    #[test]
    fn test_no_document_passes_untouched() {
        let mut reg = PluginRegistry::new();
        reg.register_transformer(None, Arc::new(Dropper)).unwrap();
        let mut e = ChangeEvent::delete("db.col", DocId::Int(1));
        assert_eq!(
            apply_mappers(&reg, &mut e).unwrap(),
            Mapped::Write(MetaOverrides::default())
        );
    }

    #[test]
    fn test_match_stages_merge() {
        let sel = pipeline_selector(&[json!({"$match": {"a": 1}}), json!({"$match": {"b.c": "x"}})])
            .unwrap()
            .unwrap();
        assert_eq!(Value::Object(sel), json!({"a": 1, "b.c": "x"}));
        assert!(pipeline_selector(&[]).unwrap().is_none());
        assert!(pipeline_selector(&[json!({"$project": {"a": 1}})]).is_err());
    }
}
