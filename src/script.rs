//! Lua implementations of the plugin traits.
//!
//! Each `[[script]]`, `[[filter]]` and `[[pipeline]]` table compiles into one
//! sandboxed VM ([`crate::lua_runtime`]) that stays loaded for the life of
//! the process. Keys of the table other than `namespace`, `path`, `script`
//! and `timeout` are exposed as the global `config`.
//!
//! # Script Interface
//!
//! ```lua
//! -- [[script]]: return a table to replace the document, true to keep it,
//! -- false or nil to drop the event
//! function map(doc, ns, op, update)
//!     doc.full_name = doc.first .. " " .. doc.last
//!     doc._meta = { index = "people", routing = doc.team }
//!     return doc
//! end
//!
//! -- [[filter]]
//! function filter(doc, ns, op, update)
//!     return doc.status ~= "draft"
//! end
//!
//! -- [[pipeline]]
//! function pipeline(ns, change_event)
//!     return { { ["$match"] = { tenant = config.tenant } } }
//! end
//! ```
//!
//! A `_meta` sub-table in the returned document sets metadata overrides; a
//! `_meta.skip = true` suppresses the write.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use docsync_core::meta::MetaOverrides;
use mlua::prelude::*;
use serde_json::Value;

use crate::config::{Config, ScriptConfig};
use crate::lua_runtime::{
    arm_deadline, json_object_to_lua, json_value_to_lua, lua_value_to_json, register_host_apis,
    toml_table_to_lua,
};
use crate::plugins::{
    DocumentFilter, PipelineBuilder, PluginRegistry, TransformInput, TransformOutput, Transformer,
};

const META_KEY: &str = "_meta";

// ═══════════════════════════════════════════════════════════════════════
// VM
// ═══════════════════════════════════════════════════════════════════════

/// A loaded script and the name of the global function it must define.
struct ScriptVm {
    lua: Mutex<Lua>,
    label: String,
    entry: &'static str,
    timeout: Duration,
}

impl ScriptVm {
    fn load(cfg: &ScriptConfig, entry: &'static str) -> Result<Self> {
        let source = cfg.source()?;
        let label = cfg.label();

        let lua = Lua::new();
        register_host_apis(&lua, &label)
            .map_err(|e| anyhow!("Failed to register host APIs for {}: {}", label, e))?;
        let config_table = toml_table_to_lua(&lua, &cfg.extra)
            .map_err(|e| anyhow!("Failed to build config table for {}: {}", label, e))?;
        lua.globals()
            .set("config", config_table)
            .map_err(|e| anyhow!("{}: {}", label, e))?;

        let timeout = Duration::from_secs(cfg.timeout.max(1));
        arm_deadline(&lua, timeout);
        lua.load(&source)
            .set_name(&label)
            .exec()
            .map_err(|e| anyhow!("Failed to load script {}: {}", label, e))?;

        match lua.globals().get::<LuaValue>(entry) {
            Ok(LuaValue::Function(_)) => {}
            _ => bail!("Script {} must define a global function '{}'", label, entry),
        }

        Ok(Self {
            lua: Mutex::new(lua),
            label,
            entry,
            timeout,
        })
    }

    /// Call the entry function with arguments built inside the VM.
    fn call<T>(
        &self,
        build_args: impl FnOnce(&Lua) -> LuaResult<LuaMultiValue>,
        convert: impl FnOnce(LuaValue) -> Result<T>,
    ) -> Result<T> {
        let lua = self.lua.lock().unwrap();
        arm_deadline(&lua, self.timeout);
        let func: LuaFunction = lua
            .globals()
            .get(self.entry)
            .map_err(|e| anyhow!("{}: {}", self.label, e))?;
        let args = build_args(&lua).map_err(|e| anyhow!("{}: {}", self.label, e))?;
        let ret: LuaValue = func
            .call(args)
            .map_err(|e| anyhow!("{}.{} failed: {}", self.label, self.entry, e))?;
        convert(ret)
    }
}

fn event_args(lua: &Lua, input: &TransformInput) -> LuaResult<LuaMultiValue> {
    let doc = LuaValue::Table(json_object_to_lua(lua, input.document)?);
    let ns = LuaValue::String(lua.create_string(input.namespace)?);
    let op = LuaValue::String(lua.create_string(input.operation.name())?);
    let update = match input.update {
        Some(desc) => json_value_to_lua(lua, &desc.to_value())?,
        None => LuaValue::Nil,
    };
    Ok(LuaMultiValue::from_vec(vec![doc, ns, op, update]))
}

// ═══════════════════════════════════════════════════════════════════════
// Plugins
// ═══════════════════════════════════════════════════════════════════════

/// `[[script]]` entry.
pub struct LuaTransformer {
    vm: ScriptVm,
}

impl LuaTransformer {
    pub fn load(cfg: &ScriptConfig) -> Result<Self> {
        Ok(Self {
            vm: ScriptVm::load(cfg, "map")?,
        })
    }
}

impl Transformer for LuaTransformer {
    fn name(&self) -> &str {
        &self.vm.label
    }

    fn transform(&self, input: &TransformInput) -> Result<TransformOutput> {
        self.vm.call(|lua| event_args(lua, input), map_result)
    }
}

fn map_result(ret: LuaValue) -> Result<TransformOutput> {
    match ret {
        LuaValue::Nil | LuaValue::Boolean(false) => Ok(TransformOutput::drop()),
        LuaValue::Boolean(true) => Ok(TransformOutput::passthrough()),
        LuaValue::Table(_) => {
            let value = lua_value_to_json(ret).map_err(|e| anyhow!("map result: {}", e))?;
            let Value::Object(mut doc) = value else {
                bail!("map must return a table with named fields, got an array");
            };
            let meta = match doc.remove(META_KEY) {
                Some(meta) => parse_meta(meta)?,
                None => MetaOverrides::default(),
            };
            let out = if meta.skip {
                TransformOutput::skip()
            } else {
                TransformOutput::replace(doc)
            };
            Ok(out.with_meta(meta))
        }
        other => bail!("map returned unsupported type: {}", other.type_name()),
    }
}

fn parse_meta(value: Value) -> Result<MetaOverrides> {
    let mut meta = match value {
        Value::Object(map) => map,
        Value::Null => return Ok(MetaOverrides::default()),
        other => bail!("_meta must be a table, got {}", other),
    };
    // ids and routing keys may come back from Lua as numbers
    for key in ["id", "routing", "parent"] {
        if let Some(Value::Number(n)) = meta.get(key) {
            let s = n.to_string();
            meta.insert(key.to_string(), Value::String(s));
        }
    }
    serde_json::from_value(Value::Object(meta)).context("invalid _meta table")
}

/// `[[filter]]` entry.
pub struct LuaFilter {
    vm: ScriptVm,
}

impl LuaFilter {
    pub fn load(cfg: &ScriptConfig) -> Result<Self> {
        Ok(Self {
            vm: ScriptVm::load(cfg, "filter")?,
        })
    }
}

impl DocumentFilter for LuaFilter {
    fn name(&self) -> &str {
        &self.vm.label
    }

    fn filter(&self, input: &TransformInput) -> Result<bool> {
        self.vm.call(
            |lua| event_args(lua, input),
            |ret| match ret {
                LuaValue::Boolean(b) => Ok(b),
                LuaValue::Nil => Ok(false),
                other => bail!("filter must return a boolean, got {}", other.type_name()),
            },
        )
    }
}

/// `[[pipeline]]` entry.
pub struct LuaPipeline {
    vm: ScriptVm,
}

impl LuaPipeline {
    pub fn load(cfg: &ScriptConfig) -> Result<Self> {
        Ok(Self {
            vm: ScriptVm::load(cfg, "pipeline")?,
        })
    }
}

impl PipelineBuilder for LuaPipeline {
    fn name(&self) -> &str {
        &self.vm.label
    }

    fn pipeline(&self, namespace: &str, change_events: bool) -> Result<Vec<Value>> {
        self.vm.call(
            |lua| {
                Ok(LuaMultiValue::from_vec(vec![
                    LuaValue::String(lua.create_string(namespace)?),
                    LuaValue::Boolean(change_events),
                ]))
            },
            |ret| match lua_value_to_json(ret).map_err(|e| anyhow!("pipeline result: {}", e))? {
                Value::Array(stages) => Ok(stages),
                Value::Null => Ok(Vec::new()),
                // an empty Lua table converts to an empty object
                Value::Object(map) if map.is_empty() => Ok(Vec::new()),
                other => bail!("pipeline must return an array of stages, got {}", other),
            },
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Loading
// ═══════════════════════════════════════════════════════════════════════

/// Compile every script table of `config` into `registry`. Fails if a
/// script collides with a plugin already registered for its namespace.
pub fn register_scripts(registry: &mut PluginRegistry, config: &Config) -> Result<()> {
    for cfg in &config.scripts {
        let plugin = LuaTransformer::load(cfg)?;
        registry.register_transformer(cfg.namespace.as_deref(), Arc::new(plugin))?;
    }
    for cfg in &config.filters {
        let plugin = LuaFilter::load(cfg)?;
        registry.register_filter(cfg.namespace.as_deref(), Arc::new(plugin))?;
    }
    for cfg in &config.pipelines {
        let plugin = LuaPipeline::load(cfg)?;
        registry.register_pipeline(cfg.namespace.as_deref(), Arc::new(plugin))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::models::{Document, Operation};
    use serde_json::json;

    fn inline(namespace: &str, src: &str) -> ScriptConfig {
        ScriptConfig {
            namespace: Some(namespace.to_string()),
            path: None,
            script: Some(src.to_string()),
            timeout: 1,
            extra: toml::Table::new(),
        }
    }

    fn doc(v: Value) -> Document {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_map_replaces_document_and_reads_meta() {
        let t = LuaTransformer::load(&inline(
            "db.a",
            r#"
function map(doc, ns, op, update)
    doc.seen = ns .. ":" .. op
    doc._meta = { index = "people", routing = 7 }
    return doc
end
"#,
        ))
        .unwrap();
        let d = doc(json!({"_id": 1, "name": "x"}));
        let out = t
            .transform(&TransformInput {
                namespace: "db.a",
                operation: Operation::Insert,
                document: &d,
                update: None,
            })
            .unwrap();
        match out.action {
            crate::plugins::TransformAction::Replace(ref d) => {
                assert_eq!(d["seen"], json!("db.a:insert"));
                assert!(!d.contains_key("_meta"));
            }
            ref other => panic!("unexpected {:?}", other),
        }
        assert_eq!(out.meta.index.as_deref(), Some("people"));
        assert_eq!(out.meta.routing.as_deref(), Some("7"));
    }

    #[test]
    fn test_map_boolean_results() {
        let t = LuaTransformer::load(&inline(
            "db.a",
            "function map(doc) if doc.keep then return true end return false end",
        ))
        .unwrap();
        let keep = doc(json!({"keep": true}));
        let gone = doc(json!({"keep": false}));
        let input = |d| TransformInput {
            namespace: "db.a",
            operation: Operation::Update,
            document: d,
            update: None,
        };
        assert_eq!(t.transform(&input(&keep)).unwrap(), TransformOutput::passthrough());
        assert_eq!(t.transform(&input(&gone)).unwrap(), TransformOutput::drop());
    }

    #[test]
    fn test_missing_entry_function_is_a_load_error() {
        let err = LuaFilter::load(&inline("db.a", "function map() end"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("'filter'"));
    }

    #[test]
    fn test_pipeline_reads_config_table() {
        let mut cfg = inline(
            "db.a",
            r#"function pipeline(ns, change_event) return { { ["$match"] = { tenant = config.tenant } } } end"#,
        );
        cfg.extra
            .insert("tenant".into(), toml::Value::String("acme".into()));
        let p = LuaPipeline::load(&cfg).unwrap();
        let stages = p.pipeline("db.a", false).unwrap();
        assert_eq!(stages, vec![json!({"$match": {"tenant": "acme"}})]);
    }
}
