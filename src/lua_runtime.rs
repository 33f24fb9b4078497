//! Sandboxed Lua 5.4 VM shared by the script plugins.
//!
//! Every script VM gets the same host tables and the same sandbox. Scripts
//! run synchronously under a per-call deadline enforced by an instruction
//! hook, so a runaway `map` or `filter` fails that one event instead of
//! stalling its worker.
//!
//! # Host APIs
//!
//! | Module | Functions |
//! |--------|-----------|
//! | `json` | `parse`, `encode` |
//! | `env` | `get` |
//! | `log` | `info`, `warn`, `error`, `debug` (forwarded to `tracing`) |
//! | `base64` | `encode`, `decode` |
//! | `crypto` | `sha256`, `hmac_sha256` |
//!
//! # Sandboxing
//!
//! `os`, `io`, `debug`, `loadfile` and `dofile` are removed from the globals.

use hmac::{Hmac, Mac};
use mlua::prelude::*;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════
// Setup
// ═══════════════════════════════════════════════════════════════════════

/// Sandbox the globals and register every host module.
pub(crate) fn register_host_apis(lua: &Lua, script_name: &str) -> LuaResult<()> {
    sandbox_globals(lua)?;
    register_json_api(lua)?;
    register_env_api(lua)?;
    register_log_api(lua, script_name)?;
    register_base64_api(lua)?;
    register_crypto_api(lua)?;
    Ok(())
}

pub(crate) fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    for name in ["os", "io", "loadfile", "dofile", "debug"] {
        globals.set(name, LuaValue::Nil)?;
    }
    Ok(())
}

/// Arm a deadline for the next call. Any instruction executed after it
/// aborts the running script with a timeout error.
pub(crate) fn arm_deadline(lua: &Lua, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    let secs = timeout.as_secs_f64();
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(10_000),
        move |_lua, _debug| {
            if Instant::now() > deadline {
                Err(mlua::Error::RuntimeError(format!(
                    "script timed out after {} seconds",
                    secs
                )))
            } else {
                Ok(mlua::VmState::Continue)
            }
        },
    );
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: json
// ═══════════════════════════════════════════════════════════════════════

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json_table = lua.create_table()?;

    json_table.set(
        "parse",
        lua.create_function(|lua, s: String| {
            let value: serde_json::Value = serde_json::from_str(&s)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.parse: {}", e)))?;
            json_value_to_lua(lua, &value)
        })?,
    )?;

    json_table.set(
        "encode",
        lua.create_function(|_lua, value: LuaValue| {
            let json = lua_value_to_json(value)?;
            serde_json::to_string(&json)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.encode: {}", e)))
        })?,
    )?;

    lua.globals().set("json", json_table)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: env
// ═══════════════════════════════════════════════════════════════════════

fn register_env_api(lua: &Lua) -> LuaResult<()> {
    let env = lua.create_table()?;
    env.set(
        "get",
        lua.create_function(|_lua, name: String| Ok(std::env::var(&name).ok()))?,
    )?;
    lua.globals().set("env", env)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: log
// ═══════════════════════════════════════════════════════════════════════

fn register_log_api(lua: &Lua, script_name: &str) -> LuaResult<()> {
    let log = lua.create_table()?;

    let n = script_name.to_string();
    log.set(
        "info",
        lua.create_function(move |_lua, msg: String| {
            tracing::info!(script = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = script_name.to_string();
    log.set(
        "warn",
        lua.create_function(move |_lua, msg: String| {
            tracing::warn!(script = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = script_name.to_string();
    log.set(
        "error",
        lua.create_function(move |_lua, msg: String| {
            tracing::error!(script = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = script_name.to_string();
    log.set(
        "debug",
        lua.create_function(move |_lua, msg: String| {
            tracing::debug!(script = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    lua.globals().set("log", log)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: base64
// ═══════════════════════════════════════════════════════════════════════

fn register_base64_api(lua: &Lua) -> LuaResult<()> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    let b64 = lua.create_table()?;

    b64.set(
        "encode",
        lua.create_function(|_lua, data: LuaString| Ok(STANDARD.encode(data.as_bytes())))?,
    )?;

    b64.set(
        "decode",
        lua.create_function(|lua, data: String| {
            let bytes = STANDARD
                .decode(data.as_bytes())
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("base64.decode: {}", e)))?;
            lua.create_string(&bytes)
        })?,
    )?;

    lua.globals().set("base64", b64)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: crypto
// ═══════════════════════════════════════════════════════════════════════

fn register_crypto_api(lua: &Lua) -> LuaResult<()> {
    let crypto = lua.create_table()?;

    crypto.set(
        "sha256",
        lua.create_function(|_lua, data: LuaString| {
            Ok(hex::encode(Sha256::digest(data.as_bytes())))
        })?,
    )?;

    crypto.set(
        "hmac_sha256",
        lua.create_function(|_lua, (key, data): (LuaString, LuaString)| {
            type HmacSha256 = Hmac<Sha256>;
            let mut mac = HmacSha256::new_from_slice(&key.as_bytes())
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("crypto.hmac_sha256: {}", e)))?;
            mac.update(&data.as_bytes());
            Ok(hex::encode(mac.finalize().into_bytes()))
        })?,
    )?;

    lua.globals().set("crypto", crypto)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Value Conversions: TOML → Lua
// ═══════════════════════════════════════════════════════════════════════

/// Convert a TOML value to a Lua value, expanding `${VAR}` in strings.
pub(crate) fn toml_value_to_lua(lua: &Lua, value: &toml::Value) -> LuaResult<LuaValue> {
    match value {
        toml::Value::String(s) => lua.create_string(expand_env_vars(s)).map(LuaValue::String),
        toml::Value::Integer(i) => Ok(LuaValue::Integer(*i)),
        toml::Value::Float(f) => Ok(LuaValue::Number(*f)),
        toml::Value::Boolean(b) => Ok(LuaValue::Boolean(*b)),
        toml::Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                table.set(i as i64 + 1, toml_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        toml::Value::Table(map) => Ok(LuaValue::Table(toml_table_to_lua(lua, map)?)),
        toml::Value::Datetime(dt) => lua.create_string(dt.to_string()).map(LuaValue::String),
    }
}

pub(crate) fn toml_table_to_lua(lua: &Lua, table: &toml::Table) -> LuaResult<LuaTable> {
    let lua_table = lua.create_table()?;
    for (k, v) in table {
        lua_table.set(k.as_str(), toml_value_to_lua(lua, v)?)?;
    }
    Ok(lua_table)
}

/// Expand `${VAR_NAME}` from the process environment; unset variables
/// expand to the empty string.
pub(crate) fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    while let Some(start) = result.find("${") {
        let end = match result[start..].find('}') {
            Some(pos) => start + pos,
            None => break,
        };
        let value = std::env::var(&result[start + 2..end]).unwrap_or_default();
        result = format!("{}{}{}", &result[..start], value, &result[end + 1..]);
    }
    result
}

// ═══════════════════════════════════════════════════════════════════════
// Value Conversions: JSON ↔ Lua
// ═══════════════════════════════════════════════════════════════════════

pub(crate) fn json_value_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<LuaValue> {
    match value {
        serde_json::Value::Null => Ok(LuaValue::Nil),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(LuaValue::Integer(i)),
            None => Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0))),
        },
        serde_json::Value::String(s) => lua.create_string(s).map(LuaValue::String),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                table.set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        serde_json::Value::Object(map) => {
            Ok(LuaValue::Table(json_object_to_lua(lua, map)?))
        }
    }
}

pub(crate) fn json_object_to_lua(
    lua: &Lua,
    map: &serde_json::Map<String, serde_json::Value>,
) -> LuaResult<LuaTable> {
    let table = lua.create_table()?;
    for (k, v) in map {
        table.set(k.as_str(), json_value_to_lua(lua, v)?)?;
    }
    Ok(table)
}

/// Convert a Lua value to JSON. A table with a non-empty array part is an
/// array; any other table is an object.
pub(crate) fn lua_value_to_json(value: LuaValue) -> LuaResult<serde_json::Value> {
    match value {
        LuaValue::Nil => Ok(serde_json::Value::Null),
        LuaValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        LuaValue::Integer(i) => Ok(serde_json::Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        LuaValue::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            let len = t.raw_len();
            if len > 0 {
                let mut arr = Vec::with_capacity(len);
                for i in 1..=len {
                    arr.push(lua_value_to_json(t.raw_get(i)?)?);
                }
                Ok(serde_json::Value::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<String, LuaValue>() {
                    let (k, v) = pair?;
                    map.insert(k, lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
        _ => Ok(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_removes_dangerous_globals() {
        let lua = Lua::new();
        register_host_apis(&lua, "test").unwrap();
        let os_is_nil: bool = lua.load("return os == nil and io == nil").eval().unwrap();
        assert!(os_is_nil);
    }

    #[test]
    fn test_host_tables_work() {
        let lua = Lua::new();
        register_host_apis(&lua, "test").unwrap();
        let out: String = lua
            .load(r#"return json.encode({a = 1}) .. "|" .. base64.encode("hi") .. "|" .. crypto.sha256("")"#)
            .eval()
            .unwrap();
        assert_eq!(
            out,
            "{\"a\":1}|aGk=|e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_deadline_stops_runaway_script() {
        let lua = Lua::new();
        register_host_apis(&lua, "test").unwrap();
        arm_deadline(&lua, Duration::from_millis(50));
        let err = lua.load("while true do end").exec().unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("DOCSYNC_TEST_EXPAND", "value");
        assert_eq!(expand_env_vars("a-${DOCSYNC_TEST_EXPAND}-b"), "a-value-b");
        assert_eq!(expand_env_vars("${DOCSYNC_TEST_UNSET_VAR}"), "");
    }
}
