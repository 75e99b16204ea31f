//! Per-invocation Lua sandbox.
//!
//! Every invocation gets a fresh interpreter: base + string + table + math
//! plus an `os` pruned down to `time`, `date`, `clock`. Dynamic loading
//! (`dofile`, `loadfile`, `load`; `require` never exists without the package
//! library) is removed. The interpreter heap is capped, and an instruction
//! hook raises "timed out" once the invocation deadline passes.
//!
//! The `goop` namespace carries everything a script may touch: caller/self
//! identity, JSON, logging, the command index, and — policy permitting —
//! HTTP, KV, and (data functions only) the node's database.

use std::sync::Arc;
use std::time::Instant;

use mlua::{Lua, LuaOptions, StdLib, Table, Value as LuaValue, VmState};

use super::convert;
use super::http::{self, RequestBudget};
use super::kv::KvHandle;
use crate::db::Db;

/// Who a script runs as / on behalf of.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub label: String,
}

/// Everything a single invocation's environment is built from.
pub struct SandboxSpec {
    pub script_name: String,
    pub caller: Identity,
    pub local: Identity,
    pub commands: Vec<String>,
    /// `None` disables `goop.http`.
    pub http: Option<RequestBudget>,
    /// `None` disables `goop.kv`.
    pub kv: Option<KvHandle>,
    /// Data functions only: `goop.db` bound to the node's database.
    pub db: Option<Arc<parking_lot::Mutex<Db>>>,
    pub max_memory_bytes: usize,
    pub deadline: Instant,
}

/// Build a fresh, locked-down interpreter for one invocation.
pub fn build(spec: &SandboxSpec) -> mlua::Result<Lua> {
    let lua = Lua::new_with(
        StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::OS,
        LuaOptions::default(),
    )?;
    lua.set_memory_limit(spec.max_memory_bytes)?;

    let deadline = spec.deadline;
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(10_000),
        move |_lua, _debug| {
            if Instant::now() >= deadline {
                Err(mlua::Error::RuntimeError("timed out".into()))
            } else {
                Ok(VmState::Continue)
            }
        },
    );

    let globals = lua.globals();
    for name in ["dofile", "loadfile", "load"] {
        globals.set(name, LuaValue::Nil)?;
    }
    prune_os(&lua)?;

    let goop = lua.create_table()?;
    goop.set("peer", identity_table(&lua, &spec.caller)?)?;
    goop.set("self", identity_table(&lua, &spec.local)?)?;
    goop.set("json", json_table(&lua)?)?;
    goop.set("log", log_table(&lua, &spec.script_name)?)?;
    goop.set("commands", commands_fn(&lua, spec.commands.clone())?)?;
    if let Some(budget) = &spec.http {
        goop.set("http", http_table(&lua, budget.clone())?)?;
    }
    if let Some(kv) = &spec.kv {
        goop.set("kv", kv_table(&lua, kv.clone())?)?;
    }
    if let Some(db) = &spec.db {
        goop.set("db", db_table(&lua, Arc::clone(db))?)?;
    }
    globals.set("goop", goop)?;
    Ok(lua)
}

/// Replace `os` with a table retaining only `time`, `date`, `clock`.
fn prune_os(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    let os: Table = globals.get("os")?;
    let pruned = lua.create_table()?;
    for name in ["time", "date", "clock"] {
        pruned.set(name, os.get::<mlua::Function>(name)?)?;
    }
    globals.set("os", pruned)
}

fn identity_table(lua: &Lua, identity: &Identity) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set("id", identity.id.clone())?;
    table.set("label", identity.label.clone())?;
    Ok(table)
}

fn json_table(lua: &Lua) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set(
        "encode",
        lua.create_function(|_, value: LuaValue| {
            let json = convert::lua_to_json(value).map_err(mlua::Error::external)?;
            serde_json::to_string(&json).map_err(mlua::Error::external)
        })?,
    )?;
    table.set(
        "decode",
        lua.create_function(|lua, raw: String| {
            let json: serde_json::Value =
                serde_json::from_str(&raw).map_err(mlua::Error::external)?;
            convert::json_to_lua(lua, &json)
        })?,
    )?;
    Ok(table)
}

fn log_table(lua: &Lua, script_name: &str) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    let name = script_name.to_string();
    table.set(
        "info",
        lua.create_function(move |_, msg: String| {
            tracing::info!(script = %name, "{msg}");
            Ok(())
        })?,
    )?;
    let name = script_name.to_string();
    table.set(
        "warn",
        lua.create_function(move |_, msg: String| {
            tracing::warn!(script = %name, "{msg}");
            Ok(())
        })?,
    )?;
    let name = script_name.to_string();
    table.set(
        "error",
        lua.create_function(move |_, msg: String| {
            tracing::error!(script = %name, "{msg}");
            Ok(())
        })?,
    )?;
    Ok(table)
}

fn commands_fn(lua: &Lua, commands: Vec<String>) -> mlua::Result<mlua::Function> {
    lua.create_function(move |lua, ()| {
        let table = lua.create_table()?;
        for (i, name) in commands.iter().enumerate() {
            table.set(i + 1, name.clone())?;
        }
        Ok(table)
    })
}

fn http_table(lua: &Lua, budget: RequestBudget) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    let get_budget = budget.clone();
    table.set(
        "get",
        lua.create_function(move |lua, url: String| {
            let response =
                http::fetch(&get_budget, "GET", &url, None).map_err(mlua::Error::external)?;
            response_table(lua, response)
        })?,
    )?;
    table.set(
        "post",
        lua.create_function(move |lua, (url, body): (String, Option<String>)| {
            let response =
                http::fetch(&budget, "POST", &url, body).map_err(mlua::Error::external)?;
            response_table(lua, response)
        })?,
    )?;
    Ok(table)
}

fn response_table(lua: &Lua, response: http::HttpResponse) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set("status", response.status)?;
    table.set("body", response.body)?;
    Ok(table)
}

fn kv_table(lua: &Lua, kv: KvHandle) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    let get_kv = kv.clone();
    table.set(
        "get",
        lua.create_function(move |lua, key: String| {
            match get_kv.get(&key).map_err(mlua::Error::external)? {
                Some(value) => convert::json_to_lua(lua, &value),
                None => Ok(LuaValue::Nil),
            }
        })?,
    )?;
    let set_kv = kv.clone();
    table.set(
        "set",
        lua.create_function(move |_, (key, value): (String, LuaValue)| {
            let json = convert::lua_to_json(value).map_err(mlua::Error::external)?;
            set_kv.set(&key, json).map_err(mlua::Error::external)
        })?,
    )?;
    table.set(
        "del",
        lua.create_function(move |_, key: String| {
            kv.del(&key).map_err(mlua::Error::external)
        })?,
    )?;
    Ok(table)
}

fn db_table(lua: &Lua, db: Arc<parking_lot::Mutex<Db>>) -> mlua::Result<Table> {
    let table = lua.create_table()?;

    let query_db = Arc::clone(&db);
    table.set(
        "query",
        lua.create_function(move |lua, (sql, params): (String, Option<Table>)| {
            let params = lua_params(params)?;
            let rows = run_query(&query_db, &sql, params).map_err(mlua::Error::external)?;
            convert::json_to_lua(lua, &serde_json::Value::Array(rows))
        })?,
    )?;

    let scalar_db = Arc::clone(&db);
    table.set(
        "scalar",
        lua.create_function(move |lua, (sql, params): (String, Option<Table>)| {
            let params = lua_params(params)?;
            let rows = run_query(&scalar_db, &sql, params).map_err(mlua::Error::external)?;
            let scalar = rows
                .first()
                .and_then(|row| row.as_object())
                .and_then(|row| row.values().next().cloned())
                .unwrap_or(serde_json::Value::Null);
            convert::json_to_lua(lua, &scalar)
        })?,
    )?;

    table.set(
        "exec",
        lua.create_function(move |_, (sql, params): (String, Option<Table>)| {
            let params = lua_params(params)?;
            let db = db.lock();
            let affected = db
                .connection()
                .execute(&sql, rusqlite::params_from_iter(params))
                .map_err(mlua::Error::external)?;
            Ok(affected)
        })?,
    )?;
    Ok(table)
}

/// Convert an optional Lua sequence of scalars into SQLite parameters.
fn lua_params(params: Option<Table>) -> mlua::Result<Vec<rusqlite::types::Value>> {
    let Some(params) = params else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for value in params.sequence_values::<LuaValue>() {
        let json = convert::lua_to_json(value?).map_err(mlua::Error::external)?;
        out.push(json_to_sql(json).map_err(mlua::Error::external)?);
    }
    Ok(out)
}

fn json_to_sql(value: serde_json::Value) -> crate::error::Result<rusqlite::types::Value> {
    use rusqlite::types::Value as Sql;
    Ok(match value {
        serde_json::Value::Null => Sql::Null,
        serde_json::Value::Bool(b) => Sql::Integer(b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Sql::Text(s),
        other => {
            return Err(crate::error::Error::Invalid(format!(
                "unsupported sql parameter: {other}"
            )));
        }
    })
}

fn run_query(
    db: &Arc<parking_lot::Mutex<Db>>,
    sql: &str,
    params: Vec<rusqlite::types::Value>,
) -> crate::error::Result<Vec<serde_json::Value>> {
    let db = db.lock();
    let mut stmt = db.connection().prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut object = serde_json::Map::new();
        for (i, column) in columns.iter().enumerate() {
            object.insert(column.clone(), sql_to_json(row.get_ref(i)?));
        }
        out.push(serde_json::Value::Object(object));
    }
    Ok(out)
}

fn sql_to_json(value: rusqlite::types::ValueRef) -> serde_json::Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(t) => serde_json::Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::from(hex::encode(b)),
    }
}
