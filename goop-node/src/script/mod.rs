//! Script engine: sandboxed Lua with hot reload.
//!
//! Two script kinds, distinguished by directory layout: chat commands live
//! at the top of the script dir, data functions under `functions/`. A file
//! compiles once at load; a compile error keeps the previously loaded
//! version active. Filesystem watchers trigger rescans.
//!
//! Invocations are admitted by the rate limiter keyed `(caller, script)`,
//! then run on a blocking thread inside a fresh sandbox with a heap cap and
//! a deadline. The engine never shares interpreter state between
//! invocations; the only persistence a script has is its KV document.

mod convert;
pub mod http;
pub mod kv;
pub mod sandbox;

pub use sandbox::Identity;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::Watcher;
use parking_lot::{Mutex, RwLock};

use crate::config::LuaConfig;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::limiter::RateLimiter;

/// Extra wall-clock allowance over `timeout_seconds` before the supervising
/// task gives up on a blocking invocation.
const TIMEOUT_GRACE: Duration = Duration::from_millis(400);
/// Debounce window for filesystem change bursts.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(300);

/// Metadata extracted from a script's leading comment lines.
#[derive(Debug, Clone)]
pub struct ScriptMeta {
    pub name: String,
    pub description: String,
    /// `@rate_limit N`: overrides the per-key admission limit; 0 disables.
    pub rate_limit_override: Option<u32>,
    pub has_call_entry: bool,
    pub has_handle_entry: bool,
    pub is_data_function: bool,
}

/// A loaded script: metadata plus its compile-validated source.
pub struct Script {
    pub meta: ScriptMeta,
    pub source: String,
}

enum Input {
    Command(String),
    Call(serde_json::Value),
}

pub struct Engine {
    cfg: LuaConfig,
    script_dir: PathBuf,
    scripts: RwLock<HashMap<String, Arc<Script>>>,
    functions: RwLock<HashMap<String, Arc<Script>>>,
    limiter: RateLimiter,
    kv: kv::KvStore,
    db: Option<Arc<Mutex<Db>>>,
    local: Identity,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl Engine {
    /// Build the engine rooted at `peer_dir` and load what is on disk.
    pub fn new(
        cfg: LuaConfig,
        peer_dir: &Path,
        local: Identity,
        db: Option<Arc<Mutex<Db>>>,
    ) -> Arc<Self> {
        let script_dir = peer_dir.join(&cfg.script_dir);
        let limiter = RateLimiter::new(
            cfg.rate_limit_global as usize,
            cfg.rate_limit_per_peer as usize,
        );
        let kv = kv::KvStore::new(script_dir.join(".state"));
        let engine = Arc::new(Self {
            cfg,
            script_dir,
            scripts: RwLock::new(HashMap::new()),
            functions: RwLock::new(HashMap::new()),
            limiter,
            kv,
            db,
            local,
            watcher: Mutex::new(None),
        });
        engine.rescan();
        engine
    }

    /// Reload both script directories from disk.
    pub fn rescan(&self) {
        if !self.cfg.enabled {
            return;
        }
        self.load_dir(&self.script_dir.clone(), false);
        self.load_dir(&self.script_dir.join("functions"), true);
    }

    fn load_dir(&self, dir: &Path, is_data_function: bool) {
        let map = if is_data_function {
            &self.functions
        } else {
            &self.scripts
        };
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => {
                // Directory may simply not exist yet.
                return;
            }
        };

        let mut present = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lua") || !path.is_file() {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            present.push(name.clone());

            let source = match std::fs::read_to_string(&path) {
                Ok(source) => source,
                Err(e) => {
                    tracing::warn!(script = %name, "read failed: {e}");
                    continue;
                }
            };
            // Unchanged source: keep the existing entry.
            if map.read().get(&name).is_some_and(|s| s.source == source) {
                continue;
            }
            match compile_check(&source) {
                Ok(()) => {
                    let meta = parse_metadata(&name, &source, is_data_function);
                    tracing::info!(script = %name, data_function = is_data_function, "script loaded");
                    map.write().insert(name, Arc::new(Script { meta, source }));
                }
                Err(e) => {
                    if map.read().contains_key(&name) {
                        tracing::warn!(script = %name, "compile failed, keeping previous version: {e}");
                    } else {
                        tracing::warn!(script = %name, "compile failed, skipped: {e}");
                    }
                }
            }
        }

        map.write().retain(|name, _| {
            let keep = present.iter().any(|p| p == name);
            if !keep {
                tracing::info!(script = %name, "script removed");
            }
            keep
        });
    }

    /// Watch the script directories and rescan on change.
    pub fn start_watch(self: &Arc<Self>) -> Result<()> {
        if !self.cfg.enabled {
            return Ok(());
        }
        std::fs::create_dir_all(self.script_dir.join("functions"))
            .map_err(|e| Error::Invalid(format!("script dir: {e}")))?;

        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let touches_lua = event
                    .paths
                    .iter()
                    .any(|p| p.extension().and_then(|e| e.to_str()) == Some("lua"));
                if touches_lua {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| Error::Invalid(format!("watcher: {e}")))?;
        watcher
            .watch(&self.script_dir, notify::RecursiveMode::Recursive)
            .map_err(|e| Error::Invalid(format!("watch {}: {e}", self.script_dir.display())))?;
        *self.watcher.lock() = Some(watcher);

        let engine = Arc::clone(self);
        std::thread::Builder::new()
            .name("script-watch".to_string())
            .spawn(move || {
                while rx.recv().is_ok() {
                    std::thread::sleep(WATCH_DEBOUNCE);
                    while rx.try_recv().is_ok() {}
                    engine.rescan();
                }
            })
            .map_err(|e| Error::Invalid(format!("watch thread: {e}")))?;
        Ok(())
    }

    /// Periodic housekeeping (admission window compaction).
    pub fn maintain(&self) {
        self.limiter.compact();
    }

    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scripts.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Description of a command or data function, if any.
    pub fn describe(&self, name: &str) -> Option<String> {
        self.scripts
            .read()
            .get(name)
            .or_else(|| self.functions.read().get(name))
            .map(|s| s.meta.description.clone())
    }

    /// Run a chat command: `handle(args) -> string?`.
    pub async fn invoke_command(
        &self,
        caller: &Identity,
        name: &str,
        args: &str,
    ) -> Result<Option<String>> {
        let script = self
            .scripts
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("command {name}")))?;
        if !script.meta.has_handle_entry {
            return Err(Error::NotFound(format!("command {name}")));
        }
        let result = self
            .run(script, caller.clone(), Input::Command(args.to_string()))
            .await?;
        Ok(match result {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s),
            other => Some(other.to_string()),
        })
    }

    /// Run a data function: `call({params}) -> value`.
    pub async fn invoke_function(
        &self,
        caller: &Identity,
        name: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let script = self
            .functions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("function {name}")))?;
        if !script.meta.has_call_entry {
            return Err(Error::NotFound(format!("function {name}")));
        }
        self.run(script, caller.clone(), Input::Call(params)).await
    }

    async fn run(
        &self,
        script: Arc<Script>,
        caller: Identity,
        input: Input,
    ) -> Result<serde_json::Value> {
        if !self.cfg.enabled {
            return Err(Error::Closed("script engine disabled".into()));
        }
        let name = script.meta.name.clone();
        let admission_key = format!("{}:{}", caller.id, name);
        if !self
            .limiter
            .allow(&admission_key, script.meta.rate_limit_override)
        {
            return Err(Error::Forbidden(format!("rate limit exceeded for {name}")));
        }

        let timeout = Duration::from_secs(self.cfg.timeout_seconds);
        let spec = sandbox::SandboxSpec {
            script_name: name.clone(),
            caller,
            local: self.local.clone(),
            commands: self.command_names(),
            http: self
                .cfg
                .http_enabled
                .then(http::RequestBudget::default),
            kv: self.cfg.kv_enabled.then(|| self.kv.handle(&name)),
            db: script
                .meta
                .is_data_function
                .then(|| self.db.clone())
                .flatten(),
            max_memory_bytes: (self.cfg.max_memory_mb as usize) * 1024 * 1024,
            deadline: Instant::now() + timeout,
        };

        let task_name = name.clone();
        let task = tokio::task::spawn_blocking(move || -> Result<serde_json::Value> {
            let lua = sandbox::build(&spec).map_err(|e| map_lua_error(&task_name, e))?;
            lua.load(&script.source)
                .set_name(format!("@{task_name}"))
                .exec()
                .map_err(|e| map_lua_error(&task_name, e))?;

            match input {
                Input::Command(args) => {
                    let handle: mlua::Function = lua
                        .globals()
                        .get("handle")
                        .map_err(|_| Error::NotFound(format!("command {task_name}")))?;
                    let out: Option<String> =
                        handle.call(args).map_err(|e| map_lua_error(&task_name, e))?;
                    Ok(out.map(serde_json::Value::String).unwrap_or_default())
                }
                Input::Call(params) => {
                    let call: mlua::Function = lua
                        .globals()
                        .get("call")
                        .map_err(|_| Error::NotFound(format!("function {task_name}")))?;
                    let request = lua
                        .create_table()
                        .map_err(|e| map_lua_error(&task_name, e))?;
                    request
                        .set(
                            "params",
                            convert::json_to_lua(&lua, &params)
                                .map_err(|e| map_lua_error(&task_name, e))?,
                        )
                        .map_err(|e| map_lua_error(&task_name, e))?;
                    let out: mlua::Value = call
                        .call(request)
                        .map_err(|e| map_lua_error(&task_name, e))?;
                    convert::lua_to_json(out)
                }
            }
        });

        match tokio::time::timeout(timeout + TIMEOUT_GRACE, task).await {
            Err(_) => Err(Error::Timeout(format!("script '{name}' timed out"))),
            Ok(Err(join_err)) => Err(Error::Invalid(format!(
                "script '{name}' panicked: {join_err}"
            ))),
            Ok(Ok(result)) => result,
        }
    }
}

/// Syntax-check a script without running it.
fn compile_check(source: &str) -> mlua::Result<()> {
    let lua = mlua::Lua::new();
    lua.load(source).into_function()?;
    Ok(())
}

fn map_lua_error(name: &str, e: mlua::Error) -> Error {
    if matches!(e, mlua::Error::MemoryError(_)) {
        return Error::Invalid("memory limit exceeded".into());
    }
    let msg = e.to_string();
    if msg.contains("timed out") {
        Error::Timeout(format!("script '{name}' timed out"))
    } else if msg.contains("memory") && msg.contains("limit") {
        Error::Invalid("memory limit exceeded".into())
    } else {
        Error::Invalid(format!("script '{name}': {msg}"))
    }
}

/// Extract metadata from leading comment lines.
fn parse_metadata(name: &str, source: &str, is_data_function: bool) -> ScriptMeta {
    let mut description = String::new();
    let mut rate_limit_override = None;
    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some(comment) = trimmed.strip_prefix("--") else {
            break; // metadata lives only at the top
        };
        let text = comment.trim_start_matches('-').trim();
        if let Some(rest) = text.strip_prefix("@rate_limit") {
            if let Ok(n) = rest.trim().parse::<u32>() {
                rate_limit_override = Some(n);
            }
        } else if !text.starts_with('@') && description.is_empty() && !text.is_empty() {
            description = text.to_string();
        }
    }
    ScriptMeta {
        name: name.to_string(),
        description,
        rate_limit_override,
        has_call_entry: source.contains("function call("),
        has_handle_entry: source.contains("function handle("),
        is_data_function,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn caller() -> Identity {
        Identity {
            id: "peer-caller".to_string(),
            label: "caller".to_string(),
        }
    }

    fn engine_in(dir: &Path, cfg: LuaConfig) -> Arc<Engine> {
        Engine::new(
            cfg,
            dir,
            Identity {
                id: "peer-self".to_string(),
                label: "me".to_string(),
            },
            None,
        )
    }

    fn write_script(dir: &Path, rel: &str, source: &str) {
        let path = dir.join("site/lua").join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, source).unwrap();
    }

    #[test]
    fn metadata_parsing() {
        let source = "\
-- Rolls dice for the chat.
-- @rate_limit 2
function handle(args)
  return args
end
";
        let meta = parse_metadata("roll", source, false);
        assert_eq!(meta.description, "Rolls dice for the chat.");
        assert_eq!(meta.rate_limit_override, Some(2));
        assert!(meta.has_handle_entry);
        assert!(!meta.has_call_entry);
    }

    #[test]
    fn metadata_stops_at_first_code_line() {
        let source = "local x = 1\n-- not a description\nfunction handle(args) end\n";
        let meta = parse_metadata("x", source, false);
        assert!(meta.description.is_empty());
    }

    #[tokio::test]
    async fn command_invocation_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "echo.lua",
            "-- Echoes its arguments.\nfunction handle(args)\n  return 'echo: ' .. args\nend\n",
        );
        let engine = engine_in(dir.path(), LuaConfig::default());
        let out = engine
            .invoke_command(&caller(), "echo", "hello world")
            .await
            .unwrap();
        assert_eq!(out.as_deref(), Some("echo: hello world"));
    }

    #[tokio::test]
    async fn unknown_command_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path(), LuaConfig::default());
        let err = engine
            .invoke_command(&caller(), "nope", "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "{err}");
    }

    #[tokio::test]
    async fn data_function_invocation() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "functions/double.lua",
            "function call(request)\n  return { value = request.params.x * 2 }\nend\n",
        );
        let engine = engine_in(dir.path(), LuaConfig::default());
        let out = engine
            .invoke_function(&caller(), "double", json!({ "x": 21 }))
            .await
            .unwrap();
        assert_eq!(out, json!({ "value": 42 }));
    }

    #[tokio::test]
    async fn busy_loop_times_out_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "spin.lua",
            "function handle(args)\n  while true do end\nend\n",
        );
        let cfg = LuaConfig {
            timeout_seconds: 1,
            ..Default::default()
        };
        let engine = engine_in(dir.path(), cfg);

        let start = Instant::now();
        let err = engine.invoke_command(&caller(), "spin", "").await.unwrap_err();
        assert!(start.elapsed() <= Duration::from_millis(1500));
        assert!(err.to_string().contains("timed out"), "{err}");

        // the engine still works afterwards
        write_script(dir.path(), "ok.lua", "function handle(args) return 'ok' end\n");
        engine.rescan();
        let out = engine.invoke_command(&caller(), "ok", "").await.unwrap();
        assert_eq!(out.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn allocation_hits_memory_cap() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "hog.lua",
            "function handle(args)\n  local t = {}\n  for i = 1, 1e9 do t[i] = string.rep('x', 256) end\nend\n",
        );
        let cfg = LuaConfig {
            max_memory_mb: 2,
            ..Default::default()
        };
        let engine = engine_in(dir.path(), cfg);
        let err = engine.invoke_command(&caller(), "hog", "").await.unwrap_err();
        assert!(err.to_string().contains("memory limit exceeded"), "{err}");
    }

    #[tokio::test]
    async fn rate_limit_override_applies() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "once.lua",
            "-- @rate_limit 1\nfunction handle(args) return 'ok' end\n",
        );
        let engine = engine_in(dir.path(), LuaConfig::default());
        engine.invoke_command(&caller(), "once", "").await.unwrap();
        let err = engine
            .invoke_command(&caller(), "once", "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)), "{err}");
    }

    #[tokio::test]
    async fn rate_limit_zero_disables_admission() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "free.lua",
            "-- @rate_limit 0\nfunction handle(args) return 'ok' end\n",
        );
        let cfg = LuaConfig {
            rate_limit_per_peer: 1,
            rate_limit_global: 1,
            ..Default::default()
        };
        let engine = engine_in(dir.path(), cfg);
        for _ in 0..5 {
            engine.invoke_command(&caller(), "free", "").await.unwrap();
        }
    }

    #[tokio::test]
    async fn compile_error_keeps_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "v.lua", "function handle(args) return 'v1' end\n");
        let engine = engine_in(dir.path(), LuaConfig::default());
        assert_eq!(
            engine.invoke_command(&caller(), "v", "").await.unwrap().as_deref(),
            Some("v1")
        );

        write_script(dir.path(), "v.lua", "function handle( -- broken\n");
        engine.rescan();
        assert_eq!(
            engine.invoke_command(&caller(), "v", "").await.unwrap().as_deref(),
            Some("v1"),
            "broken update must not replace the working version"
        );

        write_script(dir.path(), "v.lua", "function handle(args) return 'v2' end\n");
        engine.rescan();
        assert_eq!(
            engine.invoke_command(&caller(), "v", "").await.unwrap().as_deref(),
            Some("v2")
        );
    }

    #[tokio::test]
    async fn removed_file_unloads_script() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "gone.lua", "function handle(args) return 'x' end\n");
        let engine = engine_in(dir.path(), LuaConfig::default());
        assert_eq!(engine.command_names(), vec!["gone".to_string()]);

        std::fs::remove_file(dir.path().join("site/lua/gone.lua")).unwrap();
        engine.rescan();
        assert!(engine.command_names().is_empty());
    }

    #[tokio::test]
    async fn kv_state_survives_between_invocations() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "count.lua",
            "-- Counts invocations.\nfunction handle(args)\n  local n = (goop.kv.get('n') or 0) + 1\n  goop.kv.set('n', n)\n  return tostring(n)\nend\n",
        );
        let engine = engine_in(dir.path(), LuaConfig::default());
        assert_eq!(
            engine.invoke_command(&caller(), "count", "").await.unwrap().as_deref(),
            Some("1")
        );
        assert_eq!(
            engine.invoke_command(&caller(), "count", "").await.unwrap().as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn script_error_surfaces_as_invalid() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "boom.lua",
            "function handle(args)\n  error('kaboom')\nend\n",
        );
        let engine = engine_in(dir.path(), LuaConfig::default());
        let err = engine.invoke_command(&caller(), "boom", "").await.unwrap_err();
        assert!(matches!(err, Error::Invalid(_)), "{err}");
        assert!(err.to_string().contains("kaboom"), "{err}");
    }

    #[tokio::test]
    async fn ssrf_block_surfaces_to_data_functions() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "functions/probe.lua",
            "function call(request)\n  local r = goop.http.get('http://127.0.0.1:9/x')\n  return r.body\nend\n",
        );
        let engine = engine_in(dir.path(), LuaConfig::default());
        let err = engine
            .invoke_function(&caller(), "probe", json!({}))
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("private/loopback address blocked"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn http_disabled_removes_the_facility() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "functions/probe.lua",
            "function call(request)\n  return goop.http == nil\nend\n",
        );
        let cfg = LuaConfig {
            http_enabled: false,
            ..Default::default()
        };
        let engine = engine_in(dir.path(), cfg);
        let out = engine
            .invoke_function(&caller(), "probe", json!({}))
            .await
            .unwrap();
        assert_eq!(out, json!(true));
    }
}
