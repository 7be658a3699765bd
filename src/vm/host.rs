//! Host functions injected into every script context.
//!
//! Raw bindings (`__get`, `__list`, `__create`, `__update`, `__remove`,
//! `__fetchSync`, `__exit`, `__jsonDecode`) return envelope tables with an
//! optional `__throw` marker; the prelude converts those into thrown Lua
//! errors. Plain helpers (`print`, `sleep`, `env`, `readFileSync`, `atob`,
//! `btoa`) are exposed directly.
//!
//! All bindings are synchronous by contract: script execution happens on a
//! blocking thread, and cluster access blocks on a captured runtime handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use kube::Client;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use mlua::{Lua, LuaSerdeExt, SerializeOptions, Value as LuaValue, Variadic};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::cache::{GvkKey, ObjectCache};

use super::ScriptExit;

/// Scripts may sleep for at most this long per call.
const MAX_SLEEP_MS: u64 = 1000;

/// Everything host bindings need to serve a script.
#[derive(Clone)]
pub struct HostApi {
    pub cache: Arc<ObjectCache>,
    pub client: Client,
    pub runtime: tokio::runtime::Handle,
    /// Extra Lua appended to the prelude of every context.
    pub global_context: String,
}

fn lua_options() -> SerializeOptions {
    // Absent JSON fields become nil rather than a null sentinel so scripts
    // can use plain `== nil` checks.
    SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false)
}

/// Convert a JSON value into a Lua value.
pub fn json_to_lua(lua: &Lua, value: &serde_json::Value) -> mlua::Result<LuaValue> {
    lua.to_value_with(value, lua_options())
}

fn throw(lua: &Lua, reason: &str, message: &str) -> mlua::Result<LuaValue> {
    json_to_lua(
        lua,
        &json!({ "__throw": true, "reason": reason, "message": message }),
    )
}

/// Install every host binding into the context's globals.
pub fn install(lua: &Lua, host: &HostApi) -> mlua::Result<()> {
    let globals = lua.globals();

    globals.set("print", print_fn(lua)?)?;
    globals.set("sleep", sleep_fn(lua)?)?;
    globals.set("env", env_fn(lua)?)?;
    globals.set("readFileSync", read_file_fn(lua)?)?;
    globals.set("atob", atob_fn(lua)?)?;
    globals.set("btoa", btoa_fn(lua)?)?;
    globals.set("__exit", exit_fn(lua)?)?;
    globals.set("__jsonDecode", json_decode_fn(lua)?)?;
    globals.set("__fetchSync", fetch_fn(lua)?)?;
    globals.set("__get", get_fn(lua, host.clone())?)?;
    globals.set("__list", list_fn(lua, host.clone())?)?;
    globals.set("__create", write_fn(lua, host.clone(), WriteOp::Create)?)?;
    globals.set("__update", write_fn(lua, host.clone(), WriteOp::Update)?)?;
    globals.set("__remove", write_fn(lua, host.clone(), WriteOp::Remove)?)?;

    Ok(())
}

fn print_fn(lua: &Lua) -> mlua::Result<mlua::Function> {
    lua.create_function(|lua, args: Variadic<LuaValue>| {
        let origin: String = lua
            .globals()
            .get("__policy")
            .unwrap_or_else(|_| "unknown".to_string());

        let mut parts = Vec::with_capacity(args.len());
        for arg in args.iter() {
            match arg {
                LuaValue::String(s) => parts.push(s.to_string_lossy().to_string()),
                other => {
                    if let Ok(value) = lua.from_value::<serde_json::Value>(other.clone()) {
                        parts.push(value.to_string());
                    }
                }
            }
        }
        info!("[{}] {}", origin, parts.join(" "));
        Ok(())
    })
}

fn sleep_fn(lua: &Lua) -> mlua::Result<mlua::Function> {
    lua.create_function(|_, ms: u64| {
        std::thread::sleep(Duration::from_millis(ms.min(MAX_SLEEP_MS)));
        Ok(())
    })
}

fn env_fn(lua: &Lua) -> mlua::Result<mlua::Function> {
    lua.create_function(|_, name: String| Ok(std::env::var(&name).unwrap_or_default()))
}

fn read_file_fn(lua: &Lua) -> mlua::Result<mlua::Function> {
    lua.create_function(|_, path: String| Ok(std::fs::read_to_string(&path).ok()))
}

fn atob_fn(lua: &Lua) -> mlua::Result<mlua::Function> {
    lua.create_function(|_, encoded: String| {
        Ok(BASE64
            .decode(encoded.as_bytes())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok()))
    })
}

fn btoa_fn(lua: &Lua) -> mlua::Result<mlua::Function> {
    lua.create_function(|_, raw: String| Ok(BASE64.encode(raw.as_bytes())))
}

/// Terminate script execution immediately. Verdict helpers call this after
/// populating `__response`; the raised sentinel is treated as a normal
/// completion by the host.
fn exit_fn(lua: &Lua) -> mlua::Result<mlua::Function> {
    lua.create_function(|_, ()| -> mlua::Result<()> { Err(mlua::Error::external(ScriptExit)) })
}

fn json_decode_fn(lua: &Lua) -> mlua::Result<mlua::Function> {
    lua.create_function(|lua, body: String| {
        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(value) => json_to_lua(lua, &value),
            Err(err) => throw(lua, "JsonDecode", &err.to_string()),
        }
    })
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FetchOptions {
    method: String,
    headers: HashMap<String, String>,
    insecure: bool,
    body: String,
}

/// Synchronous outbound HTTP. Blocks the script thread; the overall script
/// deadline still applies at the next executed instruction.
fn fetch_fn(lua: &Lua) -> mlua::Result<mlua::Function> {
    lua.create_function(|lua, (url, options): (String, Option<LuaValue>)| {
        let options: FetchOptions = match options {
            Some(value) => match lua.from_value(value) {
                Ok(options) => options,
                Err(err) => {
                    return json_to_lua(
                        lua,
                        &json!({ "__throw": format!("fetchSync: invalid options: {err}") }),
                    );
                }
            },
            None => FetchOptions::default(),
        };

        match fetch_blocking(&url, &options) {
            Ok(response) => json_to_lua(lua, &response),
            Err(message) => json_to_lua(lua, &json!({ "__throw": format!("fetchSync: {message}") })),
        }
    })
}

fn fetch_blocking(url: &str, options: &FetchOptions) -> Result<serde_json::Value, String> {
    let client = reqwest::blocking::Client::builder()
        .danger_accept_invalid_certs(options.insecure)
        .build()
        .map_err(|e| e.to_string())?;

    let method = if options.method.is_empty() {
        reqwest::Method::GET
    } else {
        reqwest::Method::from_bytes(options.method.to_uppercase().as_bytes())
            .map_err(|e| e.to_string())?
    };

    let mut request = client.request(method, url);
    for (key, value) in &options.headers {
        request = request.header(key, value);
    }
    if !options.body.is_empty() {
        request = request.body(options.body.clone());
    }

    let response = request.send().map_err(|e| e.to_string())?;
    let status = response.status();
    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
        .collect();
    let body = response.text().map_err(|e| e.to_string())?;

    Ok(json!({
        "status": status.as_u16(),
        "statusText": status.canonical_reason().unwrap_or(""),
        "headers": headers,
        "__body": body,
    }))
}

/// Split a `"ns/name"` lookup into its parts.
fn split_namespaced_name(name: &str) -> (Option<&str>, &str) {
    match name.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, name),
    }
}

fn cache_disabled(options: &Option<LuaValue>) -> bool {
    let Some(LuaValue::Table(table)) = options else {
        return false;
    };
    matches!(table.get::<LuaValue>("cache"), Ok(LuaValue::Boolean(false)))
}

fn get_fn(lua: &Lua, host: HostApi) -> mlua::Result<mlua::Function> {
    lua.create_function(
        move |lua, (kind, api_version, name, options): (String, String, String, Option<LuaValue>)| {
            let gvk = GvkKey::from_api_version(&api_version, &kind);
            let (namespace, name) = split_namespaced_name(&name);
            let uncached = cache_disabled(&options);

            let result = host.runtime.block_on(async {
                if uncached {
                    let resolved = host.cache.resolve(&gvk).await.map_err(|e| e.to_string())?;
                    let api: Api<DynamicObject> = match namespace {
                        Some(ns) if resolved.namespaced => {
                            Api::namespaced_with(host.client.clone(), ns, &resolved.resource)
                        }
                        _ => Api::all_with(host.client.clone(), &resolved.resource),
                    };
                    api.get_opt(name).await.map_err(|e| e.to_string())
                } else {
                    host.cache
                        .get(&gvk, namespace, name)
                        .await
                        .map_err(|e| e.to_string())
                }
            });

            match result {
                Ok(Some(obj)) => match serde_json::to_value(&obj) {
                    Ok(value) => json_to_lua(lua, &json!({ "object": value })),
                    Err(err) => throw(lua, "SerializeObject", &err.to_string()),
                },
                Ok(None) => json_to_lua(lua, &json!({})),
                Err(message) => throw(lua, "RetrieveObject", &message),
            }
        },
    )
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ListOptions {
    namespace: Option<String>,
    label_selector: Option<String>,
    cache: Option<serde_json::Value>,
}

fn list_fn(lua: &Lua, host: HostApi) -> mlua::Result<mlua::Function> {
    lua.create_function(
        move |lua, (kind, api_version, options): (String, String, Option<LuaValue>)| {
            // Accept both "Pod" and "PodList" spellings.
            let kind = kind.strip_suffix("List").unwrap_or(&kind).to_string();
            let gvk = GvkKey::from_api_version(&api_version, &kind);

            let options: ListOptions = match options {
                Some(value) => match lua.from_value(value) {
                    Ok(options) => options,
                    Err(err) => return throw(lua, "UnmarshalOptions", &err.to_string()),
                },
                None => ListOptions::default(),
            };

            let selector = match options.label_selector.as_deref() {
                Some(raw) => match raw.parse::<kube::core::Selector>() {
                    Ok(selector) => Some(selector),
                    Err(err) => return throw(lua, "ParseLabelSelector", &err.to_string()),
                },
                None => None,
            };

            let uncached = matches!(options.cache, Some(serde_json::Value::Bool(false)));
            let namespace = options.namespace.as_deref();

            let result = host.runtime.block_on(async {
                if uncached {
                    let resolved = host.cache.resolve(&gvk).await.map_err(|e| e.to_string())?;
                    let api: Api<DynamicObject> = match namespace {
                        Some(ns) if resolved.namespaced => {
                            Api::namespaced_with(host.client.clone(), ns, &resolved.resource)
                        }
                        _ => Api::all_with(host.client.clone(), &resolved.resource),
                    };
                    let mut params = ListParams::default();
                    if let Some(raw) = options.label_selector.as_deref() {
                        params = params.labels(raw);
                    }
                    let list = api.list(&params).await.map_err(|e| e.to_string())?;
                    Ok(list.items)
                } else {
                    host.cache
                        .list(&gvk, namespace, selector.as_ref())
                        .await
                        .map_err(|e| e.to_string())
                }
            });

            match result {
                Ok(items) => match serde_json::to_value(&items) {
                    Ok(value) => json_to_lua(lua, &json!({ "list": value })),
                    Err(err) => throw(lua, "SerializeList", &err.to_string()),
                },
                Err(message) => throw(lua, "ErrorListing", &message),
            }
        },
    )
}

#[derive(Clone, Copy)]
enum WriteOp {
    Create,
    Update,
    Remove,
}

/// Uncached writes. Failures come back as structured `{ok=false, reason,
/// message}` results rather than thrown errors, so scripts can branch on
/// conflict and not-found conditions.
fn write_fn(lua: &Lua, host: HostApi, op: WriteOp) -> mlua::Result<mlua::Function> {
    lua.create_function(move |lua, object: LuaValue| {
        let value: serde_json::Value = match lua.from_value(object) {
            Ok(value) => value,
            Err(err) => return throw(lua, "UnmarshalObject", &err.to_string()),
        };

        let obj: DynamicObject = match serde_json::from_value(value.clone()) {
            Ok(obj) => obj,
            Err(err) => return throw(lua, "UnmarshalObject", &err.to_string()),
        };

        let api_version = obj
            .types
            .as_ref()
            .map(|t| t.api_version.clone())
            .unwrap_or_default();
        let kind = obj
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_default();
        if api_version.is_empty() || kind.is_empty() {
            return throw(lua, "UnmarshalObject", "object needs apiVersion and kind");
        }
        let gvk = GvkKey::from_api_version(&api_version, &kind);

        let result: Result<serde_json::Value, (String, String)> = host.runtime.block_on(async {
            let resolved = host
                .cache
                .resolve(&gvk)
                .await
                .map_err(|e| ("ResolveKind".to_string(), e.to_string()))?;

            let namespace = obj.metadata.namespace.clone();
            let api: Api<DynamicObject> = match namespace.as_deref() {
                Some(ns) if resolved.namespaced => {
                    Api::namespaced_with(host.client.clone(), ns, &resolved.resource)
                }
                _ => Api::all_with(host.client.clone(), &resolved.resource),
            };
            let name = obj.metadata.name.clone().unwrap_or_default();

            let outcome = match op {
                WriteOp::Create => api.create(&PostParams::default(), &obj).await.map(Some),
                WriteOp::Update => api
                    .replace(&name, &PostParams::default(), &obj)
                    .await
                    .map(Some),
                WriteOp::Remove => api
                    .delete(&name, &DeleteParams::default())
                    .await
                    .map(|either| either.left()),
            };

            match outcome {
                Ok(applied) => {
                    let object = applied.as_ref().unwrap_or(&obj);
                    serde_json::to_value(object)
                        .map_err(|e| ("SerializeObject".to_string(), e.to_string()))
                }
                Err(kube::Error::Api(err)) => Err((err.reason.clone(), err.message.clone())),
                Err(err) => Err(("InternalError".to_string(), err.to_string())),
            }
        });

        match result {
            Ok(object) => json_to_lua(lua, &json!({ "ok": true, "object": object })),
            Err((reason, message)) => {
                warn!(reason = %reason, "script write request failed");
                json_to_lua(
                    lua,
                    &json!({ "ok": false, "reason": reason, "message": message }),
                )
            }
        }
    })
}
