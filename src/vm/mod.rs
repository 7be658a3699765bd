//! Script runtime: isolated Lua contexts with host bindings and a
//! deadline-enforced execution path.
//!
//! Each [`PolicyVm`] owns a single Lua state (a private heap). Verdict
//! functions populate the `__response` global and raise a termination
//! sentinel; the host reads `__response` back after the run. Between
//! invocations the whole state is discarded and rebuilt so no data leaks
//! between unrelated policy runs that happen to share a context.

mod host;
mod pool;

pub use host::{HostApi, json_to_lua};
pub use pool::VmPool;

use std::time::{Duration, Instant};

use mlua::{Lua, LuaSerdeExt, VmState};
use serde::Deserialize;
use thiserror::Error;

/// How often the termination hook checks the deadline, in VM instructions.
const HOOK_INSTRUCTION_INTERVAL: u32 = 4096;

/// Deadline for running the prelude itself.
const PRELUDE_TIMEOUT: Duration = Duration::from_secs(10);

/// The policy-facing standard library. Installed after the host bindings so
/// it can wrap the raw `__`-prefixed functions.
const PRELUDE: &str = r#"
__response = {}

local function __throw(result)
    if type(result) == "table" and result.__throw then
        error({ reason = result.reason, message = result.message }, 0)
    end
    return result
end

function exit()
    __exit()
end

function warn(message)
    if __response.warnings == nil then
        __response.warnings = {}
    end
    table.insert(__response.warnings, message)
end

function allow()
    exit()
end

function deny(message, reason, code)
    __response.deny = true
    __response.message = message
    __response.reason = reason
    __response.code = code
    exit()
end

function mutate(obj)
    __response.patched = obj
    exit()
end

function requeue(message)
    __response.reschedule = true
    __response.message = message
    exit()
end

function get(kind, apiVersion, name, options)
    if options ~= nil and options.cache == "smart" then
        local found = __throw(__get(kind, apiVersion, name)).object
        if found ~= nil then
            return found
        end
        return __throw(__get(kind, apiVersion, name, { cache = false })).object
    end
    return __throw(__get(kind, apiVersion, name, options)).object
end

function list(kind, apiVersion, options)
    return __throw(__list(kind, apiVersion, options)).list
end

function create(obj)
    return __throw(__create(obj))
end

function update(obj)
    return __throw(__update(obj))
end

function remove(obj)
    return __throw(__remove(obj))
end

function fetchSync(url, options)
    local res = __fetchSync(url, options)
    if res.__throw then
        error(res.__throw, 0)
    end
    return {
        status = res.status,
        statusText = res.statusText,
        headers = res.headers,
        ok = res.status >= 200 and res.status < 300,
        text = function() return res.__body end,
        json = function() return __jsonDecode(res.__body) end,
    }
end
"#;

/// Raised by `__exit` to stop execution after a verdict was recorded.
#[derive(Debug)]
pub(crate) struct ScriptExit;

impl std::fmt::Display for ScriptExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "script exited")
    }
}

impl std::error::Error for ScriptExit {}

/// Raised by the instruction hook once the run deadline has passed.
#[derive(Debug)]
struct ScriptTerminated;

impl std::fmt::Display for ScriptTerminated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "script execution terminated")
    }
}

impl std::error::Error for ScriptTerminated {}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("script {0} timed out")]
    Timeout(String),

    #[error("uncaught {0}")]
    Script(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] mlua::Error),
}

/// The verdict a script left in `__response`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawResponse {
    pub deny: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub code: Option<u16>,
    pub patched: Option<serde_json::Value>,
    pub warnings: Vec<String>,
    pub reschedule: bool,
}

/// One isolated script execution context.
pub struct PolicyVm {
    lua: Lua,
    api: HostApi,
}

impl PolicyVm {
    /// Build a fresh context: new state, host bindings, prelude.
    pub fn new(api: HostApi) -> Result<Self, VmError> {
        let lua = Self::fresh_context(&api)?;
        Ok(Self { lua, api })
    }

    fn fresh_context(api: &HostApi) -> Result<Lua, VmError> {
        let lua = Lua::new();
        host::install(&lua, api)?;

        let mut prelude = PRELUDE.to_string();
        if !api.global_context.is_empty() {
            prelude.push('\n');
            prelude.push_str(&api.global_context);
        }

        run_on(&lua, &prelude, "prelude", PRELUDE_TIMEOUT)?;
        Ok(lua)
    }

    /// Discard the execution global state and rebuild the context. Called on
    /// every pool release so the next invocation starts clean.
    pub fn recreate_context(&mut self) -> Result<(), VmError> {
        self.lua = Self::fresh_context(&self.api)?;
        Ok(())
    }

    /// Bind the per-invocation globals: the policy name and the admission
    /// request the script sees.
    pub fn bind_request(
        &self,
        policy: &str,
        request: &serde_json::Value,
    ) -> Result<(), VmError> {
        let globals = self.lua.globals();
        globals.set("__policy", policy)?;
        globals.set("request", json_to_lua(&self.lua, request)?)?;
        Ok(())
    }

    /// Run a script under a hard deadline. Distinguishes a timeout from an
    /// uncaught script error; a verdict-triggered early exit is a normal
    /// completion.
    pub fn run_script_with_timeout(
        &self,
        script: &str,
        origin: &str,
        timeout: Duration,
    ) -> Result<(), VmError> {
        run_on(&self.lua, script, origin, timeout)
    }

    /// Read the verdict the script recorded.
    pub fn take_response(&self) -> Result<RawResponse, VmError> {
        let value: mlua::Value = self.lua.globals().get("__response")?;
        if value.is_nil() {
            return Ok(RawResponse::default());
        }
        Ok(self.lua.from_value(value)?)
    }
}

fn run_on(lua: &Lua, script: &str, origin: &str, timeout: Duration) -> Result<(), VmError> {
    let deadline = Instant::now() + timeout;
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_lua, _debug| {
            if Instant::now() >= deadline {
                Err(mlua::Error::external(ScriptTerminated))
            } else {
                Ok(VmState::Continue)
            }
        },
    );

    let result = lua.load(script).set_name(origin).exec();
    lua.remove_hook();

    match result {
        Ok(()) => Ok(()),
        Err(err) if is_external::<ScriptExit>(&err) => Ok(()),
        Err(err) if is_external::<ScriptTerminated>(&err) => {
            Err(VmError::Timeout(origin.to_string()))
        }
        Err(err) => Err(VmError::Script(err.to_string())),
    }
}

/// Walk an mlua error chain looking for a host-raised sentinel.
fn is_external<T: std::error::Error + 'static>(err: &mlua::Error) -> bool {
    match err {
        mlua::Error::CallbackError { cause, .. } => is_external::<T>(cause),
        mlua::Error::WithContext { cause, .. } => is_external::<T>(cause),
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<T>().is_some(),
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::convert::Infallible;
    use std::time::Duration;

    use super::HostApi;
    use crate::cache::ObjectCache;

    /// A kube client whose every request answers 404. Good enough for VM
    /// tests that never touch the cluster.
    fn stub_client() -> kube::Client {
        let service = tower::service_fn(|_req: http::Request<kube::client::Body>| async move {
            let status = serde_json::json!({
                "kind": "Status",
                "apiVersion": "v1",
                "status": "Failure",
                "reason": "NotFound",
                "code": 404,
            });
            let body = serde_json::to_vec(&status).expect("static json");
            Ok::<_, Infallible>(
                http::Response::builder()
                    .status(404)
                    .header("content-type", "application/json")
                    .body(kube::client::Body::from(body))
                    .expect("static response"),
            )
        });
        kube::Client::new(service, "default")
    }

    pub fn host_api() -> HostApi {
        let client = stub_client();
        let cache = ObjectCache::new(
            client.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        HostApi {
            cache,
            client,
            runtime: tokio::runtime::Handle::current(),
            global_context: String::new(),
        }
    }

    pub fn host_api_with_prelude(global_context: &str) -> HostApi {
        let mut api = host_api();
        api.global_context = global_context.to_string();
        api
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_fixture() -> serde_json::Value {
        serde_json::json!({
            "uid": "test-uid",
            "kind": { "group": "", "version": "v1", "kind": "Pod" },
            "name": "mypod",
            "namespace": "default",
            "operation": "CREATE",
            "object": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "name": "mypod", "namespace": "default" },
            },
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deny_verdict_round_trips() {
        let vm = PolicyVm::new(test_support::host_api()).unwrap();
        vm.bind_request("a.test", &request_fixture()).unwrap();

        tokio::task::block_in_place(|| {
            vm.run_script_with_timeout(
                r#"deny("no", "NoPod", 400)"#,
                "a.test",
                Duration::from_secs(5),
            )
            .unwrap();
        });

        let response = vm.take_response().unwrap();
        assert!(response.deny);
        assert_eq!(response.message.as_deref(), Some("no"));
        assert_eq!(response.reason.as_deref(), Some("NoPod"));
        assert_eq!(response.code, Some(400));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn statements_after_a_verdict_do_not_run() {
        let vm = PolicyVm::new(test_support::host_api()).unwrap();
        vm.bind_request("a.test", &request_fixture()).unwrap();

        tokio::task::block_in_place(|| {
            vm.run_script_with_timeout(
                r#"
                    allow()
                    deny("unreachable")
                "#,
                "a.test",
                Duration::from_secs(5),
            )
            .unwrap();
        });

        let response = vm.take_response().unwrap();
        assert!(!response.deny);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mutate_records_patched_object() {
        let vm = PolicyVm::new(test_support::host_api()).unwrap();
        vm.bind_request("mutate.test", &request_fixture()).unwrap();

        tokio::task::block_in_place(|| {
            vm.run_script_with_timeout(
                r#"
                    local obj = request.object
                    obj.metadata.labels = { x = "1" }
                    mutate(obj)
                "#,
                "mutate.test",
                Duration::from_secs(5),
            )
            .unwrap();
        });

        let response = vm.take_response().unwrap();
        let patched = response.patched.expect("patched object");
        assert_eq!(patched["metadata"]["labels"]["x"], "1");
        assert_eq!(patched["metadata"]["name"], "mypod");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn warnings_accumulate_without_exiting() {
        let vm = PolicyVm::new(test_support::host_api()).unwrap();
        vm.bind_request("warn.test", &request_fixture()).unwrap();

        tokio::task::block_in_place(|| {
            vm.run_script_with_timeout(
                r#"
                    warn("first")
                    warn("second")
                "#,
                "warn.test",
                Duration::from_secs(5),
            )
            .unwrap();
        });

        let response = vm.take_response().unwrap();
        assert!(!response.deny);
        assert_eq!(response.warnings, vec!["first", "second"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requeue_sets_reschedule() {
        let vm = PolicyVm::new(test_support::host_api()).unwrap();
        vm.bind_request("bg.test", &request_fixture()).unwrap();

        tokio::task::block_in_place(|| {
            vm.run_script_with_timeout(
                r#"requeue("not ready")"#,
                "bg.test",
                Duration::from_secs(5),
            )
            .unwrap();
        });

        let response = vm.take_response().unwrap();
        assert!(response.reschedule);
        assert_eq!(response.message.as_deref(), Some("not ready"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn infinite_loop_times_out_with_distinct_error() {
        let vm = PolicyVm::new(test_support::host_api()).unwrap();
        vm.bind_request("loop.test", &request_fixture()).unwrap();

        let started = std::time::Instant::now();
        let err = tokio::task::block_in_place(|| {
            vm.run_script_with_timeout(
                "while true do end",
                "loop.test",
                Duration::from_millis(200),
            )
            .unwrap_err()
        });

        assert!(matches!(err, VmError::Timeout(_)));
        assert!(err.to_string().contains("loop.test"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn uncaught_error_is_a_script_error() {
        let vm = PolicyVm::new(test_support::host_api()).unwrap();
        vm.bind_request("err.test", &request_fixture()).unwrap();

        let err = tokio::task::block_in_place(|| {
            vm.run_script_with_timeout(
                r#"error("boom")"#,
                "err.test",
                Duration::from_secs(5),
            )
            .unwrap_err()
        });

        assert!(matches!(err, VmError::Script(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recreate_clears_leaked_globals() {
        let mut vm = PolicyVm::new(test_support::host_api()).unwrap();
        vm.bind_request("leak.test", &request_fixture()).unwrap();

        tokio::task::block_in_place(|| {
            vm.run_script_with_timeout(
                r#"leaked = "secret"; deny("x")"#,
                "leak.test",
                Duration::from_secs(5),
            )
            .unwrap();
        });

        vm.recreate_context().unwrap();
        vm.bind_request("leak.test", &request_fixture()).unwrap();

        tokio::task::block_in_place(|| {
            vm.run_script_with_timeout(
                r#"
                    if leaked ~= nil then
                        deny("leaked state visible")
                    end
                "#,
                "leak.test",
                Duration::from_secs(5),
            )
            .unwrap();
        });

        let response = vm.take_response().unwrap();
        assert!(!response.deny, "fresh context must not see old globals");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn global_context_extends_the_prelude() {
        let api = test_support::host_api_with_prelude(
            "function defaultLabels() return { team = \"core\" } end",
        );
        let vm = PolicyVm::new(api).unwrap();
        vm.bind_request("ext.test", &request_fixture()).unwrap();

        tokio::task::block_in_place(|| {
            vm.run_script_with_timeout(
                r#"deny(defaultLabels().team)"#,
                "ext.test",
                Duration::from_secs(5),
            )
            .unwrap();
        });

        let response = vm.take_response().unwrap();
        assert_eq!(response.message.as_deref(), Some("core"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn base64_helpers_round_trip() {
        let vm = PolicyVm::new(test_support::host_api()).unwrap();
        vm.bind_request("b64.test", &request_fixture()).unwrap();

        tokio::task::block_in_place(|| {
            vm.run_script_with_timeout(
                r#"
                    local encoded = btoa("hello")
                    if atob(encoded) ~= "hello" then
                        deny("base64 mismatch: " .. encoded)
                    end
                "#,
                "b64.test",
                Duration::from_secs(5),
            )
            .unwrap();
        });

        assert!(!vm.take_response().unwrap().deny);
    }
}
