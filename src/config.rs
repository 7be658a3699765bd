//! Process configuration derived from environment variables.

use std::time::Duration;

/// Default number of VM contexts in the pool.
const DEFAULT_VM_POOL_SIZE: usize = 4;
/// Default deadline for a bundling step.
const DEFAULT_BUNDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Idle informers are garbage collected after this window.
const DEFAULT_CACHE_CLEANUP: Duration = Duration::from_secs(3 * 60 * 60);
/// Base resync period for informers (jittered per informer).
const DEFAULT_CACHE_RESYNC: Duration = Duration::from_secs(6 * 60 * 60);

/// Settings read once at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Number of script contexts kept in the runtime pool (`VM_POOL_SIZE`).
    pub vm_pool_size: usize,
    /// Deadline for a single bundling step (`BUNDLE_TIMEOUT`, seconds).
    pub bundle_timeout: Duration,
    /// Verbose logging (`DEBUG=true`).
    pub debug: bool,
    /// Namespace the engine runs in (`KUBE_NAMESPACE`).
    pub namespace: String,
    /// Service name webhook configurations point at (`LUA_POLICY_SERVICE_NAME`).
    pub service_name: String,
    /// Direct URL override for webhook client configs (`LUA_POLICY_WEBHOOK_URL`).
    pub webhook_url: Option<String>,
    /// Whether the engine installs its own /crds webhook configuration
    /// (`UPDATE_WEBHOOK`, suppressed by "false").
    pub update_webhook: bool,
    /// Extra Lua appended to every context prelude (`GLOBAL_CONTEXT`).
    pub global_context: String,
    /// Log per-policy execution time (`PROFILING=true`).
    pub profiling: bool,
    /// Directory holding ca.crt / tls.crt / tls.key (`WEBHOOK_CERT_DIR`).
    pub cert_dir: String,
    /// Idle window after which unused informers are stopped.
    pub cache_cleanup: Duration,
    /// Base informer resync period.
    pub cache_resync: Duration,
}

impl Settings {
    /// Read settings from the environment, applying defaults.
    ///
    /// Returns an error for values that are present but unparsable; the
    /// process should refuse to start rather than run with a half-applied
    /// configuration.
    pub fn from_env() -> Result<Self, String> {
        let vm_pool_size = match std::env::var("VM_POOL_SIZE") {
            Ok(v) => v
                .parse::<usize>()
                .map_err(|e| format!("invalid VM_POOL_SIZE {v:?}: {e}"))?,
            Err(_) => DEFAULT_VM_POOL_SIZE,
        };

        let bundle_timeout = match std::env::var("BUNDLE_TIMEOUT") {
            Ok(v) => {
                let secs = v
                    .parse::<u64>()
                    .map_err(|e| format!("invalid BUNDLE_TIMEOUT {v:?}: {e}"))?;
                Duration::from_secs(secs)
            }
            Err(_) => DEFAULT_BUNDLE_TIMEOUT,
        };

        Ok(Self {
            vm_pool_size: vm_pool_size.max(1),
            bundle_timeout,
            debug: env_flag("DEBUG"),
            namespace: std::env::var("KUBE_NAMESPACE").unwrap_or_else(|_| "default".to_string()),
            service_name: std::env::var("LUA_POLICY_SERVICE_NAME")
                .unwrap_or_else(|_| "luapolicy".to_string()),
            webhook_url: std::env::var("LUA_POLICY_WEBHOOK_URL")
                .ok()
                .filter(|v| !v.is_empty()),
            update_webhook: std::env::var("UPDATE_WEBHOOK").as_deref() != Ok("false"),
            global_context: std::env::var("GLOBAL_CONTEXT").unwrap_or_default(),
            profiling: env_flag("PROFILING"),
            cert_dir: std::env::var("WEBHOOK_CERT_DIR")
                .unwrap_or_else(|_| "/etc/webhook/certs".to_string()),
            cache_cleanup: DEFAULT_CACHE_CLEANUP,
            cache_resync: DEFAULT_CACHE_RESYNC,
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vm_pool_size: DEFAULT_VM_POOL_SIZE,
            bundle_timeout: DEFAULT_BUNDLE_TIMEOUT,
            debug: false,
            namespace: "default".to_string(),
            service_name: "luapolicy".to_string(),
            webhook_url: None,
            update_webhook: true,
            global_context: String::new(),
            profiling: false,
            cert_dir: "/etc/webhook/certs".to_string(),
            cache_cleanup: DEFAULT_CACHE_CLEANUP,
            cache_resync: DEFAULT_CACHE_RESYNC,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).as_deref() == Ok("true")
}
