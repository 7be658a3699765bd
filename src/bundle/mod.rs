//! Script bundling: turning a policy's source and dependency map into the
//! compressed payload stored in its LuaPolicyBundle.
//!
//! The production bundling toolchain is pluggable behind [`Bundler`]; the
//! in-tree [`LuaBundler`] registers each dependency as a preloaded module,
//! appends the entry script and gzips the result. Syntax errors are caught
//! at bundling time by parsing the assembled chunk in a scratch state.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use crate::util::compress;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("compile error: {0}")]
    Compile(String),

    #[error("compress error: {0}")]
    Compress(#[from] std::io::Error),

    #[error("bundling timed out after {0:?}")]
    Timeout(Duration),
}

/// Produces a compressed script payload from source plus dependencies.
pub trait Bundler: Send + Sync {
    fn bundle(
        &self,
        script: &str,
        dependencies: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BundleError>;
}

/// Self-contained bundler: dependencies become `package.preload` entries so
/// the policy can `require()` them without any filesystem access.
pub struct LuaBundler;

impl LuaBundler {
    pub fn new() -> Self {
        Self
    }

    fn assemble(script: &str, dependencies: &BTreeMap<String, String>) -> String {
        let mut out = String::new();
        for (name, source) in dependencies {
            out.push_str(&format!(
                "package.preload[{name:?}] = function(...)\n{source}\nend\n"
            ));
        }
        out.push_str(script);
        out
    }
}

impl Default for LuaBundler {
    fn default() -> Self {
        Self::new()
    }
}

impl Bundler for LuaBundler {
    fn bundle(
        &self,
        script: &str,
        dependencies: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BundleError> {
        let started = std::time::Instant::now();
        let assembled = Self::assemble(script, dependencies);

        // Parse without executing: a bundle that cannot even load should be
        // rejected here, not at admission time.
        let scratch = mlua::Lua::new();
        scratch
            .load(&assembled)
            .set_name("bundle")
            .into_function()
            .map_err(|err| BundleError::Compile(err.to_string()))?;

        if started.elapsed() > timeout {
            return Err(BundleError::Timeout(timeout));
        }

        Ok(compress::compress(&assembled)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundles_compress_and_round_trip() {
        let bundler = LuaBundler::new();
        let deps = BTreeMap::new();
        let payload = bundler
            .bundle("allow()", &deps, Duration::from_secs(30))
            .unwrap();
        assert_eq!(compress::decompress(&payload).unwrap(), "allow()");
    }

    #[test]
    fn dependencies_become_preloaded_modules() {
        let bundler = LuaBundler::new();
        let mut deps = BTreeMap::new();
        deps.insert(
            "helpers".to_string(),
            "return { greet = function() return \"hi\" end }".to_string(),
        );
        let payload = bundler
            .bundle(
                "local helpers = require(\"helpers\"); print(helpers.greet())",
                &deps,
                Duration::from_secs(30),
            )
            .unwrap();

        let script = compress::decompress(&payload).unwrap();
        assert!(script.contains("package.preload[\"helpers\"]"));

        // the assembled chunk must actually run
        let lua = mlua::Lua::new();
        lua.globals()
            .set("print", lua.create_function(|_, _: String| Ok(())).unwrap())
            .unwrap();
        lua.load(&script).exec().unwrap();
    }

    #[test]
    fn syntax_errors_fail_the_bundle() {
        let bundler = LuaBundler::new();
        let err = bundler
            .bundle("this is not lua(", &BTreeMap::new(), Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(err, BundleError::Compile(_)));
    }
}
