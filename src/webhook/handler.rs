//! Policy execution for admission requests.
//!
//! Fetches the policy's bundle, runs the script on a pooled context and maps
//! the recorded verdict onto an admission response. Shared by the HTTP
//! dispatcher and the background controller workers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::Client;
use kube::api::{Api, DynamicObject};
use kube::core::Status;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::ResourceExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::crd::{LuaPolicy, LuaPolicyBundle, PolicyType};
use crate::health::EngineMetrics;
use crate::util::compress;
use crate::vm::{RawResponse, VmError, VmPool};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("couldn't find bundle for policy {0}")]
    BundleMissing(String),

    #[error("error decompressing bundle for policy {0}: {1}")]
    BundleDecompress(String, String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Vm(#[from] VmError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("patch serialization error: {0}")]
    Patch(String),

    #[error("request cancelled while waiting for a script context")]
    Cancelled,
}

/// Result of one policy evaluation.
pub struct HandleOutcome {
    pub response: AdmissionResponse,
    /// The verdict as the script recorded it, before any violation-policy
    /// remapping. Absent when execution failed before a verdict existed.
    pub raw: Option<RawResponse>,
    /// Warnings to attach to the admission response.
    pub warnings: Vec<String>,
    pub elapsed: Duration,
}

/// Executes policies against admission requests.
pub struct PolicyHandler {
    client: Client,
    pool: Arc<VmPool>,
    metrics: Arc<EngineMetrics>,
    cancel: CancellationToken,
    profiling: bool,
}

impl PolicyHandler {
    pub fn new(
        client: Client,
        pool: Arc<VmPool>,
        metrics: Arc<EngineMetrics>,
        cancel: CancellationToken,
        profiling: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            pool,
            metrics,
            cancel,
            profiling,
        })
    }

    /// Evaluate a policy against a request. Failures surface as an errored
    /// (500) response rather than an HTTP transport error so the apiserver's
    /// failure policy decides the outcome.
    pub async fn handle(
        &self,
        req: &AdmissionRequest<DynamicObject>,
        policy: &LuaPolicy,
    ) -> HandleOutcome {
        let name = policy.name_any();
        let (response, raw, warnings, elapsed) = match self.evaluate(req, policy).await {
            Ok((response, raw, elapsed)) => {
                let warnings = raw.warnings.clone();
                (response, Some(raw), warnings, elapsed)
            }
            Err(err) => {
                error!(policy = %name, error = %err, "error executing policy");
                (
                    errored(req, 500, &err.to_string()),
                    None,
                    Vec::new(),
                    Duration::ZERO,
                )
            }
        };

        let status_code = match response.result.code {
            0 => 200,
            code => code,
        };
        self.metrics.record_execution(
            &policy.spec.r#type.to_string(),
            &name,
            status_code,
            elapsed.as_secs_f64(),
        );
        if self.profiling && elapsed > Duration::ZERO {
            info!(policy = %name, elapsed = ?elapsed, "policy execution finished");
        }

        HandleOutcome {
            response,
            raw,
            warnings,
            elapsed,
        }
    }

    async fn evaluate(
        &self,
        req: &AdmissionRequest<DynamicObject>,
        policy: &LuaPolicy,
    ) -> Result<(AdmissionResponse, RawResponse, Duration), HandlerError> {
        let name = policy.name_any();
        let timeout = policy.spec.timeout();

        let script = self.fetch_bundle(&name).await?;
        let request_value = serde_json::to_value(req)?;
        let (raw, elapsed) = self
            .run_script(script, name.clone(), request_value, timeout)
            .await?;

        // deny wins over everything else
        if raw.deny {
            let mut response = AdmissionResponse::from(req);
            response.allowed = false;
            let reason = raw.reason.clone().unwrap_or_else(|| "Forbidden".to_string());
            let message = raw.message.clone().unwrap_or_default();
            let code = raw.code.unwrap_or(403);
            response.result = Status::failure(&message, &reason).with_code(code);
            return Ok((response, raw, elapsed));
        }

        // a patched object only has effect on mutating policies
        if let Some(patched) = &raw.patched {
            if policy.spec.r#type == PolicyType::Mutating {
                let original = match &req.object {
                    Some(object) => serde_json::to_value(object)?,
                    None => serde_json::Value::Null,
                };
                let patch = json_patch::diff(&original, patched);
                let response = AdmissionResponse::from(req)
                    .with_patch(patch)
                    .map_err(|err| HandlerError::Patch(err.to_string()))?;
                return Ok((response, raw, elapsed));
            }
        }

        Ok((AdmissionResponse::from(req), raw, elapsed))
    }

    /// One bundle read per evaluation; the bundle object is the source of
    /// truth shared by every replica serving this policy.
    async fn fetch_bundle(&self, name: &str) -> Result<String, HandlerError> {
        let bundles: Api<LuaPolicyBundle> = Api::all(self.client.clone());
        let bundle = bundles
            .get_opt(name)
            .await?
            .ok_or_else(|| HandlerError::BundleMissing(name.to_string()))?;

        compress::decompress(&bundle.spec.bundle)
            .map_err(|err| HandlerError::BundleDecompress(name.to_string(), err.to_string()))
    }

    async fn run_script(
        &self,
        script: String,
        origin: String,
        request: serde_json::Value,
        timeout: Duration,
    ) -> Result<(RawResponse, Duration), HandlerError> {
        let vm = self
            .pool
            .acquire(&self.cancel)
            .await
            .ok_or(HandlerError::Cancelled)?;

        let result = tokio::task::spawn_blocking(move || {
            let run = vm
                .bind_request(&origin, &request)
                .and_then(|_| {
                    let started = Instant::now();
                    vm.run_script_with_timeout(&script, &origin, timeout)
                        .map(|_| started.elapsed())
                })
                .and_then(|elapsed| vm.take_response().map(|raw| (raw, elapsed)));
            (vm, run)
        })
        .await;

        match result {
            Ok((vm, run)) => {
                // Reset happens off the response path.
                self.pool.release_async(vm);
                Ok(run?)
            }
            // The blocking task panicked and took its context with it; the
            // pool is now permanently short one context.
            Err(join_err) => {
                error!(error = %join_err, "script execution task failed; vm pool corrupted");
                std::process::exit(1);
            }
        }
    }
}

/// Build an errored admission response with the given status code.
pub fn errored(
    req: &AdmissionRequest<DynamicObject>,
    code: u16,
    message: &str,
) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(req);
    response.allowed = false;
    response.result = Status::failure(message, "").with_code(code);
    response
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    // The emitted patch must transform the request object into exactly what
    // the script returned from mutate().
    #[test]
    fn mutation_diff_applies_back_to_the_original() {
        let original = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "mypod", "namespace": "default" },
        });
        let patched = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "mypod",
                "namespace": "default",
                "labels": { "x": "1" },
            },
        });

        let patch = json_patch::diff(&original, &patched);
        assert!(!patch.0.is_empty());

        let mut doc = original.clone();
        json_patch::patch(&mut doc, &patch).expect("patch applies");
        assert_eq!(doc, patched);
    }

    #[test]
    fn identical_objects_produce_an_empty_patch() {
        let object = json!({ "metadata": { "name": "same" } });
        let patch = json_patch::diff(&object, &object);
        assert!(patch.0.is_empty());
    }
}
