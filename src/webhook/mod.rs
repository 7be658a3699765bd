//! Admission webhook server.
//!
//! Serves two HTTPS endpoints:
//! - `POST /policy/{name}` — evaluate the named policy against an admission
//!   review (v1 or v1beta1; the response echoes the request's version)
//! - `POST /crds` — schema validation for LuaPolicy objects themselves
//!
//! TLS certificates are expected on disk (`tls.crt` / `tls.key`); the
//! external issuer keeps them current.

pub mod audit;
mod handler;
pub mod validation;

pub use handler::{HandleOutcome, HandlerError, PolicyHandler, errored};

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use kube::Client;
use kube::api::{Api, DynamicObject};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use serde_json::json;
use tracing::{debug, error, info};

use crate::crd::{AuditPolicy, LuaPolicy, ViolationPolicy};

/// Port the webhook server binds; the service maps 443 onto it.
pub const WEBHOOK_PORT: u16 = 9443;

/// The admission review version responses are processed as.
const ADMISSION_V1: &str = "admission.k8s.io/v1";

/// Shared state for webhook handlers.
pub struct WebhookState {
    pub client: Client,
    pub handler: Arc<PolicyHandler>,
}

/// Create the webhook router.
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/policy/{name}", post(handle_policy))
        .route("/crds", post(handle_crds))
        .with_state(state)
}

/// Decode an admission review body. Both v1 and v1beta1 reviews share the
/// same shape, so a v1beta1 review is coerced to v1 for processing; the
/// original apiVersion is returned so the response can echo it.
fn decode_review(
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(AdmissionRequest<DynamicObject>, String), String> {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != "application/json" {
        return Err(format!(
            "contentType={content_type}, expected application/json"
        ));
    }

    let mut value: serde_json::Value =
        serde_json::from_slice(body).map_err(|err| format!("decode admission review: {err}"))?;
    if !value.is_object() {
        return Err("decode admission review: body is not an object".to_string());
    }
    let api_version = value["apiVersion"]
        .as_str()
        .unwrap_or(ADMISSION_V1)
        .to_string();
    value["apiVersion"] = json!(ADMISSION_V1);

    let review: AdmissionReview<DynamicObject> =
        serde_json::from_value(value).map_err(|err| format!("decode admission review: {err}"))?;
    let request: AdmissionRequest<DynamicObject> = review
        .try_into()
        .map_err(|err| format!("extract admission request: {err}"))?;

    Ok((request, api_version))
}

/// Wrap a response into a review envelope, echoing the request's version and
/// attaching warnings.
fn review_body(
    response: AdmissionResponse,
    api_version: &str,
    warnings: &[String],
) -> serde_json::Value {
    let review = response.into_review();
    let mut value = serde_json::to_value(&review).unwrap_or_else(|err| {
        error!(error = %err, "unable to encode admission review");
        json!({})
    });
    value["apiVersion"] = json!(api_version);
    if !warnings.is_empty() {
        value["response"]["warnings"] = json!(warnings);
    }
    value
}

/// A bare (requestless) errored review for bodies we could not decode.
fn bare_errored(code: u16, message: &str) -> serde_json::Value {
    json!({
        "apiVersion": ADMISSION_V1,
        "kind": "AdmissionReview",
        "response": {
            "uid": "",
            "allowed": false,
            "status": { "message": message, "code": code },
        },
    })
}

async fn handle_policy(
    State(state): State<Arc<WebhookState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let (request, api_version) = match decode_review(&headers, &body) {
        Ok(decoded) => decoded,
        Err(message) => {
            error!(policy = %name, message = %message, "bad admission request");
            return (StatusCode::BAD_REQUEST, Json(bare_errored(400, &message)));
        }
    };

    debug!(
        policy = %name,
        uid = %request.uid,
        operation = ?request.operation,
        kind = ?request.kind,
        "processing admission request"
    );

    let policies: Api<LuaPolicy> = Api::all(state.client.clone());
    let policy = match policies.get_opt(&name).await {
        Ok(Some(policy)) => policy,
        Ok(None) => {
            let message = format!("policy {name} not found");
            error!(policy = %name, "find policy: not found");
            return (
                StatusCode::BAD_REQUEST,
                Json(review_body(
                    errored(&request, 400, &message),
                    &api_version,
                    &[],
                )),
            );
        }
        Err(err) => {
            error!(policy = %name, error = %err, "find policy");
            return (
                StatusCode::BAD_REQUEST,
                Json(review_body(
                    errored(&request, 400, &err.to_string()),
                    &api_version,
                    &[],
                )),
            );
        }
    };

    let outcome = state.handler.handle(&request, &policy).await;
    let execution_failed = outcome.raw.is_none();
    let mut warnings: Vec<String> = outcome
        .warnings
        .iter()
        .map(|w| format!("[{name}]: {w}"))
        .collect();
    let mut response = outcome.response;

    // Violation-policy remapping happens after the core outcome so denied and
    // mutated decisions are still recorded even when suppressed.
    if !response.allowed {
        if !execution_failed && policy.spec.audit_policy != Some(AuditPolicy::Skip) {
            let client = state.client.clone();
            let audit_request = request.clone();
            let audit_response = response.clone();
            let audit_policy = policy.clone();
            tokio::spawn(async move {
                audit::log_request(client, &audit_request, &audit_response, &audit_policy, 5)
                    .await;
            });
        }

        if !execution_failed {
            match policy.spec.violation_policy {
                Some(ViolationPolicy::Warn) | Some(ViolationPolicy::Dry) => {
                    warnings.push(format!("[{}]: {}", name, response.result.message));
                    response = AdmissionResponse::from(&request);
                }
                _ => {}
            }
        }
    } else if policy.spec.violation_policy == Some(ViolationPolicy::Dry) {
        // No mutation may come through a dry-run policy.
        response = AdmissionResponse::from(&request);
    }

    let status = if execution_failed {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (status, Json(review_body(response, &api_version, &warnings)))
}

async fn handle_crds(
    State(_state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let (request, api_version) = match decode_review(&headers, &body) {
        Ok(decoded) => decoded,
        Err(message) => {
            error!(message = %message, "bad policy validation request");
            return (StatusCode::BAD_REQUEST, Json(bare_errored(400, &message)));
        }
    };

    let response = validation::handle(&request);
    (StatusCode::OK, Json(review_body(response, &api_version, &[])))
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("webhook server error: {0}")]
    Server(String),
}

/// Run the webhook server with TLS.
///
/// Binds 0.0.0.0:9443 and serves `/policy/{name}` and `/crds`. Certificates
/// are loaded from `cert_dir` (`tls.crt` / `tls.key`).
pub async fn run_webhook_server(
    state: Arc<WebhookState>,
    cert_dir: &str,
) -> Result<(), WebhookError> {
    use axum_server::tls_rustls::RustlsConfig;
    use std::net::SocketAddr;
    use std::path::Path;

    let app = create_webhook_router(state);

    let cert_path = Path::new(cert_dir).join("tls.crt");
    let key_path = Path::new(cert_dir).join("tls.key");
    let config = RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .map_err(|err| WebhookError::TlsConfig(err.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));
    info!(port = WEBHOOK_PORT, "webhook server listening with TLS");

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|err| WebhookError::Server(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review_json() -> serde_json::Value {
        json!({
            "apiVersion": "admission.k8s.io/v1beta1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "abc-123",
                "kind": { "group": "", "version": "v1", "kind": "Pod" },
                "resource": { "group": "", "version": "v1", "resource": "pods" },
                "name": "mypod",
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": { "username": "alice", "uid": "u-1" },
                "object": {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": { "name": "mypod", "namespace": "default" },
                },
            },
        })
    }

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers
    }

    #[test]
    fn decode_coerces_v1beta1_and_remembers_the_version() {
        let body = serde_json::to_vec(&review_json()).unwrap();
        let (request, api_version) = decode_review(&json_headers(), &body).unwrap();
        assert_eq!(api_version, "admission.k8s.io/v1beta1");
        assert_eq!(request.uid, "abc-123");
        assert_eq!(request.name, "mypod");
    }

    #[test]
    fn decode_rejects_wrong_content_type() {
        let body = serde_json::to_vec(&review_json()).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain".parse().unwrap());
        let err = decode_review(&headers, &body).unwrap_err();
        assert!(err.contains("application/json"));
    }

    #[test]
    fn decode_rejects_garbage_bodies() {
        assert!(decode_review(&json_headers(), b"{not json").is_err());
    }

    #[test]
    fn review_body_echoes_version_and_warnings() {
        let body = serde_json::to_vec(&review_json()).unwrap();
        let (request, api_version) = decode_review(&json_headers(), &body).unwrap();

        let response = AdmissionResponse::from(&request);
        let value = review_body(
            response,
            &api_version,
            &["[a.test]: careful".to_string()],
        );

        assert_eq!(value["apiVersion"], "admission.k8s.io/v1beta1");
        assert_eq!(value["response"]["uid"], "abc-123");
        assert_eq!(value["response"]["allowed"], true);
        assert_eq!(value["response"]["warnings"][0], "[a.test]: careful");
    }
}
