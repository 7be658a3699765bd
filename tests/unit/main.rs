//! Unit tests for luapolicy.
//!
//! These tests run without a Kubernetes cluster and exercise components
//! through the public API.
//!
//! Test code is allowed to use expect() for error handling
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod crd_tests {
    use luapolicy::crd::{
        Condition, LuaPolicySpec, Operation, PolicyPhase, PolicyType, ViolationPolicy,
    };

    #[test]
    fn policy_type_display() {
        assert_eq!(PolicyType::Validating.to_string(), "Validating");
        assert_eq!(PolicyType::Mutating.to_string(), "Mutating");
        assert_eq!(PolicyType::Controller.to_string(), "Controller");
    }

    #[test]
    fn policy_type_default_is_validating() {
        assert_eq!(PolicyType::default(), PolicyType::Validating);
    }

    #[test]
    fn phase_display() {
        assert_eq!(PolicyPhase::Synced.to_string(), "Synced");
        assert_eq!(PolicyPhase::Failed.to_string(), "Failed");
    }

    #[test]
    fn condition_constructors() {
        let c = Condition::r#true("BundleCompiled");
        assert_eq!(c.r#type, "BundleCompiled");
        assert_eq!(c.status, "True");
        assert!(c.is_true());

        let c = Condition::r#false(
            "WebhookReady",
            "SyncFailed",
            luapolicy::crd::ConditionSeverity::Error,
            "boom",
        );
        assert_eq!(c.status, "False");
        assert_eq!(c.reason, "SyncFailed");
        assert!(!c.is_true());
    }

    #[test]
    fn spec_round_trips_through_json() {
        let json = serde_json::json!({
            "script": "deny(\"no\")",
            "type": "Controller",
            "operations": ["CREATE", "DELETE"],
            "resources": ["configmaps"],
            "violationPolicy": "dry",
            "auditPolicy": "skip",
            "timeoutSeconds": 5,
        });
        let spec: LuaPolicySpec = serde_json::from_value(json).expect("valid spec");
        assert_eq!(spec.r#type, PolicyType::Controller);
        assert_eq!(
            spec.operations,
            vec![Operation::Create, Operation::Delete]
        );
        assert_eq!(spec.violation_policy, Some(ViolationPolicy::Dry));
        assert_eq!(spec.timeout().as_secs(), 5);
    }
}

mod hash_tests {
    use luapolicy::util::hash::hash_bundle_source;
    use std::collections::BTreeMap;

    // Reconciling the same policy twice must compute the same hash, so the
    // second pass issues no bundle write.
    #[test]
    fn repeated_hashing_is_idempotent() {
        let mut deps = BTreeMap::new();
        deps.insert("mod".to_string(), "return 1".to_string());

        let first = hash_bundle_source("allow()", &deps).expect("hash");
        let second = hash_bundle_source("allow()", &deps).expect("hash");
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn script_change_changes_the_hash() {
        let deps = BTreeMap::new();
        let before = hash_bundle_source("allow()", &deps).expect("hash");
        let after = hash_bundle_source("deny(\"no\")", &deps).expect("hash");
        assert_ne!(before, after);
    }
}

mod queue_tests {
    use luapolicy::background::RateLimitedQueue;
    use std::time::Duration;

    // A controller policy that keeps calling requeue() must see its key
    // again with rate-limited backoff, several times within seconds.
    #[tokio::test]
    async fn rescheduled_key_is_redelivered_repeatedly() {
        let queue = RateLimitedQueue::new();
        queue.add("v1||ConfigMap|default|cm");

        let mut deliveries = 0;
        while deliveries < 3 {
            let key = tokio::time::timeout(Duration::from_secs(5), queue.get())
                .await
                .expect("key should be redelivered within 5s")
                .expect("queue is not shut down");
            deliveries += 1;
            queue.add_rate_limited(&key);
            queue.done(&key);
        }
        assert!(queue.retries("v1||ConfigMap|default|cm") >= 3);
    }

    #[tokio::test]
    async fn forget_resets_the_backoff() {
        let queue = RateLimitedQueue::new();
        queue.add_rate_limited("key");
        queue.add_rate_limited("key");
        assert_eq!(queue.retries("key"), 2);
        queue.forget("key");
        assert_eq!(queue.retries("key"), 0);
    }
}

mod bundle_tests {
    use luapolicy::bundle::{Bundler, LuaBundler};
    use luapolicy::util::compress;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn bundle_payload_decompresses_to_runnable_lua() {
        let bundler = LuaBundler::new();
        let payload = bundler
            .bundle("x = 1 + 1", &BTreeMap::new(), Duration::from_secs(30))
            .expect("bundle");
        let script = compress::decompress(&payload).expect("gzip payload");
        assert_eq!(script, "x = 1 + 1");
    }

    #[test]
    fn invalid_lua_is_rejected_at_bundle_time() {
        let bundler = LuaBundler::new();
        assert!(
            bundler
                .bundle("function(", &BTreeMap::new(), Duration::from_secs(30))
                .is_err()
        );
    }
}

mod validation_tests {
    use kube::api::ObjectMeta;
    use luapolicy::crd::{LuaPolicy, LuaPolicySpec, Operation};
    use luapolicy::webhook::validation::validate_policy;

    fn policy(name: &str) -> LuaPolicy {
        LuaPolicy {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: LuaPolicySpec {
                script: "allow()".to_string(),
                operations: vec![Operation::All],
                resources: vec!["pods".to_string()],
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn domain_qualified_names_pass() {
        assert!(validate_policy(&policy("a.test"), None).is_empty());
        assert!(validate_policy(&policy("deny-pods.company.tld"), None).is_empty());
    }

    #[test]
    fn bare_names_fail() {
        assert!(!validate_policy(&policy("denypods"), None).is_empty());
    }
}

mod pool_tests {
    use luapolicy::cache::ObjectCache;
    use luapolicy::vm::{HostApi, VmPool};
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

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

    fn host_api() -> HostApi {
        let client = stub_client();
        HostApi {
            cache: ObjectCache::new(
                client.clone(),
                Duration::from_secs(3600),
                Duration::from_secs(3600),
            ),
            client,
            runtime: tokio::runtime::Handle::current(),
            global_context: String::new(),
        }
    }

    // Pool invariant: across arbitrary concurrent acquire/release cycles the
    // number of contexts is preserved.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_use_preserves_pool_size() {
        let pool = VmPool::new(3, host_api()).expect("pool");
        let cancel = CancellationToken::new();

        let mut tasks = Vec::new();
        for i in 0..12 {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let vm = pool.acquire(&cancel).await.expect("acquire");
                tokio::task::block_in_place(|| {
                    vm.run_script_with_timeout(
                        &format!("x = {i}"),
                        "stress",
                        Duration::from_secs(5),
                    )
                    .expect("trivial script");
                    pool.release(vm);
                });
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }

        assert_eq!(pool.idle(), 3);
    }
}
