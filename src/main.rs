//! luapolicy - a programmable admission and background policy engine.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Creates the Kubernetes client, the VM pool and the object cache
//! - Starts the webhook, liveness and metrics servers
//! - Runs leader election and, as leader, the policy reconciler

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use luapolicy::background::PolicyManager;
use luapolicy::bundle::LuaBundler;
use luapolicy::cache::ObjectCache;
use luapolicy::config::Settings;
use luapolicy::health::{EngineMetrics, run_liveness_server, run_metrics_server};
use luapolicy::reconciler::{self, Context, webhook_config};
use luapolicy::vm::{HostApi, VmPool};
use luapolicy::webhook::{PolicyHandler, WebhookState, run_webhook_server};

/// Lease configuration
const LEASE_NAME: &str = "luapolicy-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env().map_err(std::io::Error::other)?;

    let default_level = if settings.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("luapolicy={default_level}").parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();

    info!("starting luapolicy");

    let client = Client::try_default().await?;
    info!("connected to Kubernetes cluster");

    // CA bundle for the webhook configurations this engine materializes. An
    // external issuer keeps the files current.
    let ca_path = Path::new(&settings.cert_dir).join("ca.crt");
    let ca_bundle = std::fs::read(&ca_path).unwrap_or_else(|err| {
        warn!(path = %ca_path.display(), error = %err, "no CA bundle found");
        Vec::new()
    });

    let shutdown = CancellationToken::new();

    // Object cache and script runtime pool shared by admission and
    // background execution.
    let cache = ObjectCache::new(client.clone(), settings.cache_resync, settings.cache_cleanup);
    let host_api = HostApi {
        cache: Arc::clone(&cache),
        client: client.clone(),
        runtime: tokio::runtime::Handle::current(),
        global_context: settings.global_context.clone(),
    };
    let pool = VmPool::new(settings.vm_pool_size, host_api)?;
    info!(size = pool.size(), "script runtime pool ready");

    let metrics = Arc::new(EngineMetrics::new());
    let handler = PolicyHandler::new(
        client.clone(),
        Arc::clone(&pool),
        Arc::clone(&metrics),
        shutdown.clone(),
        settings.profiling,
    );
    let manager = PolicyManager::new(client.clone(), Arc::clone(&cache), Arc::clone(&handler));

    // Liveness on :80 immediately; probes must work before leadership.
    let liveness_handle = tokio::spawn(async {
        if let Err(err) = run_liveness_server().await {
            error!(error = %err, "liveness server error");
        }
    });
    let metrics_handle = {
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            if let Err(err) = run_metrics_server(metrics).await {
                error!(error = %err, "metrics server error");
            }
        })
    };

    // Admission traffic is served by every replica, leader or not.
    let webhook_handle = {
        let state = Arc::new(WebhookState {
            client: client.clone(),
            handler: Arc::clone(&handler),
        });
        let cert_dir = settings.cert_dir.clone();
        tokio::spawn(async move {
            if let Err(err) = run_webhook_server(state, &cert_dir).await {
                error!(error = %err, "webhook server error");
            }
        })
    };

    // The background manager runs on every replica as well: it owns the
    // cache's informer garbage collection.
    let manager_handle = {
        let manager = Arc::clone(&manager);
        let cancel = shutdown.clone();
        tokio::spawn(async move { manager.start(cancel).await })
    };

    // Leadership gates the reconciler: only one replica may drive bundles,
    // webhook configurations and controller records.
    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let lease_lock = LeaseLock::new(
        client.clone(),
        &settings.namespace,
        LeaseLockParams {
            holder_id: pod_name.clone(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    );

    info!(holder_id = %pod_name, lease = LEASE_NAME, "waiting to acquire leadership");
    loop {
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("acquired leadership");
                break;
            }
            Ok(_) => info!("another instance is leader, waiting"),
            Err(err) => warn!(error = %err, "failed to acquire lease, retrying"),
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    // Renew in the background. Lost leadership is fatal: the process exits
    // and re-enters the election on restart.
    #[allow(clippy::exit)]
    let lease_handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
            match lease_lock.try_acquire_or_renew().await {
                Ok(result) if !result.acquired_lease => {
                    error!("lost leadership, shutting down");
                    std::process::exit(1);
                }
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, "failed to renew lease, shutting down");
                    std::process::exit(1);
                }
            }
        }
    });

    // Install the validation webhook for LuaPolicy objects themselves.
    if settings.update_webhook {
        webhook_config::ensure_crd_webhook_configuration(&client, &settings, &ca_bundle).await?;
    } else {
        info!("UPDATE_WEBHOOK=false, skipping policy validation webhook install");
    }

    let ctx = Context::new(
        client.clone(),
        Arc::clone(&manager),
        Arc::new(LuaBundler::new()),
        settings,
        ca_bundle,
    );
    let reconciler_handle = tokio::spawn(reconciler::run_reconciler(ctx));

    tokio::select! {
        result = reconciler_handle => {
            if let Err(err) = result {
                error!(error = %err, "reconciler task panicked");
            }
        }
        result = webhook_handle => {
            if let Err(err) = result {
                error!(error = %err, "webhook server task panicked");
            }
        }
        result = liveness_handle => {
            if let Err(err) = result {
                error!(error = %err, "liveness server task panicked");
            }
        }
        result = metrics_handle => {
            if let Err(err) = result {
                error!(error = %err, "metrics server task panicked");
            }
        }
        // Lease renewal only exits via process::exit or panic.
        Err(err) = lease_handle => {
            error!(error = %err, "lease renewal task panicked");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal, stopping");
            shutdown.cancel();
            // Give background workers a moment to drain.
            let _ = tokio::time::timeout(Duration::from_secs(5), manager_handle).await;
        }
    }

    info!("luapolicy stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
///
/// Signal handler setup failures are fatal: without them the engine cannot
/// shut down gracefully, so expect() here is intentional.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
