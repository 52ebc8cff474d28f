//! Control-plane reconciliation engine
//!
//! Main entry point. Loads configuration, connects the record store and the
//! provisioning driver, and runs the scheduler and cascade loops until a
//! shutdown signal arrives.

use std::sync::Arc;

use kube::Client;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use control_plane_reconciler::{
    adapters::{DriverRegistry, NoopDriver, WebhookDriver},
    clock::SystemClock,
    config::{EngineConfig, StoreBackend},
    controllers::{self, Context},
    metrics,
    resource::ResourceKind,
    store::{KubeStore, MemoryStore, ResourceStore},
};

/// Change events buffered between the executors and the cascade loop
const EVENT_BUFFER: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    init_tracing(&config.log_format);
    config.validate()?;

    info!("Starting control-plane reconciler");

    let store: Arc<dyn ResourceStore> = match &config.store {
        StoreBackend::Memory => {
            warn!("Using in-memory store; records are lost on restart");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Kubernetes { namespace } => {
            let client = Client::try_default().await?;
            info!(namespace = %namespace, "Connected to Kubernetes API server");
            Arc::new(KubeStore::new(client, namespace))
        }
    };

    let drivers = match &config.driver_endpoint {
        Some(endpoint) => {
            info!(endpoint = %endpoint, "Using provisioning webhook");
            DriverRegistry::new().with_fallback(Arc::new(WebhookDriver::new(
                endpoint.clone(),
                config.driver_timeout(),
            )?))
        }
        None => {
            warn!("DRIVER_ENDPOINT not set, every action will be accepted without provisioning");
            DriverRegistry::new().with_fallback(Arc::new(NoopDriver::default()))
        }
    };

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let context = Arc::new(
        Context::new(store, Arc::new(SystemClock), drivers, config.clone()).with_events(events_tx),
    );
    let shutdown = CancellationToken::new();

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(config.metrics_port));
    info!("Metrics server starting on port {}", config.metrics_port);

    let mut loops = JoinSet::new();
    for kind in ResourceKind::ALL {
        for _ in 0..config.workers_per_kind {
            let worker = uuid::Uuid::new_v4().to_string();
            loops.spawn(controllers::run_scheduler(
                kind,
                worker,
                context.clone(),
                shutdown.clone(),
            ));
        }
    }
    loops.spawn(controllers::run_cascade_controller(
        context.clone(),
        events_rx,
        shutdown.clone(),
    ));
    info!(
        kinds = ResourceKind::ALL.len(),
        workers_per_kind = config.workers_per_kind,
        "Control loops running"
    );

    tokio::select! {
        _ = loops.join_next() => {
            error!("A control loop exited unexpectedly");
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping reconciler");
        }
    }

    metrics::OPERATOR_HEALTH.set(0.0);
    shutdown.cancel();
    while loops.join_next().await.is_some() {}

    info!("Control-plane reconciler stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing(format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        "text" => registry.with(tracing_subscriber::fmt::layer()).init(),
        _ => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
