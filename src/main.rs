use configpropagator::config::ControllerConfig;
use configpropagator::controller::clock::SystemClock;
use configpropagator::controller::dispatch::Dispatcher;
use configpropagator::controller::events::KubeEventSink;
use configpropagator::controller::kube_client::{KubeClusterClient, KubePropagationStore};
use configpropagator::controller::Context;
use configpropagator::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use kube::Client;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Reporting controller name on published Events
const CONTROLLER_NAME: &str = "configpropagator-controller";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // kube's rustls stack needs a process-wide provider
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider already installed");
    }

    let config = ControllerConfig::from_env();
    info!(
        health_port = config.health_port,
        default_batch_size = config.default_batch_size,
        reconcile_timeout_secs = config.reconcile_timeout.as_secs(),
        error_requeue_secs = config.error_requeue.as_secs(),
        "Starting ConfigPropagation controller"
    );

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics()
        .map_err(|e| anyhow::anyhow!("failed to create metrics registry: {e}"))?;

    let health_handle = {
        let readiness = readiness.clone();
        let metrics = metrics.clone();
        let signal = shutdown_controller.signal();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(port, readiness, metrics, signal).await {
                warn!(error = %e, "Health server failed");
            }
        })
    };

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let ctx = Arc::new(Context::new(
        Arc::new(KubeClusterClient::new(client.clone())),
        Arc::new(KubePropagationStore::new(client.clone())),
        Arc::new(KubeEventSink::new(client.clone(), CONTROLLER_NAME)),
        Arc::new(SystemClock),
        config.default_batch_size,
        Some(metrics),
    ));

    let dispatcher = Dispatcher::new(ctx, config.dispatch_settings());
    // The dispatcher marks the process ready once its cache has synced
    let mut dispatcher_handle =
        tokio::spawn(dispatcher.run(client, readiness.clone(), shutdown_signal));

    tokio::select! {
        _ = &mut dispatcher_handle => {
            warn!("Dispatcher exited unexpectedly");
        }
        signal = wait_for_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "Initiating graceful shutdown"),
                Err(e) => error!(error = %e, "Signal handling failed, shutting down"),
            }
        }
    }

    readiness.set_not_ready();
    shutdown_controller.shutdown();

    if !dispatcher_handle.is_finished() {
        if let Err(e) = dispatcher_handle.await {
            warn!(error = %e, "Dispatcher task failed");
        }
    }
    if let Err(e) = health_handle.await {
        warn!(error = %e, "Health server task failed");
    }

    info!("ConfigPropagation controller shut down gracefully");
    Ok(())
}
