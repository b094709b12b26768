//! Image Clone Controller
//!
//! Main entry point. Sets up the Kubernetes client and the registry
//! collaborators, then runs one reconciliation loop per workload kind.

use std::sync::Arc;

use clap::Parser;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use image_clone_controller::{
    adapters::{credentials::PullSecretCredentialProvider, registry::OciRegistryClient},
    config::{Config, LogFormat},
    controllers::{workload_controller, Context},
    metrics,
    reconcilers::image_clone::ImageCloner,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    init_tracing(config.log_format);

    info!("Starting Image Clone Controller {}", env!("CARGO_PKG_VERSION"));
    config.validate()?;

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let shutdown = CancellationToken::new();
    let credentials = Arc::new(PullSecretCredentialProvider::new(
        client.clone(),
        config.controller_namespace.clone(),
        config.pull_secrets.clone(),
    ));
    let registry = Arc::new(OciRegistryClient::new(
        config.registry_timeout(),
        config.insecure_registries.clone(),
    )?);
    let cloner = ImageCloner::from_config(&config, credentials, registry, shutdown.clone());

    info!(
        mirror_prefix = %config.mirror_prefix,
        excluded_namespaces = ?config.excluded_namespaces,
        "Mirroring workload images"
    );

    // Create shared context
    let context = Context::new(client, cloner);

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(config.metrics_port));
    info!("Metrics server starting on port {}", config.metrics_port);

    // Run one controller per workload kind
    let deployment_handle = tokio::spawn(workload_controller::run::<Deployment>(context.clone()));
    let daemonset_handle = tokio::spawn(workload_controller::run::<DaemonSet>(context));

    // Handle graceful shutdown
    tokio::select! {
        _ = deployment_handle => {
            error!("Deployment controller exited unexpectedly");
            metrics::CONTROLLER_HEALTH.set(0.0);
        }
        _ = daemonset_handle => {
            error!("DaemonSet controller exited unexpectedly");
            metrics::CONTROLLER_HEALTH.set(0.0);
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping controller");
        }
    }

    // Abort in-flight registry copies before anything is committed
    shutdown.cancel();

    info!("Image Clone Controller stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,image_clone_controller=debug,kube=warn,hyper=warn")
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install CTRL+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
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
