//! Monitoring Controller
//!
//! Converges `MonitoringInstance` resources into a running observability
//! stack: a search cluster with its visualizer, metrics and alerting,
//! dashboards, index lifecycle policies and ingress routing.

mod applier;
mod backoff;
mod builder;
mod certs;
mod cluster;
mod config;
mod controller;
mod credentials;
mod error;
mod metrics;
mod objects;
mod queue;
mod reconciler;
mod server;
mod settings;
#[cfg(test)]
mod test_utils;
mod watcher;

use anyhow::Context as _;
use certs::CertificateManager;
use clap::Parser;
use cluster::{ClusterClient, KubeClusterClient};
use config::Config;
use controller::Controller;
use queue::WorkQueue;
use reconciler::gate::SearchGate;
use reconciler::{Context, Reconciler};
use settings::OperatorSettings;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use watcher::WatchScope;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Monitoring Controller");

    if let Err(e) = run(config).await {
        error!("Monitoring Controller failed: {:#}", e);
        return Err(e);
    }
    info!("Monitoring Controller stopped");
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.namespace);
    info!("  Watching: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    if let Some(name) = &config.instance_name {
        info!("  Instance: {}", name);
    }
    info!("  Settings: {}", config.settings_name);
    info!("  Webhook configuration: {}", config.webhook_config_name);
    info!("  Workers: {}", config.workers);

    // Errors only when a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let client = cluster::connect(config.kube_burst, config.rate_limit_window())
        .await
        .context("failed to build Kubernetes client")?;
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));

    let settings = OperatorSettings::load(cluster.as_ref(), &config.namespace, &config.settings_name)
        .await
        .with_context(|| format!("failed to load settings {}/{}", config.namespace, config.settings_name))?;

    let certificates = CertificateManager::new(
        &config.cert_dir,
        &config.webhook_service,
        &config.namespace,
        &settings.cluster_domain,
    );
    let material = certificates
        .ensure()
        .with_context(|| format!("failed to provision webhook certificate in {}", certificates.dir().display()))?;
    let acceptor = material.acceptor().context("failed to load webhook certificate")?;
    // Retried by the renewal task on its next check.
    if let Err(e) = certs::publish_ca_bundle(cluster.as_ref(), &config.webhook_config_name, &material.ca_pem).await {
        error!("Failed to publish webhook CA bundle: {}", e);
    }

    let metrics = metrics::Metrics::new().context("failed to register metrics")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (acceptor_tx, acceptor_rx) = watch::channel(Arc::new(acceptor));

    let servers: Vec<JoinHandle<Result<(), error::ControllerError>>> = vec![
        tokio::spawn(server::serve_http(
            listen(config.http_port),
            server::health_router(),
            shutdown_rx.clone(),
        )),
        tokio::spawn(server::serve_http(
            listen(settings.metrics_port),
            server::metrics_router(metrics.clone()),
            shutdown_rx.clone(),
        )),
        tokio::spawn(server::serve_webhook(
            listen(config.webhook_port),
            server::webhook_router(),
            acceptor_rx,
            shutdown_rx.clone(),
        )),
    ];
    let renewal = tokio::spawn(server::renew_certificates(
        certificates,
        Arc::clone(&cluster),
        config.webhook_config_name.clone(),
        acceptor_tx,
        shutdown_rx,
    ));

    let queue = Arc::new(WorkQueue::with_metrics(metrics.clone()));
    let gate = Arc::new(SearchGate::new(
        Arc::clone(&cluster),
        settings.cluster_domain.clone(),
        config.readiness_timeout(),
    ));
    let reconciler = Arc::new(Reconciler::new(Context {
        client: cluster,
        settings,
        metrics,
        gate,
    }));
    let scope = WatchScope {
        namespace: config.watch_namespace.clone(),
        instance_name: config.instance_name.clone(),
    };

    let controller = Controller::new(client, scope, queue, reconciler, config.workers, config.shutdown_grace());
    let result = controller.run(stop_requested(servers)).await;

    shutdown_tx.send_replace(true);
    if let Err(e) = renewal.await {
        error!("Certificate renewal task failed: {}", e);
    }
    result?;
    Ok(())
}

fn listen(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
}

/// Resolves on SIGINT/SIGTERM, or when any HTTP server exits.
async fn stop_requested(servers: Vec<JoinHandle<Result<(), error::ControllerError>>>) {
    let servers = futures::future::select_all(servers);
    tokio::select! {
        () = termination() => info!("Termination signal received"),
        (result, index, _) = servers => match result {
            Ok(Ok(())) => info!("HTTP server {} stopped", index),
            Ok(Err(e)) => error!("HTTP server {} failed: {}", index, e),
            Err(e) => error!("HTTP server {} panicked: {}", index, e),
        },
    }
}

async fn termination() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
