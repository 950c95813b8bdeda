//! `keyrotd`: control-plane node daemon entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise telemetry (JSON logs, optional OTLP export).
//! 3. Open the shared datastore.
//! 4. Build the rotation controller and bootstrap or adopt this node's
//!    encryption configuration.
//! 5. Build peer handles for the status fan-out.
//! 6. Build the Axum router and serve HTTP or HTTPS until ctrl-c.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use keyrotd::config::Config;
use keyrotd::datastore::{Datastore, DirDatastore};
use keyrotd::encryption::EncryptionConfigStore;
use keyrotd::marker::MarkerPublisher;
use keyrotd::reencrypt::ReencryptionEngine;
use keyrotd::rotation::RotationController;
use keyrotd::server::{self, state::AppState};
use keyrotd::telemetry;
use keyrotd::verifier::{ConsistencyVerifier, HttpNode, NodeHandle, PeerClient};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    let _ = rustls::crypto::ring::default_provider().install_default();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %cfg.node_name,
        port = cfg.listen_port,
        tls = cfg.tls_paths().is_some(),
        "keyrotd starting"
    );

    // -----------------------------------------------------------------------
    // 3. Shared datastore
    // -----------------------------------------------------------------------
    let datastore: Arc<dyn Datastore> = Arc::new(
        DirDatastore::open(&cfg.datastore_dir)
            .await
            .context("failed to open shared datastore")?,
    );

    // -----------------------------------------------------------------------
    // 4. Rotation controller + bootstrap
    // -----------------------------------------------------------------------
    let marker = MarkerPublisher::new(Arc::clone(&datastore), &cfg.cluster_token)
        .context("failed to derive marker sealing key")?;
    let controller = Arc::new(RotationController::new(
        cfg.node_name.clone(),
        EncryptionConfigStore::in_data_dir(&cfg.data_dir),
        Arc::clone(&datastore),
        marker,
        ReencryptionEngine::new(cfg.record_prefix.clone()),
        cfg.provider()?,
    ));
    let local = controller
        .bootstrap()
        .await
        .context("failed to bootstrap encryption config")?;
    info!(
        stage = %local.stage,
        enabled = local.enabled,
        hash = %local.config_hash,
        "encryption config loaded"
    );

    // -----------------------------------------------------------------------
    // 5. Peers
    // -----------------------------------------------------------------------
    let client = PeerClient::new(cfg.tls_ca_path.as_deref().map(std::path::Path::new))?;
    let peers: Vec<Arc<dyn NodeHandle>> = cfg
        .peer_list()?
        .into_iter()
        .map(|p| Arc::new(HttpNode::new(p.name, p.url, client.clone())) as Arc<dyn NodeHandle>)
        .collect();
    if peers.is_empty() {
        warn!("no peers configured; status will only cover this node");
    }

    // -----------------------------------------------------------------------
    // 6. HTTP server
    // -----------------------------------------------------------------------
    let state = AppState::new(
        Arc::clone(&controller),
        peers,
        ConsistencyVerifier::new(cfg.status_timeout()),
    );
    let router = server::router::build(state);

    let shutdown = controller.cancellation_token();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                shutdown.cancel();
            }
        }
    });

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.listen_port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening");

    match cfg.tls_paths() {
        Some((cert, key)) => {
            let tls = server::tls::load_server_config(cert, key)?;
            server::tls::serve_tls(listener, tls, router, shutdown).await?;
        }
        None => {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await?;
        }
    }

    telemetry::shutdown_telemetry();
    Ok(())
}
