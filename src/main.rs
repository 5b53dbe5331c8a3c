//! OPC UA cloud gateway.
//!
//! Reads a persisted JSON node configuration, maintains one OPC UA
//! session per configured endpoint, and republishes value-change
//! notifications to a cloud-bound egress queue.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opcua_cloud_gateway::egress::TokioChannelEgressQueue;
use opcua_cloud_gateway::opcua::client::RealOpcClient;
use opcua_cloud_gateway::opcua::registry::{SessionDefaults, SessionRegistry};
use opcua_cloud_gateway::cli;

const DEFAULT_SESSION_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_KEEP_ALIVE_INTERVAL_SEC: u64 = 10;
const DEFAULT_KEEP_ALIVE_DISCONNECT_THRESHOLD: u32 = 3;
const DEFAULT_BACKOFF_MAX: u32 = 10;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let _log_guard = init_logging(&cli);

    tracing::info!("starting OPC UA cloud gateway");

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(cli))
}

fn init_logging(cli: &cli::Cli) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(&cli.log_dir, "gateway.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(cli.default_log_level().into()),
        )
        .init();

    guard
}

async fn run(cli: cli::Cli) -> Result<()> {
    let config_path = cli.resolved_config_path();
    tracing::info!(path = %config_path.display(), "using node configuration file");

    // The first read has to succeed for the gateway to start at all;
    // later re-reads (inside `SessionRegistry::reconcile_all`) instead
    // log and keep running on whatever configuration was last good.
    opcua_cloud_gateway::config::file::read_config(&config_path)
        .map_err(|e| anyhow::anyhow!("failed to read node configuration at startup: {e}"))?;

    let application_uri =
        std::env::var("GATEWAY_APPLICATION_URI").unwrap_or_else(|_| "urn:opcua-cloud-gateway".to_string());
    let shopfloor_domain = std::env::var("GATEWAY_SHOPFLOOR_DOMAIN").ok().filter(|s| !s.is_empty());

    let client = Arc::new(RealOpcClient::new(
        "opcua-cloud-gateway",
        application_uri.clone(),
    )?);

    let (egress_queue, egress_rx) = TokioChannelEgressQueue::new();
    spawn_egress_drain(egress_rx);

    let cancellation = CancellationToken::new();
    let defaults = SessionDefaults {
        session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
        keep_alive_interval_sec: DEFAULT_KEEP_ALIVE_INTERVAL_SEC,
        keep_alive_disconnect_threshold: DEFAULT_KEEP_ALIVE_DISCONNECT_THRESHOLD,
        backoff_max: DEFAULT_BACKOFF_MAX,
        fetch_display_name: true,
        application_uri,
        shopfloor_domain,
        force_node_id_on_persist: cli.force_node_id_on_persist,
    };

    let registry = Arc::new(SessionRegistry::new(
        config_path,
        client,
        Arc::new(egress_queue),
        defaults,
        cancellation.clone(),
    ));

    let registry_handle = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.run().await })
    };

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining sessions");
    cancellation.cancel();

    if let Err(e) = registry_handle.await {
        tracing::error!(error = ?e, "registry task panicked during shutdown");
    }

    Ok(())
}

/// The egress queue only hands envelopes off; actually shipping them to
/// the cloud message sink is not implemented here. This drains the
/// channel so it never backs up and logs what would have been
/// published, standing in for the real transport.
fn spawn_egress_drain(mut receiver: tokio::sync::mpsc::UnboundedReceiver<String>) {
    tokio::spawn(async move {
        while let Some(envelope) = receiver.recv().await {
            tracing::debug!(envelope, "notification ready for cloud egress");
        }
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
