//! Skylink companion daemon.
//!
//! Runs on the aircraft's companion computer and keeps a low-latency video
//! link alive over a cellular uplink:
//!
//! - builds and supervises the GStreamer streaming pipeline
//! - probes reachability targets and scores every modem continuously
//! - fails over between uplinks with hysteresis, VPN-gated and reversible
//! - installs the "flight mode" network bundle and restores it on exit
//! - in `--simulate` mode, runs against scripted hardware for local dev

mod app;
mod status;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{broadcast, watch};
use tracing_subscriber::EnvFilter;

use skylink_common::models::NetworkMode;
use skylink_media::pipeline::PipelineSpec;

use crate::app::{AgentConfig, AppContext};

/// Skylink companion daemon.
#[derive(Parser, Debug)]
#[command(name = "skylink-agent", about = "Skylink streaming and network-adaptation daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/skylink/agent.toml")]
    config: String,

    /// Run against simulated hardware (no modems or camera required).
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Ground-station address for the UDP sink, overriding the config file.
    #[arg(long)]
    udp_host: Option<String>,

    /// Start the video stream immediately.
    #[arg(long, default_value_t = false)]
    auto_start: bool,

    /// Enable the flight-mode network optimizer at startup.
    #[arg(long, default_value_t = false)]
    flight_mode: bool,

    /// Status broadcast interval in seconds.
    #[arg(long, default_value_t = 1)]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match AgentConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %cli.config, error = %e, "config not loaded, using defaults");
            AgentConfig::default()
        }
    };
    if let Some(udp_host) = cli.udp_host {
        config.streaming.udp_host = udp_host;
    }

    tracing::info!(
        simulate = cli.simulate,
        auto_start = cli.auto_start,
        flight_mode = cli.flight_mode,
        "skylink-agent starting"
    );

    let ctx = AppContext::build(config, cli.simulate);

    // ── Network services ────────────────────────────────────────────
    ctx.monitor.start().await;
    ctx.pool.start().await;

    // Give the pool one synchronous refresh so failover starts with a
    // truthful initial mode.
    ctx.pool.refresh().await;
    let initial_mode = if ctx.pool.get_active_modem().await.is_some() {
        NetworkMode::Modem
    } else {
        NetworkMode::Unknown
    };
    ctx.failover.start(initial_mode).await;

    // ── Flight mode ─────────────────────────────────────────────────
    if cli.flight_mode {
        let report = ctx.optimizer.enable().await;
        if report.success {
            tracing::info!(optimizations = ?report.optimizations, "flight mode enabled");
        } else {
            tracing::warn!(message = %report.message, "flight mode unavailable");
        }
    }

    // ── Video pipeline ──────────────────────────────────────────────
    if cli.auto_start {
        let spec = PipelineSpec::from_configs(&ctx.config.video, &ctx.config.streaming);
        if let Err(e) = ctx.pipeline.build(spec).await {
            tracing::error!(error = %e, "initial stream failed to start");
        }
    }

    // ── Status broadcast ────────────────────────────────────────────
    let (status_tx, _) = broadcast::channel::<String>(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let status_handle = tokio::spawn(status::run(
        ctx.clone(),
        status_tx.clone(),
        shutdown_rx,
        Duration::from_secs(cli.status_interval.max(1)),
    ));

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    tracing::info!("received SIGINT, shutting down");
    let _ = shutdown_tx.send(true);

    shutdown(&ctx).await;
    let _ = status_handle.await;

    tracing::info!("skylink-agent stopped");
    Ok(())
}

/// Ordered teardown: decision loops first so nothing mutates routing while
/// the graph and host tuning are being unwound.
async fn shutdown(ctx: &Arc<AppContext>) {
    ctx.failover.stop().await;
    ctx.pool.stop().await;
    ctx.monitor.stop().await;

    if let Err(e) = ctx.pipeline.stop().await {
        tracing::warn!(error = %e, "pipeline stop failed");
    }

    let optimizer_status = ctx.optimizer.get_status().await;
    if optimizer_status.active {
        ctx.optimizer.disable().await;
    }
}
