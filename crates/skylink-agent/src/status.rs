//! Status broadcast loop — aggregates the component snapshots into one
//! envelope every second and publishes it on a broadcast channel for the
//! (out-of-scope) push layer to fan out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use skylink_common::models::{FailoverStatus, OptimizerStatus, PoolStatus};
use skylink_media::pipeline::StreamStatus;

use crate::app::AppContext;

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub cpu_percent: f32,
    pub mem_used_mb: u32,
    pub uptime_s: u64,
}

/// One aggregated snapshot. Pure reads of atomic counters and
/// mutex-protected fields; producing it has no side effects.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub timestamp: DateTime<Utc>,
    pub stream: StreamStatus,
    pub pool: PoolStatus,
    pub failover: FailoverStatus,
    pub optimizer: OptimizerStatus,
    pub system: SystemStats,
}

/// Run the broadcast loop until shutdown flips.
pub async fn run(
    ctx: Arc<AppContext>,
    tx: broadcast::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut sys = sysinfo::System::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }

        sys.refresh_cpu_all();
        sys.refresh_memory();

        let snapshot = StatusSnapshot {
            timestamp: Utc::now(),
            stream: ctx.pipeline.get_status().await,
            pool: ctx.pool.get_status().await,
            failover: ctx.failover.get_status().await,
            optimizer: ctx.optimizer.get_status().await,
            system: SystemStats {
                cpu_percent: sys.global_cpu_usage(),
                mem_used_mb: (sys.used_memory() / 1_048_576) as u32,
                uptime_s: uptime_s(),
            },
        };

        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                // No subscribers is fine; the channel just drops it.
                let _ = tx.send(json);
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize status snapshot"),
        }
    }
}

fn uptime_s() -> u64 {
    std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|s| s.split_whitespace().next().map(|v| v.to_string()))
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| v as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AgentConfig;

    #[tokio::test]
    async fn snapshot_serializes() {
        let ctx = AppContext::build(AgentConfig::default(), true);
        let (tx, mut rx) = broadcast::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run(ctx, tx, shutdown_rx, Duration::from_millis(50)));

        let json = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["stream"]["state"].is_string());
        assert!(value["pool"]["total_modems"].is_number());
        assert!(value["failover"]["current_mode"].is_string());
        assert!(value["optimizer"]["active"].is_boolean());

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }
}
