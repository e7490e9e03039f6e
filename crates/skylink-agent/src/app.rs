//! Application context — service construction and cross-component wiring.
//!
//! The four network singletons and the pipeline are owned here as `Arc`
//! handles; cyclic needs (failover needs to switch modems, the pool needs
//! VPN health) are satisfied with small injected traits rather than
//! back-references.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use skylink_common::config::{
    FailoverConfig, OptimizerConfig, PoolConfig, ProbeConfig, StreamingConfig, VideoConfig,
};
use skylink_common::models::NetworkMode;
use skylink_media::pipeline::StreamingPipeline;
use skylink_media::registry::ProviderRegistry;
use skylink_net::command::{BoxFuture, CommandOutput, SystemCommand, TIMEOUT_APPLY};
use skylink_net::failover::{AutoFailover, SwitchCallback};
use skylink_net::optimizer::NetworkOptimizer;
use skylink_net::pool::ModemPool;
use skylink_net::probe::LatencyMonitor;
use skylink_net::vpn::{CliVpnHealthChecker, TailscaleVpn, VpnHealthProbe};
use skylink_net::{iface, ShellRunner};

/// On-disk agent configuration; every section is optional and falls back
/// to its documented defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub video: VideoConfig,
    pub streaming: StreamingConfig,
    pub probe: ProbeConfig,
    pub failover: FailoverConfig,
    pub optimizer: OptimizerConfig,
    pub pool: PoolConfig,
}

impl AgentConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Everything the daemon's tasks share.
pub struct AppContext {
    pub config: AgentConfig,
    pub simulate: bool,
    pub monitor: Arc<LatencyMonitor>,
    pub pool: Arc<ModemPool>,
    pub failover: Arc<AutoFailover>,
    pub optimizer: Arc<NetworkOptimizer>,
    pub pipeline: Arc<StreamingPipeline>,
    pub registry: Arc<ProviderRegistry>,
}

impl AppContext {
    pub fn build(mut config: AgentConfig, simulate: bool) -> Arc<Self> {
        let runner: Arc<dyn SystemCommand> = if simulate {
            Arc::new(SimulatedHost::new())
        } else {
            Arc::new(ShellRunner)
        };

        if simulate {
            // Simulated hosts have no camera; stream the test pattern.
            config.video.device = "test".into();
        }

        let monitor = LatencyMonitor::new(config.probe.clone(), runner.clone());

        let vpn = Arc::new(TailscaleVpn::new(runner.clone()));
        let vpn_health: Arc<dyn VpnHealthProbe> =
            Arc::new(CliVpnHealthChecker::new(runner.clone(), vpn));

        let pool = Arc::new(
            ModemPool::new(config.pool.clone(), runner.clone())
                .with_monitor(monitor.clone())
                .with_vpn_health(vpn_health),
        );

        let optimizer = NetworkOptimizer::new(config.optimizer.clone(), runner.clone());

        let failover = AutoFailover::new(
            config.failover.clone(),
            monitor.clone(),
            Arc::new(UplinkSwitch {
                pool: pool.clone(),
                runner: runner.clone(),
            }),
        );

        let registry = Arc::new(ProviderRegistry::with_defaults());
        let pipeline = StreamingPipeline::new(registry.clone());

        Arc::new(AppContext {
            config,
            simulate,
            monitor,
            pool,
            failover,
            optimizer,
            pipeline,
            registry,
        })
    }
}

// ── Failover → routing bridge ───────────────────────────────────────

/// Switch callback injected into the failover controller.
///
/// Modem side goes through the pool (so VPN gating and rollback apply);
/// Wi-Fi side is a plain default-route promotion of the first wireless
/// interface with a gateway.
struct UplinkSwitch {
    pool: Arc<ModemPool>,
    runner: Arc<dyn SystemCommand>,
}

impl SwitchCallback for UplinkSwitch {
    fn switch_to<'a>(&'a self, mode: NetworkMode) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match mode {
                NetworkMode::Modem | NetworkMode::Unknown => {
                    match self.pool.get_best_modem().await {
                        Some(best) => self.pool.select_modem(&best.interface, "auto").await,
                        None => {
                            tracing::warn!("no connected modem to switch to");
                            false
                        }
                    }
                }
                NetworkMode::Wifi => self.promote_wifi().await,
            }
        })
    }
}

impl UplinkSwitch {
    async fn promote_wifi(&self) -> bool {
        let addrs = iface::list_addresses(self.runner.as_ref()).await;
        let Some(wifi) = addrs.iter().find(|a| a.interface.starts_with("wl")) else {
            tracing::warn!("no wireless interface present");
            return false;
        };
        let Some(gateway) = iface::gateway_for(self.runner.as_ref(), &wifi.interface).await else {
            tracing::warn!(interface = %wifi.interface, "wireless interface has no gateway");
            return false;
        };

        self.runner
            .run(
                "ip",
                &["route", "del", "default", "via", &gateway, "dev", &wifi.interface],
                TIMEOUT_APPLY,
            )
            .await;
        let out = self
            .runner
            .run(
                "ip",
                &["route", "add", "default", "via", &gateway, "dev", &wifi.interface, "metric", "50"],
                TIMEOUT_APPLY,
            )
            .await;
        out.ok()
    }
}

// ── Simulated hardware ──────────────────────────────────────────────

/// Command runner that answers like a field device with two cellular
/// uplinks. Lets the daemon run end-to-end inside a container with no
/// WWAN hardware: probes see jittered RTTs, the pool sees two modems.
pub struct SimulatedHost;

impl SimulatedHost {
    pub fn new() -> Self {
        SimulatedHost
    }
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCommand for SimulatedHost {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [&'a str],
        _timeout: Duration,
    ) -> BoxFuture<'a, CommandOutput> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");

        Box::pin(async move {
            use rand::Rng;
            let mut rng = rand::rng();

            let stdout = if line.starts_with("ping") || line.starts_with("sudo ping") {
                let rtt = 25.0 + rng.random_range(0.0..20.0_f64);
                format!("64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time={rtt:.1} ms")
            } else if line.contains("-o addr show") {
                "4: wwan0    inet 192.168.8.100/24 brd 192.168.8.255 scope global wwan0\n\
                 5: wwan1    inet 192.168.8.200/24 brd 192.168.8.255 scope global wwan1"
                    .to_string()
            } else if line.contains("route show dev wwan0") {
                "default via 192.168.8.1 metric 700".to_string()
            } else if line.contains("route show dev wwan1") {
                "default via 192.168.8.2 metric 701".to_string()
            } else if line.contains("tcp_congestion_control") && !line.contains("-w") {
                "cubic".to_string()
            } else if line.contains("rmem_max") && !line.contains("-w") {
                "212992".to_string()
            } else if line.contains("wmem_max") && !line.contains("-w") {
                "212992".to_string()
            } else if line.contains("link show") {
                "4: wwan0: <UP> mtu 1500 qdisc fq_codel state UP".to_string()
            } else {
                String::new()
            };

            CommandOutput {
                stdout,
                stderr: String::new(),
                status: 0,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skylink_net::command::TIMEOUT_READ;

    #[tokio::test]
    async fn simulated_host_answers_pings() {
        let host = SimulatedHost::new();
        let out = host
            .run("ping", &["-c", "1", "-W", "2", "8.8.8.8"], TIMEOUT_READ)
            .await;
        assert!(out.ok());
        assert!(skylink_net::probe::parse_rtt_ms(&out.stdout).is_some());
    }

    #[tokio::test]
    async fn simulated_host_reports_two_modems() {
        let host = SimulatedHost::new();
        let addrs = iface::list_addresses(&host).await;
        let modems = iface::modem_interfaces(&addrs, "192.168.8");
        assert_eq!(modems.len(), 2);
    }

    #[tokio::test]
    async fn simulated_context_builds_and_refreshes() {
        let ctx = AppContext::build(AgentConfig::default(), true);
        ctx.pool.refresh().await;
        let status = ctx.pool.get_status().await;
        assert_eq!(status.total_modems, 2);
        assert_eq!(status.connected_modems, 2);
    }

    #[test]
    fn config_defaults_parse_from_empty_toml() {
        let config: AgentConfig = toml::from_str("").unwrap();
        assert_eq!(config.failover.latency_check_window, 15);
        assert_eq!(config.optimizer.mtu, 1420);
    }
}
