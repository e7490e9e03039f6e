//! VPN collaborator contracts.
//!
//! The core consumes two small interfaces: a control surface
//! ([`VpnProvider`], CLI-wrapped) and a health probe ([`VpnHealthProbe`])
//! that the modem pool uses to gate path switches. Vendor quirks stay
//! behind these traits.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::command::{BoxFuture, SystemCommand, TIMEOUT_APPLY, TIMEOUT_READ};
use crate::iface;
use crate::probe::parse_rtt_ms;

/// Connection status reported by a VPN provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VpnStatus {
    pub connected: bool,
    pub authenticated: bool,
    pub ip_address: Option<String>,
    pub interface: Option<String>,
    pub peers_count: usize,
    pub needs_auth: bool,
    pub auth_url: Option<String>,
}

/// One peer visible through the tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnPeer {
    pub hostname: String,
    pub ip: String,
    pub online: bool,
}

/// Control surface of one VPN implementation.
pub trait VpnProvider: Send + Sync {
    fn get_status<'a>(&'a self) -> BoxFuture<'a, VpnStatus>;
    fn get_peers<'a>(&'a self) -> BoxFuture<'a, Vec<VpnPeer>>;
    fn connect<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<()>>;
    fn disconnect<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<()>>;
    fn logout<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Result of one VPN health check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VpnHealth {
    pub healthy: bool,
    pub rtt_ms: Option<f64>,
    pub interface_up: bool,
    pub peer_ip: Option<String>,
}

/// Health probe consumed by the modem pool around path switches.
pub trait VpnHealthProbe: Send + Sync {
    fn check_vpn_health<'a>(&'a self) -> BoxFuture<'a, VpnHealth>;

    /// Poll health every 2 s until healthy or the deadline passes.
    fn wait_for_vpn_recovery<'a>(&'a self, timeout: Duration) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            loop {
                if self.check_vpn_health().await.healthy {
                    return true;
                }
                if Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        })
    }
}

// ── Tailscale ───────────────────────────────────────────────────────

/// Tailscale CLI wrapper.
pub struct TailscaleVpn {
    runner: Arc<dyn SystemCommand>,
}

impl TailscaleVpn {
    pub fn new(runner: Arc<dyn SystemCommand>) -> Self {
        TailscaleVpn { runner }
    }

    async fn status_json(&self) -> Option<serde_json::Value> {
        let out = self
            .runner
            .run("tailscale", &["status", "--json"], TIMEOUT_READ)
            .await;
        if !out.ok() {
            return None;
        }
        serde_json::from_str(&out.stdout).ok()
    }
}

impl VpnProvider for TailscaleVpn {
    fn get_status<'a>(&'a self) -> BoxFuture<'a, VpnStatus> {
        Box::pin(async move {
            let Some(json) = self.status_json().await else {
                return VpnStatus::default();
            };

            let backend = json["BackendState"].as_str().unwrap_or("");
            let connected = backend == "Running";
            let needs_auth = backend == "NeedsLogin";
            let ip_address = json["Self"]["TailscaleIPs"]
                .as_array()
                .and_then(|ips| ips.first())
                .and_then(|ip| ip.as_str())
                .map(|s| s.to_string());
            let peers_count = json["Peer"].as_object().map_or(0, |p| p.len());

            VpnStatus {
                connected,
                authenticated: !needs_auth,
                ip_address,
                interface: Some("tailscale0".to_string()),
                peers_count,
                needs_auth,
                auth_url: json["AuthURL"].as_str().map(|s| s.to_string()),
            }
        })
    }

    fn get_peers<'a>(&'a self) -> BoxFuture<'a, Vec<VpnPeer>> {
        Box::pin(async move {
            let Some(json) = self.status_json().await else {
                return Vec::new();
            };
            let Some(peers) = json["Peer"].as_object() else {
                return Vec::new();
            };

            peers
                .values()
                .filter_map(|peer| {
                    let ip = peer["TailscaleIPs"]
                        .as_array()
                        .and_then(|ips| ips.first())
                        .and_then(|ip| ip.as_str())?;
                    Some(VpnPeer {
                        hostname: peer["HostName"].as_str().unwrap_or("").to_string(),
                        ip: ip.to_string(),
                        online: peer["Online"].as_bool().unwrap_or(false),
                    })
                })
                .collect()
        })
    }

    fn connect<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let out = self.runner.run("tailscale", &["up"], TIMEOUT_APPLY).await;
            if out.ok() {
                Ok(())
            } else {
                anyhow::bail!("tailscale up failed: {}", out.stderr)
            }
        })
    }

    fn disconnect<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let out = self.runner.run("tailscale", &["down"], TIMEOUT_APPLY).await;
            if out.ok() {
                Ok(())
            } else {
                anyhow::bail!("tailscale down failed: {}", out.stderr)
            }
        })
    }

    fn logout<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let out = self.runner.run("tailscale", &["logout"], TIMEOUT_APPLY).await;
            if out.ok() {
                Ok(())
            } else {
                anyhow::bail!("tailscale logout failed: {}", out.stderr)
            }
        })
    }
}

// ── CLI health checker ──────────────────────────────────────────────

/// Health probe built on a [`VpnProvider`]: the tunnel is healthy when its
/// interface is up and the first online peer answers a ping through it.
pub struct CliVpnHealthChecker {
    runner: Arc<dyn SystemCommand>,
    vpn: Arc<dyn VpnProvider>,
}

impl CliVpnHealthChecker {
    pub fn new(runner: Arc<dyn SystemCommand>, vpn: Arc<dyn VpnProvider>) -> Self {
        CliVpnHealthChecker { runner, vpn }
    }
}

impl VpnHealthProbe for CliVpnHealthChecker {
    fn check_vpn_health<'a>(&'a self) -> BoxFuture<'a, VpnHealth> {
        Box::pin(async move {
            let status = self.vpn.get_status().await;
            let Some(vpn_iface) = status.interface.clone() else {
                return VpnHealth::default();
            };

            let interface_up = iface::resolve_iface_ipv4(&vpn_iface).is_some()
                || iface::operstate(&vpn_iface).map_or(false, |s| s != "down");

            if !status.connected || !interface_up {
                return VpnHealth {
                    healthy: false,
                    rtt_ms: None,
                    interface_up,
                    peer_ip: None,
                };
            }

            let peers = self.vpn.get_peers().await;
            let Some(peer) = peers.iter().find(|p| p.online) else {
                // Tunnel up but nobody to talk to — treat as healthy:
                // reachability of an absent GCS is not the tunnel's fault.
                return VpnHealth {
                    healthy: true,
                    rtt_ms: None,
                    interface_up,
                    peer_ip: None,
                };
            };

            let out = self
                .runner
                .run(
                    "ping",
                    &["-c", "1", "-W", "2", "-I", &vpn_iface, &peer.ip],
                    Duration::from_secs(3),
                )
                .await;
            let rtt_ms = if out.ok() { parse_rtt_ms(&out.stdout) } else { None };

            VpnHealth {
                healthy: rtt_ms.is_some(),
                rtt_ms,
                interface_up,
                peer_ip: Some(peer.ip.clone()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockRunner;

    const STATUS_RUNNING: &str = r#"{
        "BackendState": "Running",
        "Self": {"TailscaleIPs": ["100.64.0.2"], "HostName": "skylink"},
        "Peer": {
            "key1": {"HostName": "gcs", "TailscaleIPs": ["100.64.0.1"], "Online": true},
            "key2": {"HostName": "laptop", "TailscaleIPs": ["100.64.0.3"], "Online": false}
        }
    }"#;

    #[tokio::test]
    async fn status_parses_running_state() {
        let runner = Arc::new(MockRunner::new());
        runner.stub("tailscale status --json", STATUS_RUNNING);

        let vpn = TailscaleVpn::new(runner);
        let status = vpn.get_status().await;
        assert!(status.connected);
        assert!(status.authenticated);
        assert_eq!(status.ip_address.as_deref(), Some("100.64.0.2"));
        assert_eq!(status.peers_count, 2);
    }

    #[tokio::test]
    async fn status_needs_login() {
        let runner = Arc::new(MockRunner::new());
        runner.stub(
            "tailscale status --json",
            r#"{"BackendState": "NeedsLogin", "AuthURL": "https://login.tailscale.com/a/x"}"#,
        );

        let vpn = TailscaleVpn::new(runner);
        let status = vpn.get_status().await;
        assert!(!status.connected);
        assert!(status.needs_auth);
        assert!(status.auth_url.is_some());
    }

    #[tokio::test]
    async fn peers_filter_keeps_addressable() {
        let runner = Arc::new(MockRunner::new());
        runner.stub("tailscale status --json", STATUS_RUNNING);

        let vpn = TailscaleVpn::new(runner);
        let peers = vpn.get_peers().await;
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().any(|p| p.hostname == "gcs" && p.online));
    }

    #[tokio::test]
    async fn cli_failure_yields_default_status() {
        let runner = Arc::new(MockRunner::new());
        runner.stub_failure("tailscale", "not found");

        let vpn = TailscaleVpn::new(runner);
        let status = vpn.get_status().await;
        assert!(!status.connected);
        assert_eq!(status.peers_count, 0);
    }

    // ─── Recovery polling ───────────────────────────────────────────────

    struct ScriptedProbe {
        healthy_after: std::sync::atomic::AtomicU32,
    }

    impl VpnHealthProbe for ScriptedProbe {
        fn check_vpn_health<'a>(&'a self) -> BoxFuture<'a, VpnHealth> {
            Box::pin(async move {
                let left = self
                    .healthy_after
                    .fetch_update(
                        std::sync::atomic::Ordering::SeqCst,
                        std::sync::atomic::Ordering::SeqCst,
                        |v| Some(v.saturating_sub(1)),
                    )
                    .unwrap();
                VpnHealth {
                    healthy: left == 0,
                    ..Default::default()
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_waits_until_healthy() {
        let probe = ScriptedProbe {
            healthy_after: std::sync::atomic::AtomicU32::new(3),
        };
        assert!(probe.wait_for_vpn_recovery(Duration::from_secs(30)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_times_out() {
        let probe = ScriptedProbe {
            healthy_after: std::sync::atomic::AtomicU32::new(u32::MAX),
        };
        assert!(!probe.wait_for_vpn_recovery(Duration::from_secs(5)).await);
    }
}
