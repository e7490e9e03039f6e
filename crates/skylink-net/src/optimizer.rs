//! Network optimizer — the reversible "flight mode" bundle.
//!
//! Applies a set of host-level network settings tuned for low-latency video
//! over LTE: interface MTU and queue length, BBR congestion control with
//! large socket buffers, DSCP EF marking for video ports, CAKE AQM on both
//! directions (egress directly, ingress via an IFB mirror), and fwmark-based
//! policy routing that keeps the VPN control plane pinned to the modem even
//! while the main-table default route changes underneath it.
//!
//! Individual step failures are logged and skipped — the optimizer is
//! advisory, and a host without CAKE support must still come up with the
//! remaining knobs applied. All firewall/qdisc/rule mutations use the
//! delete-then-add idiom so leftovers from a crashed previous run are
//! tolerated.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::sync::Mutex;

use skylink_common::config::OptimizerConfig;
use skylink_common::models::OptimizerStatus;

use crate::command::{SystemCommand, TIMEOUT_APPLY, TIMEOUT_READ};
use crate::iface;

static SENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Sent (\d+) bytes (\d+) pkt").unwrap());
static DROPPED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"dropped (\d+)").unwrap());
static BACKLOG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"backlog (\d+)b").unwrap());

/// Result of an enable() call.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizeReport {
    pub success: bool,
    pub message: String,
    pub interface: Option<String>,
    pub optimizations: Vec<String>,
}

/// CAKE qdisc counters parsed from `tc -s`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CakeStats {
    pub available: bool,
    pub interface: Option<String>,
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub dropped: u64,
    pub backlog_bytes: u64,
}

struct OptimizerState {
    active: bool,
    interface: Option<String>,
    original_settings: HashMap<String, String>,
    optimizations: Vec<String>,
}

/// Idempotent installer/remover of the flight-mode bundle.
pub struct NetworkOptimizer {
    config: Mutex<OptimizerConfig>,
    state: Mutex<OptimizerState>,
    runner: Arc<dyn SystemCommand>,
}

impl NetworkOptimizer {
    pub fn new(config: OptimizerConfig, runner: Arc<dyn SystemCommand>) -> Arc<Self> {
        Arc::new(NetworkOptimizer {
            config: Mutex::new(config),
            state: Mutex::new(OptimizerState {
                active: false,
                interface: None,
                original_settings: HashMap::new(),
                optimizations: Vec::new(),
            }),
            runner,
        })
    }

    async fn run(&self, program: &str, args: &[&str]) -> bool {
        let out = self.runner.run(program, args, TIMEOUT_APPLY).await;
        if !out.ok() {
            tracing::debug!(program, ?args, stderr = %out.stderr, "optimizer step command failed");
        }
        out.ok()
    }

    async fn read(&self, program: &str, args: &[&str]) -> Option<String> {
        let out = self.runner.run(program, args, TIMEOUT_READ).await;
        if out.ok() && !out.stdout.is_empty() {
            Some(out.stdout.clone())
        } else {
            None
        }
    }

    // ─── Enable ─────────────────────────────────────────────────────

    /// Detect the egress interface, snapshot the settings about to change,
    /// apply each optimization step, and report what was applied.
    pub async fn enable(&self) -> OptimizeReport {
        {
            let state = self.state.lock().await;
            if state.active {
                return OptimizeReport {
                    success: true,
                    message: "flight mode already active".into(),
                    interface: state.interface.clone(),
                    optimizations: state.optimizations.clone(),
                };
            }
        }

        let config = self.config.lock().await.clone();

        let Some(interface) = iface::find_modem_interface(self.runner.as_ref(), &config.subnet_hint).await
        else {
            return OptimizeReport {
                success: false,
                message: format!("no modem interface detected ({}.x)", config.subnet_hint),
                interface: None,
                optimizations: Vec::new(),
            };
        };

        tracing::info!(interface = %interface, "enabling flight mode");

        let original_settings = self.snapshot(&interface).await;
        let mut applied = Vec::new();

        if self.set_mtu(&interface, config.mtu).await {
            applied.push(format!("MTU set to {}", config.mtu));
        }

        if config.enable_qos && self.configure_qos(&config, true).await {
            applied.push(format!("QoS DSCP marking on ports {:?}", config.video_ports));
        }

        if self.tune_tcp(&config).await {
            applied.push(format!(
                "TCP tuned ({}, {} byte buffers)",
                config.tcp_congestion, config.rmem_max
            ));
        }

        if config.disable_power_save && self.set_power_save(&interface, &config, true).await {
            applied.push("power saving disabled".into());
        }

        if config.enable_cake && self.configure_cake(&interface, &config, true).await {
            applied.push(format!(
                "CAKE enabled (up={}mbit, down={}mbit)",
                config.cake_bandwidth_up_mbit, config.cake_bandwidth_down_mbit
            ));
        }

        if config.enable_vpn_policy_routing
            && self.configure_vpn_routing(&interface, &config, true).await
        {
            applied.push("VPN policy routing enabled (tunnel isolation)".into());
        }

        let mut state = self.state.lock().await;
        state.active = true;
        state.interface = Some(interface.clone());
        state.original_settings = original_settings;
        state.optimizations = applied.clone();

        tracing::info!(interface = %interface, steps = applied.len(), "flight mode enabled");

        OptimizeReport {
            success: true,
            message: "flight mode enabled".into(),
            interface: Some(interface),
            optimizations: applied,
        }
    }

    /// Restore the snapshot in reverse order, best-effort per field, then
    /// clear state. Missing snapshot fields are skipped silently.
    pub async fn disable(&self) -> OptimizeReport {
        let (interface, original) = {
            let state = self.state.lock().await;
            if !state.active {
                return OptimizeReport {
                    success: true,
                    message: "flight mode not active".into(),
                    interface: None,
                    optimizations: Vec::new(),
                };
            }
            (state.interface.clone(), state.original_settings.clone())
        };

        let config = self.config.lock().await.clone();

        if let Some(ref iface_name) = interface {
            if config.enable_vpn_policy_routing {
                self.configure_vpn_routing(iface_name, &config, false).await;
            }
            if config.enable_cake {
                self.configure_cake(iface_name, &config, false).await;
            }
            if config.disable_power_save {
                self.set_power_save(iface_name, &config, false).await;
            }
        }

        self.restore_tcp(&original).await;

        if config.enable_qos {
            self.configure_qos(&config, false).await;
        }

        if let (Some(iface_name), Some(mtu)) = (
            interface.as_deref(),
            original.get("mtu").and_then(|v| v.parse::<u32>().ok()),
        ) {
            self.set_mtu(iface_name, mtu).await;
        }

        let mut state = self.state.lock().await;
        state.active = false;
        state.interface = None;
        state.original_settings.clear();
        state.optimizations.clear();

        tracing::info!("flight mode disabled, settings restored");

        OptimizeReport {
            success: true,
            message: "flight mode disabled, settings restored".into(),
            interface,
            optimizations: Vec::new(),
        }
    }

    // ─── Snapshot / restore ─────────────────────────────────────────

    async fn snapshot(&self, interface: &str) -> HashMap<String, String> {
        let mut settings = HashMap::new();

        let mtu = iface::mtu_for(self.runner.as_ref(), interface)
            .await
            .unwrap_or(1500);
        settings.insert("mtu".into(), mtu.to_string());

        settings.insert(
            "tcp_congestion".into(),
            self.read("sysctl", &["-n", "net.ipv4.tcp_congestion_control"])
                .await
                .unwrap_or_else(|| "cubic".into()),
        );
        settings.insert(
            "rmem_max".into(),
            self.read("sysctl", &["-n", "net.core.rmem_max"])
                .await
                .unwrap_or_else(|| "212992".into()),
        );
        settings.insert(
            "wmem_max".into(),
            self.read("sysctl", &["-n", "net.core.wmem_max"])
                .await
                .unwrap_or_else(|| "212992".into()),
        );

        tracing::info!(?settings, "saved original settings");
        settings
    }

    async fn restore_tcp(&self, original: &HashMap<String, String>) {
        if let Some(cc) = original.get("tcp_congestion") {
            let arg = format!("net.ipv4.tcp_congestion_control={cc}");
            self.run("sysctl", &["-w", &arg]).await;
        }
        if let Some(v) = original.get("rmem_max") {
            let arg = format!("net.core.rmem_max={v}");
            self.run("sysctl", &["-w", &arg]).await;
        }
        if let Some(v) = original.get("wmem_max") {
            let arg = format!("net.core.wmem_max={v}");
            self.run("sysctl", &["-w", &arg]).await;
        }
    }

    // ─── Steps ──────────────────────────────────────────────────────

    async fn set_mtu(&self, interface: &str, mtu: u32) -> bool {
        let mtu_s = mtu.to_string();
        let ok = self
            .run("ip", &["link", "set", interface, "mtu", &mtu_s])
            .await;
        if ok {
            tracing::info!(interface, mtu, "MTU applied");
        }
        ok
    }

    async fn configure_qos(&self, config: &OptimizerConfig, enable: bool) -> bool {
        let action = if enable { "-A" } else { "-D" };
        let dscp = config.dscp.to_string();

        for port in &config.video_ports {
            let port_s = port.to_string();
            if enable {
                // Idempotent: drop any stale copy of the rule first.
                self.run(
                    "iptables",
                    &["-t", "mangle", "-D", "OUTPUT", "-p", "udp", "--dport", &port_s, "-j", "DSCP", "--set-dscp", &dscp],
                )
                .await;
                self.run(
                    "iptables",
                    &["-t", "mangle", "-D", "INPUT", "-p", "udp", "--sport", &port_s, "-j", "DSCP", "--set-dscp", &dscp],
                )
                .await;
            }
            self.run(
                "iptables",
                &["-t", "mangle", action, "OUTPUT", "-p", "udp", "--dport", &port_s, "-j", "DSCP", "--set-dscp", &dscp],
            )
            .await;
            self.run(
                "iptables",
                &["-t", "mangle", action, "INPUT", "-p", "udp", "--sport", &port_s, "-j", "DSCP", "--set-dscp", &dscp],
            )
            .await;
        }

        true
    }

    async fn tune_tcp(&self, config: &OptimizerConfig) -> bool {
        let cc = format!("net.ipv4.tcp_congestion_control={}", config.tcp_congestion);
        let rmem = format!("net.core.rmem_max={}", config.rmem_max);
        let wmem = format!("net.core.wmem_max={}", config.wmem_max);
        let rto = format!("net.ipv4.tcp_rto_min={}", config.rto_min_ms);

        let mut ok = self.run("sysctl", &["-w", &cc]).await;
        ok &= self.run("sysctl", &["-w", &rmem]).await;
        ok &= self.run("sysctl", &["-w", &wmem]).await;
        self.run("sysctl", &["-w", "net.ipv4.tcp_window_scaling=1"]).await;
        self.run("sysctl", &["-w", "net.ipv4.tcp_timestamps=1"]).await;
        self.run("sysctl", &["-w", &rto]).await;
        ok
    }

    async fn set_power_save(&self, interface: &str, config: &OptimizerConfig, enable: bool) -> bool {
        if enable {
            // Wake-on-LAN off where supported; failure is fine.
            self.run("ethtool", &["-s", interface, "wol", "d"]).await;
            let qlen = config.tx_queue_len.to_string();
            self.run("ip", &["link", "set", interface, "txqueuelen", &qlen])
                .await
        } else {
            self.run("ip", &["link", "set", interface, "txqueuelen", "1000"])
                .await
        }
    }

    async fn configure_cake(
        &self,
        interface: &str,
        config: &OptimizerConfig,
        enable: bool,
    ) -> bool {
        if !enable {
            self.run("tc", &["qdisc", "del", "dev", interface, "root"]).await;
            self.run("tc", &["qdisc", "del", "dev", interface, "ingress"]).await;
            self.run("tc", &["qdisc", "del", "dev", "ifb0", "root"]).await;
            return true;
        }

        // Egress: the uplink is where bufferbloat kills an FPV stream.
        self.run("tc", &["qdisc", "del", "dev", interface, "root"]).await;
        let up = format!("{}mbit", config.cake_bandwidth_up_mbit);
        let ok = self
            .run(
                "tc",
                &["qdisc", "replace", "dev", interface, "root", "cake", "bandwidth", &up, "besteffort", "wash", "nat", "ack-filter"],
            )
            .await;
        if !ok {
            tracing::warn!(interface, "CAKE egress setup failed (no sch_cake?)");
            return false;
        }

        // Ingress: mirror into a single IFB and shape there.
        self.run("modprobe", &["ifb", "numifbs=1"]).await;
        self.run("ip", &["link", "set", "ifb0", "up"]).await;
        self.run("tc", &["qdisc", "del", "dev", interface, "ingress"]).await;
        self.run("tc", &["qdisc", "add", "dev", interface, "ingress"]).await;
        self.run(
            "tc",
            &["filter", "add", "dev", interface, "parent", "ffff:", "protocol", "ip", "u32", "match", "u32", "0", "0", "action", "mirred", "egress", "redirect", "dev", "ifb0"],
        )
        .await;

        self.run("tc", &["qdisc", "del", "dev", "ifb0", "root"]).await;
        let down = format!("{}mbit", config.cake_bandwidth_down_mbit);
        self.run(
            "tc",
            &["qdisc", "replace", "dev", "ifb0", "root", "cake", "bandwidth", &down, "besteffort", "wash", "ingress"],
        )
        .await;

        tracing::info!(
            interface,
            up = config.cake_bandwidth_up_mbit,
            down = config.cake_bandwidth_down_mbit,
            "CAKE enabled"
        );
        true
    }

    /// fwmark-steered routing that keeps VPN control traffic pinned to the
    /// modem gateway. After this, changing the main-table default route
    /// cannot sever the tunnel: VPN packets match the fwmark rule and look
    /// up the dedicated table instead of the main table.
    async fn configure_vpn_routing(
        &self,
        interface: &str,
        config: &OptimizerConfig,
        enable: bool,
    ) -> bool {
        let mark = format!("{:#x}", config.vpn_fwmark);
        let table = config.vpn_table.to_string();

        if !enable {
            self.run("ip", &["rule", "del", "fwmark", &mark, "table", &table]).await;
            self.run("ip", &["route", "flush", "table", &table]).await;
            for port in ["41641", "51820"] {
                self.run(
                    "iptables",
                    &["-t", "mangle", "-D", "OUTPUT", "-p", "udp", "--dport", port, "-j", "MARK", "--set-mark", &mark],
                )
                .await;
            }
            return true;
        }

        let Some(gateway) = iface::gateway_for(self.runner.as_ref(), interface).await else {
            tracing::warn!(interface, "no gateway found for VPN policy routing");
            return false;
        };

        self.run("ip", &["rule", "del", "fwmark", &mark, "table", &table]).await;
        self.run("ip", &["rule", "add", "fwmark", &mark, "table", &table]).await;

        self.run("ip", &["route", "del", "default", "table", &table]).await;
        self.run(
            "ip",
            &["route", "add", "default", "via", &gateway, "dev", interface, "table", &table],
        )
        .await;

        // Stamp the fwmark onto known VPN control ports
        // (Tailscale 41641, WireGuard 51820).
        for port in ["41641", "51820"] {
            self.run(
                "iptables",
                &["-t", "mangle", "-D", "OUTPUT", "-p", "udp", "--dport", port, "-j", "MARK", "--set-mark", &mark],
            )
            .await;
            self.run(
                "iptables",
                &["-t", "mangle", "-A", "OUTPUT", "-p", "udp", "--dport", port, "-j", "MARK", "--set-mark", &mark],
            )
            .await;
        }

        tracing::info!(fwmark = %mark, table = %table, gateway = %gateway, "VPN policy routing enabled");
        true
    }

    // ─── Introspection ──────────────────────────────────────────────

    pub async fn get_status(&self) -> OptimizerStatus {
        let state = self.state.lock().await;
        OptimizerStatus {
            active: state.active,
            interface: state.interface.clone(),
            optimizations: state.optimizations.clone(),
            original_settings: if state.active {
                state.original_settings.clone()
            } else {
                HashMap::new()
            },
        }
    }

    /// Current kernel-visible values of the tunables this bundle touches.
    pub async fn network_metrics(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        if let Some(v) = self.read("sysctl", &["-n", "net.ipv4.tcp_congestion_control"]).await {
            metrics.insert("tcp_congestion".into(), v);
        }
        if let Some(v) = self.read("sysctl", &["-n", "net.core.rmem_max"]).await {
            metrics.insert("rmem_max".into(), v);
        }
        if let Some(v) = self.read("sysctl", &["-n", "net.core.wmem_max"]).await {
            metrics.insert("wmem_max".into(), v);
        }
        let subnet_hint = self.config.lock().await.subnet_hint.clone();
        if let Some(iface_name) = iface::find_modem_interface(self.runner.as_ref(), &subnet_hint).await {
            if let Some(mtu) = iface::mtu_for(self.runner.as_ref(), &iface_name).await {
                metrics.insert("mtu".into(), mtu.to_string());
            }
        }
        metrics
    }

    /// Parse CAKE counters for the active egress qdisc.
    pub async fn cake_stats(&self) -> CakeStats {
        let interface = {
            let state = self.state.lock().await;
            state.interface.clone()
        };
        let Some(interface) = interface else {
            return CakeStats::default();
        };

        let Some(out) = self
            .read("tc", &["-s", "qdisc", "show", "dev", &interface, "root"])
            .await
        else {
            return CakeStats::default();
        };

        if !out.to_lowercase().contains("cake") {
            return CakeStats::default();
        }

        let mut stats = CakeStats {
            available: true,
            interface: Some(interface),
            ..Default::default()
        };
        if let Some(c) = SENT_RE.captures(&out) {
            stats.bytes_sent = c[1].parse().unwrap_or(0);
            stats.packets_sent = c[2].parse().unwrap_or(0);
        }
        if let Some(c) = DROPPED_RE.captures(&out) {
            stats.dropped = c[1].parse().unwrap_or(0);
        }
        if let Some(c) = BACKLOG_RE.captures(&out) {
            stats.backlog_bytes = c[1].parse().unwrap_or(0);
        }
        stats
    }

    pub async fn update_config(&self, config: OptimizerConfig) {
        *self.config.lock().await = config;
    }
}
