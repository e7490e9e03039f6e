//! Interface discovery and `ip` output parsing.
//!
//! The parsers are pure functions over captured stdout so they can be tested
//! without a live system; the async wrappers at the bottom drive them
//! through a [`SystemCommand`] runner. Interface addresses are resolved via
//! `getifaddrs` where an exact answer matters.

use std::net::IpAddr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::command::{SystemCommand, TIMEOUT_READ};

static GATEWAY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"default via (\d+\.\d+\.\d+\.\d+)").unwrap());
static METRIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"metric (\d+)").unwrap());
static MTU_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"mtu (\d+)").unwrap());

/// One `iface → address` pair parsed from `ip -o addr show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceAddr {
    pub interface: String,
    pub ip: String,
}

/// Parse `ip -o addr show` output into interface/IPv4 pairs.
///
/// One-line format: `3: wwan0    inet 192.168.8.100/24 brd ... scope global wwan0`.
pub fn parse_addr_show(output: &str) -> Vec<IfaceAddr> {
    let mut addrs = Vec::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let Some(_idx) = fields.next() else { continue };
        let Some(iface) = fields.next() else { continue };
        let rest: Vec<&str> = fields.collect();
        let Some(pos) = rest.iter().position(|f| *f == "inet") else {
            continue;
        };
        let Some(cidr) = rest.get(pos + 1) else { continue };
        let ip = cidr.split('/').next().unwrap_or(cidr);
        addrs.push(IfaceAddr {
            interface: iface.trim_end_matches(':').to_string(),
            ip: ip.to_string(),
        });
    }
    addrs
}

/// Interfaces whose address sits in the modem subnet, plus any `wwan*`
/// interface regardless of subnet.
pub fn modem_interfaces(addrs: &[IfaceAddr], subnet_hint: &str) -> Vec<IfaceAddr> {
    addrs
        .iter()
        .filter(|a| a.interface != "lo")
        .filter(|a| a.ip.starts_with(subnet_hint) || a.interface.starts_with("wwan"))
        .cloned()
        .collect()
}

/// Extract the default gateway from `ip route show dev X` output.
pub fn parse_gateway(output: &str) -> Option<String> {
    GATEWAY_RE
        .captures(output)
        .map(|c| c.get(1).unwrap().as_str().to_string())
}

/// Extract the default-route metric from `ip route show dev X` output.
pub fn parse_metric(output: &str) -> Option<u32> {
    for line in output.lines() {
        if line.contains("default") {
            if let Some(c) = METRIC_RE.captures(line) {
                return c.get(1).unwrap().as_str().parse().ok();
            }
        }
    }
    None
}

/// Extract the MTU from `ip link show X` output.
pub fn parse_mtu(output: &str) -> Option<u32> {
    MTU_RE
        .captures(output)
        .and_then(|c| c.get(1).unwrap().as_str().parse().ok())
}

/// Read an interface's operational state from sysfs.
pub fn operstate(iface: &str) -> Option<String> {
    std::fs::read_to_string(format!("/sys/class/net/{iface}/operstate"))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Resolve a network interface name to its first IPv4 address via
/// `getifaddrs`. Returns `None` if the interface doesn't exist or has no
/// IPv4 address.
pub fn resolve_iface_ipv4(iface: &str) -> Option<IpAddr> {
    if !std::path::Path::new(&format!("/sys/class/net/{iface}/")).exists() {
        return None;
    }

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return None;
        }

        let mut current = ifaddrs;
        let mut result = None;

        while !current.is_null() {
            let ifa = &*current;
            if !ifa.ifa_addr.is_null() {
                let name = std::ffi::CStr::from_ptr(ifa.ifa_name).to_string_lossy();
                if name == iface && (*ifa.ifa_addr).sa_family == libc::AF_INET as u16 {
                    let addr = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                    result = Some(IpAddr::V4(std::net::Ipv4Addr::from(u32::from_be(
                        addr.sin_addr.s_addr,
                    ))));
                    break;
                }
            }
            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
        result
    }
}

// ── Runner-backed lookups ───────────────────────────────────────────

/// List all interface/IPv4 pairs on the host.
pub async fn list_addresses(runner: &dyn SystemCommand) -> Vec<IfaceAddr> {
    let out = runner
        .run("ip", &["-o", "addr", "show"], TIMEOUT_READ)
        .await;
    if !out.ok() {
        return Vec::new();
    }
    parse_addr_show(&out.stdout)
}

/// First interface carrying an address in the modem subnet.
pub async fn find_modem_interface(
    runner: &dyn SystemCommand,
    subnet_hint: &str,
) -> Option<String> {
    let addrs = list_addresses(runner).await;
    addrs
        .iter()
        .find(|a| a.ip.starts_with(subnet_hint))
        .map(|a| a.interface.clone())
}

/// Default gateway reachable through `iface`.
pub async fn gateway_for(runner: &dyn SystemCommand, iface: &str) -> Option<String> {
    let out = runner
        .run("ip", &["route", "show", "dev", iface], TIMEOUT_READ)
        .await;
    if !out.ok() {
        return None;
    }
    parse_gateway(&out.stdout)
}

/// Current MTU of `iface`.
pub async fn mtu_for(runner: &dyn SystemCommand, iface: &str) -> Option<u32> {
    let out = runner
        .run("ip", &["link", "show", iface], TIMEOUT_READ)
        .await;
    if !out.ok() {
        return None;
    }
    parse_mtu(&out.stdout)
}

/// Which OS interface routes to `host`, per `ip route get`.
pub async fn interface_for_host(runner: &dyn SystemCommand, host: &str) -> Option<String> {
    let out = runner
        .run("ip", &["route", "get", host], TIMEOUT_READ)
        .await;
    if !out.ok() {
        return None;
    }
    // Parse: "172.30.0.20 dev eth2 src 172.30.0.10 ..."
    let fields: Vec<&str> = out.stdout.split_whitespace().collect();
    fields
        .windows(2)
        .find(|w| w[0] == "dev")
        .map(|w| w[1].to_string())
}

/// Bring an interface up or down.
pub async fn set_link_state(runner: &dyn SystemCommand, iface: &str, up: bool) -> bool {
    let action = if up { "up" } else { "down" };
    runner
        .run("ip", &["link", "set", iface, action], Duration::from_secs(5))
        .await
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR_SHOW: &str = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
3: wlan0    inet 192.168.1.23/24 brd 192.168.1.255 scope global dynamic wlan0\\       valid_lft 85000sec
4: eth1    inet 192.168.8.100/24 brd 192.168.8.255 scope global dynamic eth1\\       valid_lft 85000sec
5: wwan0    inet 10.64.12.7/30 brd 10.64.12.7 scope global wwan0\\       valid_lft forever";

    // ─── addr show parsing ──────────────────────────────────────────────

    #[test]
    fn parses_all_inet_lines() {
        let addrs = parse_addr_show(ADDR_SHOW);
        assert_eq!(addrs.len(), 4);
        assert_eq!(addrs[1].interface, "wlan0");
        assert_eq!(addrs[1].ip, "192.168.1.23");
    }

    #[test]
    fn modem_interfaces_by_subnet_and_name() {
        let addrs = parse_addr_show(ADDR_SHOW);
        let modems = modem_interfaces(&addrs, "192.168.8");
        let names: Vec<&str> = modems.iter().map(|m| m.interface.as_str()).collect();
        assert_eq!(names, vec!["eth1", "wwan0"]);
    }

    #[test]
    fn ignores_lines_without_inet() {
        let addrs = parse_addr_show("2: eth0    link/ether aa:bb:cc:dd:ee:ff");
        assert!(addrs.is_empty());
    }

    // ─── route parsing ──────────────────────────────────────────────────

    #[test]
    fn parses_gateway() {
        let out = "default via 192.168.8.1 proto dhcp metric 700\n192.168.8.0/24 proto kernel scope link";
        assert_eq!(parse_gateway(out).as_deref(), Some("192.168.8.1"));
    }

    #[test]
    fn no_gateway_when_no_default() {
        assert_eq!(parse_gateway("192.168.8.0/24 proto kernel scope link"), None);
    }

    #[test]
    fn parses_metric_from_default_line_only() {
        let out = "default via 192.168.8.1 metric 700\n10.0.0.0/8 via 10.1.1.1 metric 50";
        assert_eq!(parse_metric(out), Some(700));
    }

    #[test]
    fn parses_mtu() {
        let out = "4: eth1: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP";
        assert_eq!(parse_mtu(out), Some(1500));
    }

    // ─── runner-backed lookups ──────────────────────────────────────────

    #[tokio::test]
    async fn find_modem_interface_prefers_subnet_match() {
        let runner = crate::MockRunner::new();
        runner.stub("ip -o addr show", ADDR_SHOW);
        let iface = find_modem_interface(&runner, "192.168.8").await;
        assert_eq!(iface.as_deref(), Some("eth1"));
    }

    #[tokio::test]
    async fn interface_for_host_parses_dev() {
        let runner = crate::MockRunner::new();
        runner.stub(
            "ip route get 8.8.8.8",
            "8.8.8.8 via 192.168.8.1 dev eth1 src 192.168.8.100 uid 0",
        );
        assert_eq!(
            interface_for_host(&runner, "8.8.8.8").await.as_deref(),
            Some("eth1")
        );
    }
}
