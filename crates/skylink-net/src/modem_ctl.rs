//! Modem-control collaborator contract.
//!
//! Vendor integrations (HiLink HTTP, ModemManager DBus, plain router
//! gateways) live outside the core; the pool only consumes this capability
//! surface. A provider advertises what it supports and may be asked for
//! per-interface signal metrics.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use skylink_common::models::SignalMetrics;

use crate::command::BoxFuture;

/// Capability subset a modem-control provider supports.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModemCapabilities {
    pub band_selection: bool,
    pub apn_configuration: bool,
    pub remote_reboot: bool,
    pub dns_configuration: bool,
}

/// Control surface of one modem vendor integration.
pub trait ModemControl: Send + Sync {
    fn capabilities(&self) -> ModemCapabilities;

    /// RF metrics for the modem behind `interface`, where the vendor
    /// exposes them. `None` when unsupported or unreachable.
    fn signal_metrics<'a>(&'a self, interface: &'a str) -> BoxFuture<'a, Option<SignalMetrics>>;

    /// Reboot the modem. Providers without remote reboot return an error.
    fn reboot<'a>(&'a self, _interface: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { anyhow::bail!("reboot not supported by this provider") })
    }
}

/// Connectivity-only provider: an opaque router gateway with no management
/// API. Advertises nothing and reports no signal, which leaves the pool
/// scoring on probe metrics alone.
#[derive(Debug, Default)]
pub struct RouterGateway;

impl ModemControl for RouterGateway {
    fn capabilities(&self) -> ModemCapabilities {
        ModemCapabilities::default()
    }

    fn signal_metrics<'a>(&'a self, _interface: &'a str) -> BoxFuture<'a, Option<SignalMetrics>> {
        Box::pin(async { None })
    }
}

/// Fixed-response provider for tests and `--simulate` mode.
pub struct StaticSignal {
    metrics: SignalMetrics,
}

impl StaticSignal {
    pub fn new(metrics: SignalMetrics) -> Arc<Self> {
        Arc::new(StaticSignal { metrics })
    }
}

impl ModemControl for StaticSignal {
    fn capabilities(&self) -> ModemCapabilities {
        ModemCapabilities {
            band_selection: false,
            apn_configuration: false,
            remote_reboot: false,
            dns_configuration: false,
        }
    }

    fn signal_metrics<'a>(&'a self, _interface: &'a str) -> BoxFuture<'a, Option<SignalMetrics>> {
        let metrics = self.metrics;
        Box::pin(async move { Some(metrics) })
    }
}
