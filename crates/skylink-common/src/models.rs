//! Data models shared between the network and media subsystems.
//!
//! These types travel inside status snapshots, so everything here is
//! serde-serializable with snake_case wire names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Network mode ────────────────────────────────────────────────────

/// Which uplink currently carries the default route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    Wifi,
    Modem,
    #[default]
    Unknown,
}

impl NetworkMode {
    /// The mode a failover switches to when leaving `self`.
    pub fn alternate(&self) -> NetworkMode {
        match self {
            NetworkMode::Modem => NetworkMode::Wifi,
            _ => NetworkMode::Modem,
        }
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkMode::Wifi => write!(f, "wifi"),
            NetworkMode::Modem => write!(f, "modem"),
            NetworkMode::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wifi" => Ok(NetworkMode::Wifi),
            "modem" => Ok(NetworkMode::Modem),
            "unknown" => Ok(NetworkMode::Unknown),
            other => Err(format!("unknown network mode: {other}")),
        }
    }
}

// ── Modem records ───────────────────────────────────────────────────

/// Raw RF metrics reported by a modem-control collaborator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct SignalMetrics {
    /// Reference Signal Received Power in dBm. Range: -140 to -44.
    pub rsrp_dbm: f64,
    /// Reference Signal Received Quality in dB. Range: -20 to -3.
    pub rsrq_db: f64,
    /// Signal-to-Interference-plus-Noise Ratio in dB. Range: -20 to 30.
    pub sinr_db: f64,
}

/// One cellular modem tracked by the pool.
///
/// Invariants (enforced by the pool, asserted in its tests):
/// at most one record has `is_active = true`, and `is_active ⇒ is_connected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemRecord {
    pub interface: String,
    pub ip_address: Option<String>,
    pub gateway: Option<String>,
    pub is_connected: bool,
    pub is_active: bool,
    pub is_healthy: bool,
    /// Composite quality score in [0, 100]. Higher = better.
    pub quality_score: f64,
    pub signal: Option<SignalMetrics>,
    pub latency: Option<LatencySummary>,
    pub last_update: DateTime<Utc>,
}

impl ModemRecord {
    pub fn new(interface: impl Into<String>) -> Self {
        ModemRecord {
            interface: interface.into(),
            ip_address: None,
            gateway: None,
            is_connected: false,
            is_active: false,
            is_healthy: false,
            quality_score: 0.0,
            signal: None,
            latency: None,
            last_update: Utc::now(),
        }
    }
}

// ── Latency ─────────────────────────────────────────────────────────

/// A single reachability probe result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySample {
    pub target: String,
    pub interface: Option<String>,
    pub rtt_ms: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

/// Rolling statistics derived from a probe ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LatencySummary {
    pub target: String,
    pub interface: Option<String>,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Standard deviation of RTT.
    pub jitter_ms: f64,
    pub variance_ms: f64,
    /// 95th-percentile RTT.
    pub p95_ms: f64,
    /// Packet loss in percent [0, 100].
    pub loss_pct: f64,
    pub sample_count: usize,
    pub last_update: Option<DateTime<Utc>>,
}

// ── Stream health ───────────────────────────────────────────────────

/// Discrete stream health classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamHealth {
    Good,
    Fair,
    Poor,
}

impl std::fmt::Display for StreamHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamHealth::Good => write!(f, "good"),
            StreamHealth::Fair => write!(f, "fair"),
            StreamHealth::Poor => write!(f, "poor"),
        }
    }
}

// ── Selection mode ──────────────────────────────────────────────────

/// How the pool chooses its active modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    Manual,
    #[default]
    BestScore,
    BestSinr,
    BestLatency,
    RoundRobin,
}

impl std::str::FromStr for SelectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(SelectionMode::Manual),
            "best_score" => Ok(SelectionMode::BestScore),
            "best_sinr" => Ok(SelectionMode::BestSinr),
            "best_latency" => Ok(SelectionMode::BestLatency),
            "round_robin" => Ok(SelectionMode::RoundRobin),
            other => Err(format!("unknown selection mode: {other}")),
        }
    }
}

// ── Status snapshots ────────────────────────────────────────────────

/// One entry in the pool's switch audit ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchAuditEntry {
    pub from: Option<String>,
    pub to: String,
    pub reason: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// Pool snapshot suitable for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub total_modems: usize,
    pub connected_modems: usize,
    pub healthy_modems: usize,
    pub active_modem: Option<String>,
    pub selection_mode: SelectionMode,
    pub modems: Vec<ModemRecord>,
}

/// Failover controller snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverStatus {
    pub active: bool,
    pub current_mode: NetworkMode,
    pub preferred_mode: NetworkMode,
    pub consecutive_bad_samples: u32,
    pub seconds_since_switch: Option<f64>,
    pub last_reason: Option<String>,
}

/// Optimizer snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerStatus {
    pub active: bool,
    pub interface: Option<String>,
    pub optimizations: Vec<String>,
    pub original_settings: std::collections::HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alternate_mode_flips() {
        assert_eq!(NetworkMode::Modem.alternate(), NetworkMode::Wifi);
        assert_eq!(NetworkMode::Wifi.alternate(), NetworkMode::Modem);
        // Unknown resolves toward the modem path
        assert_eq!(NetworkMode::Unknown.alternate(), NetworkMode::Modem);
    }

    #[test]
    fn selection_mode_round_trips() {
        for s in ["manual", "best_score", "best_sinr", "best_latency", "round_robin"] {
            let mode: SelectionMode = s.parse().unwrap();
            assert_eq!(serde_json::to_value(mode).unwrap(), s);
        }
    }

    #[test]
    fn selection_mode_rejects_unknown() {
        assert!("nonexistent_mode".parse::<SelectionMode>().is_err());
    }

    #[test]
    fn new_modem_record_is_inactive() {
        let m = ModemRecord::new("wwan0");
        assert!(!m.is_active);
        assert!(!m.is_connected);
        assert_eq!(m.quality_score, 0.0);
    }
}
