//! Configuration records for every subsystem.
//!
//! Each record carries documented defaults and an `apply_update` that merges
//! an Option-per-field patch, validating or clamping as it goes — absent
//! fields are left untouched. Numeric ranges are enforced at construction
//! time as well, so a record read from disk is always in range.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{NetworkMode, SelectionMode};

// ── Sink mode ───────────────────────────────────────────────────────

/// Where the encoded stream goes.
///
/// Unknown mode strings fold to `Udp` rather than failing, so a stale or
/// hand-edited config file cannot leave the device unable to stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SinkMode {
    #[default]
    Udp,
    Multicast,
    Rtsp,
    Webrtc,
}

impl SinkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkMode::Udp => "udp",
            SinkMode::Multicast => "multicast",
            SinkMode::Rtsp => "rtsp",
            SinkMode::Webrtc => "webrtc",
        }
    }
}

impl From<String> for SinkMode {
    fn from(s: String) -> Self {
        match s.as_str() {
            "multicast" => SinkMode::Multicast,
            "rtsp" => SinkMode::Rtsp,
            "webrtc" => SinkMode::Webrtc,
            _ => SinkMode::Udp,
        }
    }
}

impl From<SinkMode> for String {
    fn from(m: SinkMode) -> String {
        m.as_str().to_string()
    }
}

impl std::fmt::Display for SinkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Video ───────────────────────────────────────────────────────────

/// Declared ranges for the numeric video fields.
pub const WIDTH_RANGE: (u32, u32) = (160, 3840);
pub const HEIGHT_RANGE: (u32, u32) = (120, 2160);
pub const FRAMERATE_RANGE: (u32, u32) = (1, 120);
pub const QUALITY_RANGE: (u32, u32) = (1, 100);
pub const BITRATE_RANGE: (u32, u32) = (100, 50_000);
pub const GOP_RANGE: (u32, u32) = (1, 300);

/// Capture and encoding configuration for one stream attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// V4L2 device path, or empty for auto-detection.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Requested codec id (subject to board adaptation).
    pub codec: String,
    /// JPEG quality for MJPEG-class encoders (1–100).
    pub quality: u32,
    /// Target bitrate in kbps for H.264/H.265-class encoders.
    pub bitrate_kbps: u32,
    /// Keyframe interval in frames. Short GOPs recover faster after loss.
    pub gop_size: u32,
    /// Pipeline latency budget in milliseconds.
    pub max_latency_ms: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        VideoConfig {
            device: String::new(),
            width: 1280,
            height: 720,
            framerate: 30,
            codec: "h264_hardware".into(),
            quality: 85,
            bitrate_kbps: 3000,
            gop_size: 30,
            max_latency_ms: 50,
        }
    }
}

fn clamp(value: u32, range: (u32, u32)) -> u32 {
    value.clamp(range.0, range.1)
}

impl VideoConfig {
    /// Clamp every numeric field into its declared range.
    pub fn sanitized(mut self) -> Self {
        self.width = clamp(self.width, WIDTH_RANGE);
        self.height = clamp(self.height, HEIGHT_RANGE);
        self.framerate = clamp(self.framerate, FRAMERATE_RANGE);
        self.quality = clamp(self.quality, QUALITY_RANGE);
        self.bitrate_kbps = clamp(self.bitrate_kbps, BITRATE_RANGE);
        self.gop_size = clamp(self.gop_size, GOP_RANGE);
        self
    }

    pub fn apply_update(&mut self, patch: VideoConfigPatch) {
        if let Some(device) = patch.device {
            self.device = device;
        }
        if let Some(v) = patch.width {
            self.width = clamp(v, WIDTH_RANGE);
        }
        if let Some(v) = patch.height {
            self.height = clamp(v, HEIGHT_RANGE);
        }
        if let Some(v) = patch.framerate {
            self.framerate = clamp(v, FRAMERATE_RANGE);
        }
        if let Some(codec) = patch.codec {
            self.codec = codec;
        }
        if let Some(v) = patch.quality {
            self.quality = clamp(v, QUALITY_RANGE);
        }
        if let Some(v) = patch.bitrate_kbps {
            self.bitrate_kbps = clamp(v, BITRATE_RANGE);
        }
        if let Some(v) = patch.gop_size {
            self.gop_size = clamp(v, GOP_RANGE);
        }
    }
}

/// Partial update for [`VideoConfig`] — only provided fields are applied.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoConfigPatch {
    pub device: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<u32>,
    pub codec: Option<String>,
    pub quality: Option<u32>,
    pub bitrate_kbps: Option<u32>,
    pub gop_size: Option<u32>,
}

// ── Streaming ───────────────────────────────────────────────────────

/// Network egress configuration for the pipeline sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub mode: SinkMode,
    pub udp_host: String,
    pub udp_port: u16,
    pub multicast_group: String,
    pub multicast_port: u16,
    pub multicast_ttl: u32,
    pub rtsp_port: u16,
    pub rtsp_mount: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        StreamingConfig {
            mode: SinkMode::Udp,
            udp_host: "192.168.1.100".into(),
            udp_port: 5600,
            multicast_group: "239.255.12.42".into(),
            multicast_port: 5600,
            multicast_ttl: 1,
            rtsp_port: 8554,
            rtsp_mount: "/fpv".into(),
        }
    }
}

// ── Latency probing ─────────────────────────────────────────────────

/// Probe engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Targets pinged each tick. Defaults to three public resolvers.
    pub targets: Vec<String>,
    /// Seconds between probe rounds.
    pub interval_s: f64,
    /// Samples kept per target.
    pub history_size: usize,
    /// Per-probe hard timeout in seconds.
    pub timeout_s: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            targets: vec!["8.8.8.8".into(), "1.1.1.1".into(), "9.9.9.9".into()],
            interval_s: 2.0,
            history_size: 30,
            timeout_s: 2.0,
        }
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_s.max(0.1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s.max(0.1))
    }
}

// ── Failover ────────────────────────────────────────────────────────

/// Auto-failover tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Average RTT above this counts as a bad sample.
    pub latency_threshold_ms: f64,
    /// Consecutive bad samples required before switching.
    pub latency_check_window: u32,
    /// Minimum seconds between switches.
    pub switch_cooldown_s: f64,
    /// Seconds to wait before restoring the preferred mode.
    pub restore_delay_s: f64,
    pub preferred_mode: NetworkMode,
    /// Seconds between state-machine ticks.
    pub check_interval_s: f64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        FailoverConfig {
            latency_threshold_ms: 200.0,
            latency_check_window: 15,
            switch_cooldown_s: 30.0,
            restore_delay_s: 60.0,
            preferred_mode: NetworkMode::Modem,
            check_interval_s: 2.0,
        }
    }
}

impl FailoverConfig {
    /// Restoration only happens below this fraction of the threshold —
    /// the 30% margin keeps the state machine from oscillating at the line.
    pub fn restore_threshold_ms(&self) -> f64 {
        self.latency_threshold_ms * 0.7
    }

    pub fn apply_update(&mut self, patch: FailoverConfigPatch) {
        if let Some(v) = patch.latency_threshold_ms {
            if v > 0.0 {
                self.latency_threshold_ms = v;
            }
        }
        if let Some(v) = patch.latency_check_window {
            if v > 0 {
                self.latency_check_window = v;
            }
        }
        if let Some(v) = patch.switch_cooldown_s {
            if v >= 0.0 {
                self.switch_cooldown_s = v;
            }
        }
        if let Some(v) = patch.restore_delay_s {
            if v >= 0.0 {
                self.restore_delay_s = v;
            }
        }
        if let Some(v) = patch.preferred_mode {
            self.preferred_mode = v;
        }
        if let Some(v) = patch.check_interval_s {
            if v > 0.0 {
                self.check_interval_s = v;
            }
        }
    }
}

/// Partial update for [`FailoverConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FailoverConfigPatch {
    pub latency_threshold_ms: Option<f64>,
    pub latency_check_window: Option<u32>,
    pub switch_cooldown_s: Option<f64>,
    pub restore_delay_s: Option<f64>,
    pub preferred_mode: Option<NetworkMode>,
    pub check_interval_s: Option<f64>,
}

// ── Network optimizer ("flight mode") ───────────────────────────────

/// The reversible host-tuning bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Egress detection: the first interface carrying an address in this
    /// subnet is treated as the cellular uplink.
    pub subnet_hint: String,
    /// MTU for the cellular egress. 1420 leaves headroom under LTE's
    /// typical 1500-byte path once encapsulation is accounted for.
    pub mtu: u32,
    pub tx_queue_len: u32,
    pub disable_power_save: bool,

    pub tcp_congestion: String,
    /// Socket buffer ceilings in bytes (25 MiB).
    pub rmem_max: u64,
    pub wmem_max: u64,
    /// Minimum TCP retransmission timeout in milliseconds.
    pub rto_min_ms: u32,

    pub enable_qos: bool,
    /// UDP ports whose traffic gets stamped DSCP EF.
    pub video_ports: Vec<u16>,
    /// DSCP code point (EF = 46).
    pub dscp: u8,

    pub enable_cake: bool,
    pub cake_bandwidth_up_mbit: u32,
    pub cake_bandwidth_down_mbit: u32,

    pub enable_vpn_policy_routing: bool,
    pub vpn_fwmark: u32,
    pub vpn_table: u32,
    pub video_table: u32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            subnet_hint: "192.168.8".into(),
            mtu: 1420,
            tx_queue_len: 10_000,
            disable_power_save: true,
            tcp_congestion: "bbr".into(),
            rmem_max: 26_214_400,
            wmem_max: 26_214_400,
            rto_min_ms: 200,
            enable_qos: true,
            video_ports: vec![5600, 5601, 8554],
            dscp: 46,
            enable_cake: true,
            cake_bandwidth_up_mbit: 10,
            cake_bandwidth_down_mbit: 30,
            enable_vpn_policy_routing: true,
            vpn_fwmark: 0x100,
            vpn_table: 100,
            video_table: 200,
        }
    }
}

// ── Modem pool ──────────────────────────────────────────────────────

/// Pool refresh and selection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub refresh_interval_s: f64,
    pub selection_mode: SelectionMode,
    /// Auto modes switch only when the candidate beats the active modem's
    /// metric by this margin (anti-flap).
    pub switch_margin: f64,
    /// HiLink-style modems hand out addresses in this subnet.
    pub subnet_hint: String,
    pub vpn_check_enabled: bool,
    pub vpn_recovery_timeout_s: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            refresh_interval_s: 5.0,
            selection_mode: SelectionMode::BestScore,
            switch_margin: 10.0,
            subnet_hint: "192.168.8".into(),
            vpn_check_enabled: true,
            vpn_recovery_timeout_s: 15.0,
        }
    }
}

impl PoolConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs_f64(self.refresh_interval_s.max(0.5))
    }

    pub fn vpn_recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.vpn_recovery_timeout_s.max(1.0))
    }
}
