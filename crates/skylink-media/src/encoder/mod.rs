//! Video encoder providers.
//!
//! Each provider knows how to detect its encoder on the running system,
//! describe its capability envelope, emit the GStreamer element chain that
//! implements it, and — crucially for an airborne link — declare which
//! properties are safe to mutate on a live graph.

use std::collections::HashMap;

use serde::Serialize;

use skylink_common::config::VideoConfig;
use skylink_common::profiles::VideoProfile;

use crate::error::MediaError;

mod hardware;
mod mjpeg;
mod openh264;
mod passthrough;
mod x264;

pub use hardware::HardwareH264Encoder;
pub use mjpeg::MjpegEncoder;
pub use openh264::OpenH264Encoder;
pub use passthrough::H264PassthroughEncoder;
pub use x264::X264Encoder;

// ── Element descriptions ────────────────────────────────────────────

/// A property value destined for a GStreamer element.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Str(String),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Bool(bool),
    /// Parsed into a `gst::Caps` before being set.
    Caps(String),
    /// Parsed into a `gst::Structure` before being set
    /// (V4L2 M2M `extra-controls` style).
    Structure(String),
    /// Set via string conversion — for enum-typed properties
    /// (`speed-preset`, `tune`, ...).
    Enum(String),
}

impl PropValue {
    /// gst-launch representation, for RTSP factory launch strings.
    fn launch_repr(&self) -> String {
        match self {
            PropValue::Str(s) | PropValue::Enum(s) => {
                if s.contains(' ') {
                    format!("\"{s}\"")
                } else {
                    s.clone()
                }
            }
            PropValue::I32(v) => v.to_string(),
            PropValue::U32(v) => v.to_string(),
            PropValue::I64(v) => v.to_string(),
            PropValue::U64(v) => v.to_string(),
            PropValue::Bool(v) => v.to_string(),
            PropValue::Caps(c) => format!("\"{c}\""),
            PropValue::Structure(s) => format!("\"{s}\""),
        }
    }
}

/// One element in a chain: factory name, graph name, properties.
#[derive(Debug, Clone)]
pub struct ElementSpec {
    pub name: String,
    pub element: String,
    pub properties: Vec<(String, PropValue)>,
}

impl ElementSpec {
    pub fn new(name: &str, element: &str) -> Self {
        ElementSpec {
            name: name.to_string(),
            element: element.to_string(),
            properties: Vec::new(),
        }
    }

    pub fn prop(mut self, key: &str, value: PropValue) -> Self {
        self.properties.push((key.to_string(), value));
        self
    }

    /// gst-launch fragment for this element.
    pub fn launch_fragment(&self) -> String {
        let mut out = format!("{} name={}", self.element, self.name);
        for (key, value) in &self.properties {
            out.push_str(&format!(" {key}={}", value.launch_repr()));
        }
        out
    }
}

// ── Capability model ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderClass {
    Hardware,
    Software,
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    UltraLow,
    Low,
    Medium,
    High,
}

/// Capability envelope reported by a provider.
#[derive(Debug, Clone, Serialize)]
pub struct EncoderCaps {
    pub codec_id: String,
    pub display_name: String,
    pub codec_family: String,
    pub class: EncoderClass,
    pub available: bool,
    pub supported_resolutions: Vec<(u32, u32)>,
    pub supported_framerates: Vec<u32>,
    pub bitrate: VideoProfile,
    pub quality_control: bool,
    pub live_adjust: bool,
    pub latency: CostClass,
    pub cpu_usage: CostClass,
    pub priority: i32,
}

/// One live-adjustable property.
///
/// The API surface is always kbps for bitrate and frames for GOP;
/// `multiplier` converts into the element's native unit. When
/// `format_template` is present the converted value is rendered into the
/// template (placeholder `{value}`) and the result is set as a structure —
/// the only write interface V4L2 M2M encoders offer.
#[derive(Debug, Clone)]
pub struct LiveProperty {
    pub element: &'static str,
    pub property: &'static str,
    pub min: i64,
    pub max: i64,
    pub default: i64,
    pub multiplier: i64,
    pub format_template: Option<&'static str>,
}

impl LiveProperty {
    /// Clamp an incoming value to the declared range.
    pub fn clamp(&self, value: i64) -> i64 {
        value.clamp(self.min, self.max)
    }

    /// Value in the element's native unit.
    pub fn scaled(&self, clamped: i64) -> i64 {
        clamped * self.multiplier
    }

    /// Rendered template, when this property writes a structure.
    pub fn rendered(&self, clamped: i64) -> Option<String> {
        self.format_template
            .map(|t| t.replace("{value}", &self.scaled(clamped).to_string()))
    }
}

/// Encoder chain emitted for a pipeline build.
#[derive(Debug, Clone)]
pub struct EncoderChain {
    pub elements: Vec<ElementSpec>,
    pub payloader: String,
    pub payloader_properties: Vec<(String, PropValue)>,
}

/// Build-time validation outcome: errors reject the build, warnings are
/// logged and surfaced in status.
#[derive(Debug, Clone, Default)]
pub struct ConfigReport {
    pub errors: Vec<MediaErrorDetail>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MediaErrorDetail {
    pub field: String,
    pub value: String,
    pub allowed: String,
}

impl ConfigReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// First error as a typed rejection.
    pub fn into_error(mut self) -> Option<MediaError> {
        if self.errors.is_empty() {
            return None;
        }
        let e = self.errors.remove(0);
        Some(MediaError::InvalidConfig {
            field: e.field,
            value: e.value,
            allowed: e.allowed,
        })
    }
}

// ── Provider trait ──────────────────────────────────────────────────

pub trait VideoEncoderProvider: Send + Sync {
    fn codec_id(&self) -> &str;
    fn display_name(&self) -> &str;
    fn codec_family(&self) -> &str;
    fn class(&self) -> EncoderClass;
    /// Higher wins for auto-selection.
    fn priority(&self) -> i32;

    /// Whether the encoder exists on this system. May shell out to codec
    /// tooling; the registry caches the answer process-wide.
    fn is_available(&self) -> bool;

    fn capabilities(&self) -> EncoderCaps;

    /// Emit the encoder chain for `config`. `source_format` is the media
    /// type arriving from the source ("image/jpeg", "video/x-raw", ...).
    fn build_chain(
        &self,
        config: &VideoConfig,
        source_format: &str,
    ) -> Result<EncoderChain, MediaError>;

    /// The authoritative map of properties safe to change without rebuild.
    fn live_properties(&self) -> HashMap<String, LiveProperty>;

    /// Validate `config` against this encoder's envelope.
    fn validate(&self, config: &VideoConfig) -> ConfigReport {
        base_validate(&self.capabilities(), config)
    }
}

/// The validation every encoder shares: dimension sanity plus bitrate
/// envelope warnings. Overrides layer encoder-specific checks on top.
pub(crate) fn base_validate(caps: &EncoderCaps, config: &VideoConfig) -> ConfigReport {
    let mut report = ConfigReport::default();

    if config.width == 0 || config.height == 0 {
        report.errors.push(MediaErrorDetail {
            field: "resolution".into(),
            value: format!("{}x{}", config.width, config.height),
            allowed: "positive dimensions".into(),
        });
    }
    if config.framerate == 0 {
        report.errors.push(MediaErrorDetail {
            field: "framerate".into(),
            value: "0".into(),
            allowed: "positive".into(),
        });
    }

    if caps.codec_family == "h264" || caps.codec_family == "h265" {
        if config.bitrate_kbps < caps.bitrate.min_kbps {
            report.warnings.push(format!(
                "bitrate {} kbps below encoder minimum {} kbps",
                config.bitrate_kbps, caps.bitrate.min_kbps
            ));
        }
        if config.bitrate_kbps > caps.bitrate.max_kbps {
            report.warnings.push(format!(
                "bitrate {} kbps above encoder maximum {} kbps",
                config.bitrate_kbps, caps.bitrate.max_kbps
            ));
        }
    }

    report
}

/// Whether a GStreamer element factory exists. Initializes GStreamer on
/// first use; a host without it simply has no encoders.
pub(crate) fn element_available(name: &str) -> bool {
    gst::init().is_ok() && gst::ElementFactory::find(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_fragment_renders_props() {
        let spec = ElementSpec::new("encoder", "x264enc")
            .prop("bitrate", PropValue::U32(3000))
            .prop("tune", PropValue::Enum("zerolatency".into()));
        assert_eq!(
            spec.launch_fragment(),
            "x264enc name=encoder bitrate=3000 tune=zerolatency"
        );
    }

    #[test]
    fn launch_fragment_quotes_structures() {
        let spec = ElementSpec::new("encoder", "v4l2h264enc").prop(
            "extra-controls",
            PropValue::Structure("s,video_bitrate=3000000".into()),
        );
        assert!(spec
            .launch_fragment()
            .contains("extra-controls=\"s,video_bitrate=3000000\""));
    }

    #[test]
    fn live_property_clamps_and_scales() {
        let prop = LiveProperty {
            element: "encoder",
            property: "bps",
            min: 100,
            max: 10_000,
            default: 3000,
            multiplier: 1000,
            format_template: None,
        };
        assert_eq!(prop.clamp(5_000_000), 10_000);
        assert_eq!(prop.scaled(prop.clamp(5_000_000)), 10_000_000);
        assert_eq!(prop.clamp(50), 100);
    }

    #[test]
    fn live_property_template_renders_scaled_value() {
        let prop = LiveProperty {
            element: "encoder",
            property: "extra-controls",
            min: 500,
            max: 20_000,
            default: 3000,
            multiplier: 1000,
            format_template: Some("s,video_bitrate={value}"),
        };
        assert_eq!(
            prop.rendered(prop.clamp(4000)).unwrap(),
            "s,video_bitrate=4000000"
        );
    }
}
