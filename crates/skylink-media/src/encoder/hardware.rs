//! Hardware H.264 encoding via V4L2 M2M or Rockchip MPP.
//!
//! Detection runs once per process and is shared by every instance:
//! probing GStreamer's registry and /dev is too slow to repeat on each
//! construction. MPP-based elements take bitrate/GOP as plain properties;
//! V4L2 M2M elements only accept a composite `extra-controls` structure,
//! which is why the live-property map carries a format template there.

use std::collections::HashMap;

use once_cell::sync::OnceCell;

use skylink_common::config::VideoConfig;
use skylink_common::profiles::VideoProfile;

use crate::error::MediaError;

use super::{
    element_available, CostClass, ElementSpec, EncoderCaps, EncoderChain, EncoderClass,
    LiveProperty, PropValue, VideoEncoderProvider,
};

/// Detection order: MPP first (it outperforms the generic M2M wrapper on
/// boards that have both), then the V4L2 M2M variants.
const ELEMENT_CANDIDATES: &[&str] = &[
    "mpph264enc",
    "mppvideoenc",
    "v4l2h264enc",
    "v4l2video11h264enc",
];

/// Process-wide detection cache: empty string = checked, nothing found.
static DETECTED_ELEMENT: OnceCell<String> = OnceCell::new();

fn detect_element() -> &'static str {
    let detected = DETECTED_ELEMENT.get_or_init(|| {
        for candidate in ELEMENT_CANDIDATES {
            if element_available(candidate) {
                let is_mpp = candidate.starts_with("mpp");
                // MPP encoders talk to /dev/mpp_service directly.
                if is_mpp && !std::path::Path::new("/dev/mpp_service").exists() {
                    continue;
                }
                tracing::info!(element = candidate, "hardware H.264 encoder detected");
                return candidate.to_string();
            }
        }
        tracing::debug!("no hardware H.264 encoder element found");
        String::new()
    });
    detected.as_str()
}

pub struct HardwareH264Encoder {
    /// Pinned element name, or `None` to use process-wide detection.
    forced_element: Option<String>,
}

impl HardwareH264Encoder {
    pub fn new() -> Self {
        HardwareH264Encoder {
            forced_element: None,
        }
    }

    /// Pin the encoder element, bypassing detection. For tests and for
    /// board definitions that know their silicon.
    pub fn with_element(element: &str) -> Self {
        HardwareH264Encoder {
            forced_element: Some(element.to_string()),
        }
    }

    fn element(&self) -> String {
        match &self.forced_element {
            Some(e) => e.clone(),
            None => detect_element().to_string(),
        }
    }

    fn is_mpp(&self) -> bool {
        matches!(self.element().as_str(), "mpph264enc" | "mppvideoenc")
    }
}

impl Default for HardwareH264Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoderProvider for HardwareH264Encoder {
    fn codec_id(&self) -> &str {
        "h264_hardware"
    }

    fn display_name(&self) -> &str {
        "H.264 (Hardware)"
    }

    fn codec_family(&self) -> &str {
        "h264"
    }

    fn class(&self) -> EncoderClass {
        EncoderClass::Hardware
    }

    fn priority(&self) -> i32 {
        100
    }

    fn is_available(&self) -> bool {
        !self.element().is_empty()
    }

    fn capabilities(&self) -> EncoderCaps {
        EncoderCaps {
            codec_id: self.codec_id().into(),
            display_name: self.display_name().into(),
            codec_family: self.codec_family().into(),
            class: EncoderClass::Hardware,
            available: self.is_available(),
            supported_resolutions: vec![
                (640, 480),
                (960, 720),
                (1280, 720),
                (1920, 1080),
                (3840, 2160),
            ],
            supported_framerates: vec![15, 24, 25, 30, 60],
            bitrate: VideoProfile {
                min_kbps: 500,
                default_kbps: 3000,
                max_kbps: 20_000,
            },
            quality_control: false,
            live_adjust: true,
            latency: CostClass::UltraLow,
            cpu_usage: CostClass::UltraLow,
            priority: self.priority(),
        }
    }

    fn build_chain(
        &self,
        config: &VideoConfig,
        source_format: &str,
    ) -> Result<EncoderChain, MediaError> {
        let element = self.element();
        if element.is_empty() {
            return Err(MediaError::Unavailable(
                "hardware encoder not present on this system".into(),
            ));
        }

        let mut elements = Vec::new();

        // Decoder selection by source format. Raw sources need none.
        if source_format.contains("video/x-h264") {
            elements.push(ElementSpec::new("decoder", "avdec_h264"));
        } else if source_format.contains("image/jpeg") {
            let jpeg_dec = if element_available("v4l2jpegdec") {
                "v4l2jpegdec"
            } else {
                "jpegdec"
            };
            elements.push(ElementSpec::new("decoder", jpeg_dec));
        }

        let encoder_spec = if self.is_mpp() {
            // Level cap must cover the chosen resolution: 4K or >30 fps
            // needs 5.0, 1080p30 and below fits 4.0.
            let level = if config.width * config.height > 1920 * 1080 || config.framerate > 30 {
                50
            } else {
                40
            };

            ElementSpec::new("encoder", &element)
                .prop("bps", PropValue::I32((config.bitrate_kbps * 1000) as i32))
                .prop(
                    "bps-max",
                    PropValue::I32((config.bitrate_kbps as f64 * 1000.0 * 1.5) as i32),
                )
                // VBR: a detailed I-frame may need 3× the bits of its
                // neighbours; CBR would answer that with a higher QP.
                .prop("rc-mode", PropValue::I32(0))
                .prop("gop", PropValue::I32(config.gop_size as i32))
                .prop("level", PropValue::I32(level))
                .prop("profile", PropValue::Enum("high".into()))
                .prop("header-mode", PropValue::I32(1))
                // QP ceiling keeps hard scenes from going gray at QP 51.
                .prop("qp-max", PropValue::I32(38))
                .prop("qp-min", PropValue::I32(20))
        } else {
            let mut controls = format!("s,video_bitrate={}", config.bitrate_kbps * 1000);
            if config.gop_size > 0 {
                controls.push_str(&format!(",video_gop_size={}", config.gop_size));
            }
            controls.push_str(",video_b_frames=0");

            ElementSpec::new("encoder", &element)
                .prop("extra-controls", PropValue::Structure(controls))
        };

        elements.extend([
            ElementSpec::new("videoconvert", "videoconvert"),
            ElementSpec::new("videoscale", "videoscale"),
            ElementSpec::new("encoder_caps", "capsfilter").prop(
                "caps",
                PropValue::Caps(format!(
                    "video/x-raw,format=NV12,width={},height={},framerate={}/1",
                    config.width, config.height, config.framerate
                )),
            ),
            queue("queue_pre"),
        ]);
        elements.push(encoder_spec);
        elements.push(queue("queue_post"));
        // Repeat SPS/PPS with every keyframe so a receiver can join
        // mid-stream after loss.
        elements.push(ElementSpec::new("h264parse", "h264parse").prop("config-interval", PropValue::I32(-1)));

        Ok(EncoderChain {
            elements,
            payloader: "rtph264pay".into(),
            payloader_properties: vec![
                ("pt".into(), PropValue::U32(96)),
                // Conservative MTU leaves room for SRTP/DTLS overhead.
                ("mtu".into(), PropValue::U32(1300)),
                ("config-interval".into(), PropValue::I32(-1)),
            ],
        })
    }

    fn live_properties(&self) -> HashMap<String, LiveProperty> {
        let mut props = HashMap::new();
        if self.is_mpp() {
            props.insert(
                "bitrate".to_string(),
                LiveProperty {
                    element: "encoder",
                    property: "bps",
                    min: 500,
                    max: 20_000,
                    default: 3000,
                    multiplier: 1000,
                    format_template: None,
                },
            );
            props.insert(
                "gop-size".to_string(),
                LiveProperty {
                    element: "encoder",
                    property: "gop",
                    min: 1,
                    max: 300,
                    default: 30,
                    multiplier: 1,
                    format_template: None,
                },
            );
        } else {
            props.insert(
                "bitrate".to_string(),
                LiveProperty {
                    element: "encoder",
                    property: "extra-controls",
                    min: 500,
                    max: 20_000,
                    default: 3000,
                    multiplier: 1000,
                    format_template: Some("s,video_bitrate={value}"),
                },
            );
            props.insert(
                "gop-size".to_string(),
                LiveProperty {
                    element: "encoder",
                    property: "extra-controls",
                    min: 1,
                    max: 300,
                    default: 30,
                    multiplier: 1,
                    format_template: Some("s,video_gop_size={value}"),
                },
            );
        }
        props
    }

    fn validate(&self, config: &VideoConfig) -> super::ConfigReport {
        let mut report = super::base_validate(&self.capabilities(), config);

        if config.width * config.height > 3840 * 2160 {
            report
                .warnings
                .push("resolution exceeds 4K, hardware may not support it".into());
        }
        if config.framerate > 60 {
            report
                .warnings
                .push("framerate above 60 fps may exceed hardware capability".into());
        }
        report
    }
}

fn queue(name: &str) -> ElementSpec {
    ElementSpec::new(name, "queue")
        .prop("max-size-buffers", PropValue::U32(2))
        .prop("max-size-time", PropValue::U64(0))
        .prop("max-size-bytes", PropValue::U32(0))
        .prop("leaky", PropValue::Enum("downstream".into()))
}
