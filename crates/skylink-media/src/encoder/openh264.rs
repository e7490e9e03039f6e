//! Cisco OpenH264 — lighter on the CPU than x264 at the cost of quality.
//! Useful on boards whose hardware encoder is broken but whose cores are
//! too small for x264.

use std::collections::HashMap;

use skylink_common::config::VideoConfig;
use skylink_common::profiles::VideoProfile;

use crate::error::MediaError;

use super::{
    element_available, CostClass, ElementSpec, EncoderCaps, EncoderChain, EncoderClass,
    LiveProperty, PropValue, VideoEncoderProvider,
};

pub struct OpenH264Encoder;

impl OpenH264Encoder {
    pub fn new() -> Self {
        OpenH264Encoder
    }
}

impl Default for OpenH264Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoderProvider for OpenH264Encoder {
    fn codec_id(&self) -> &str {
        "h264_openh264"
    }

    fn display_name(&self) -> &str {
        "H.264 Low CPU (OpenH264)"
    }

    fn codec_family(&self) -> &str {
        "h264"
    }

    fn class(&self) -> EncoderClass {
        EncoderClass::Software
    }

    fn priority(&self) -> i32 {
        60
    }

    fn is_available(&self) -> bool {
        element_available("openh264enc")
    }

    fn capabilities(&self) -> EncoderCaps {
        EncoderCaps {
            codec_id: self.codec_id().into(),
            display_name: self.display_name().into(),
            codec_family: self.codec_family().into(),
            class: EncoderClass::Software,
            available: self.is_available(),
            supported_resolutions: vec![(640, 480), (960, 720), (1280, 720), (1920, 1080)],
            supported_framerates: vec![15, 24, 25, 30],
            bitrate: VideoProfile {
                min_kbps: 200,
                default_kbps: 1500,
                max_kbps: 8000,
            },
            quality_control: false,
            live_adjust: true,
            latency: CostClass::Low,
            cpu_usage: CostClass::Medium,
            priority: self.priority(),
        }
    }

    fn build_chain(
        &self,
        config: &VideoConfig,
        source_format: &str,
    ) -> Result<EncoderChain, MediaError> {
        let mut elements = Vec::new();

        if source_format.contains("image/jpeg") {
            elements.push(ElementSpec::new("decoder", "jpegdec"));
        } else if source_format.contains("video/x-h264") {
            elements.push(ElementSpec::new("decoder", "avdec_h264"));
        }

        elements.extend([
            ElementSpec::new("videoconvert", "videoconvert"),
            ElementSpec::new("encoder", "openh264enc")
                // openh264enc takes bits per second.
                .prop("bitrate", PropValue::U32(config.bitrate_kbps * 1000))
                .prop("gop-size", PropValue::U32(config.gop_size))
                .prop("complexity", PropValue::Enum("low".into()))
                .prop("rate-control", PropValue::Enum("bitrate".into()))
                .prop("multi-thread", PropValue::U32(2)),
            ElementSpec::new("h264parse", "h264parse").prop("config-interval", PropValue::I32(-1)),
        ]);

        Ok(EncoderChain {
            elements,
            payloader: "rtph264pay".into(),
            payloader_properties: vec![
                ("pt".into(), PropValue::U32(96)),
                ("config-interval".into(), PropValue::I32(-1)),
            ],
        })
    }

    fn live_properties(&self) -> HashMap<String, LiveProperty> {
        let mut props = HashMap::new();
        props.insert(
            "bitrate".to_string(),
            LiveProperty {
                element: "encoder",
                property: "bitrate",
                min: 200,
                max: 8000,
                default: 1500,
                // kbps at the API, bps at the element.
                multiplier: 1000,
                format_template: None,
            },
        );
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_bitrate_is_bps() {
        let enc = OpenH264Encoder::new();
        let chain = enc
            .build_chain(
                &VideoConfig {
                    bitrate_kbps: 1500,
                    ..Default::default()
                },
                "video/x-raw",
            )
            .unwrap();
        let encoder = chain.elements.iter().find(|e| e.name == "encoder").unwrap();
        assert!(encoder
            .properties
            .iter()
            .any(|(k, v)| k == "bitrate" && *v == PropValue::U32(1_500_000)));
    }

    #[test]
    fn live_bitrate_converts_kbps_to_bps() {
        let enc = OpenH264Encoder::new();
        let props = enc.live_properties();
        let bitrate = &props["bitrate"];
        assert_eq!(bitrate.scaled(bitrate.clamp(2000)), 2_000_000);
    }
}
