//! MJPEG — the lowest common denominator. Every GStreamer install can
//! encode it, every client can decode it, and quality is adjustable live.
//! Expensive on the wire, so it is the last rung of the fallback ladder.

use std::collections::HashMap;

use skylink_common::config::VideoConfig;
use skylink_common::profiles::VideoProfile;

use crate::error::MediaError;

use super::{
    element_available, CostClass, ElementSpec, EncoderCaps, EncoderChain, EncoderClass,
    LiveProperty, PropValue, VideoEncoderProvider,
};

pub struct MjpegEncoder;

impl MjpegEncoder {
    pub fn new() -> Self {
        MjpegEncoder
    }
}

impl Default for MjpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoderProvider for MjpegEncoder {
    fn codec_id(&self) -> &str {
        "mjpeg"
    }

    fn display_name(&self) -> &str {
        "MJPEG"
    }

    fn codec_family(&self) -> &str {
        "mjpeg"
    }

    fn class(&self) -> EncoderClass {
        EncoderClass::Software
    }

    fn priority(&self) -> i32 {
        10
    }

    fn is_available(&self) -> bool {
        element_available("jpegenc")
    }

    fn capabilities(&self) -> EncoderCaps {
        EncoderCaps {
            codec_id: self.codec_id().into(),
            display_name: self.display_name().into(),
            codec_family: self.codec_family().into(),
            class: EncoderClass::Software,
            available: self.is_available(),
            supported_resolutions: vec![(640, 480), (960, 720), (1280, 720), (1920, 1080)],
            supported_framerates: vec![15, 24, 25, 30, 60],
            bitrate: VideoProfile {
                min_kbps: 1000,
                default_kbps: 8000,
                max_kbps: 40_000,
            },
            quality_control: true,
            live_adjust: true,
            latency: CostClass::UltraLow,
            cpu_usage: CostClass::Low,
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
            // Already JPEG: re-encode only to honour the quality knob.
            elements.push(ElementSpec::new("decoder", "jpegdec"));
        } else if source_format.contains("video/x-h264") {
            elements.push(ElementSpec::new("decoder", "avdec_h264"));
        }

        elements.extend([
            ElementSpec::new("videoconvert", "videoconvert"),
            ElementSpec::new("encoder", "jpegenc")
                .prop("quality", PropValue::I32(config.quality as i32)),
        ]);

        Ok(EncoderChain {
            elements,
            payloader: "rtpjpegpay".into(),
            payloader_properties: vec![("pt".into(), PropValue::U32(26))],
        })
    }

    fn live_properties(&self) -> HashMap<String, LiveProperty> {
        let mut props = HashMap::new();
        props.insert(
            "quality".to_string(),
            LiveProperty {
                element: "encoder",
                property: "quality",
                min: 1,
                max: 100,
                default: 85,
                multiplier: 1,
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
    fn quality_flows_into_jpegenc() {
        let enc = MjpegEncoder::new();
        let chain = enc
            .build_chain(
                &VideoConfig {
                    quality: 70,
                    ..Default::default()
                },
                "video/x-raw",
            )
            .unwrap();
        let encoder = chain.elements.iter().find(|e| e.name == "encoder").unwrap();
        assert!(encoder
            .properties
            .iter()
            .any(|(k, v)| k == "quality" && *v == PropValue::I32(70)));
        assert_eq!(chain.payloader, "rtpjpegpay");
    }

    #[test]
    fn quality_is_the_live_knob() {
        let enc = MjpegEncoder::new();
        let props = enc.live_properties();
        assert!(props.contains_key("quality"));
        assert!(!props.contains_key("bitrate"));
        assert_eq!(props["quality"].clamp(500), 100);
    }
}
