//! Software H.264 via x264 — the workhorse fallback when no hardware
//! encoder exists. Tuned hard for latency: zerolatency disables lookahead
//! and B-frames, ultrafast keeps a quad-core SBC under ~60% load at 720p30.

use std::collections::HashMap;

use skylink_common::config::VideoConfig;
use skylink_common::profiles::VideoProfile;

use crate::error::MediaError;

use super::{
    element_available, CostClass, ElementSpec, EncoderCaps, EncoderChain, EncoderClass,
    LiveProperty, PropValue, VideoEncoderProvider,
};

pub struct X264Encoder;

impl X264Encoder {
    pub fn new() -> Self {
        X264Encoder
    }
}

impl Default for X264Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoderProvider for X264Encoder {
    fn codec_id(&self) -> &str {
        "h264"
    }

    fn display_name(&self) -> &str {
        "H.264 (x264)"
    }

    fn codec_family(&self) -> &str {
        "h264"
    }

    fn class(&self) -> EncoderClass {
        EncoderClass::Software
    }

    fn priority(&self) -> i32 {
        70
    }

    fn is_available(&self) -> bool {
        element_available("x264enc")
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
                min_kbps: 100,
                default_kbps: 2000,
                max_kbps: 10_000,
            },
            quality_control: false,
            live_adjust: true,
            latency: CostClass::Low,
            cpu_usage: CostClass::High,
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
            ElementSpec::new("encoder", "x264enc")
                // x264enc's bitrate property is already kbps.
                .prop("bitrate", PropValue::U32(config.bitrate_kbps))
                .prop("speed-preset", PropValue::Enum("ultrafast".into()))
                .prop("tune", PropValue::Enum("zerolatency".into()))
                .prop("key-int-max", PropValue::U32(config.gop_size))
                .prop("byte-stream", PropValue::Bool(true))
                .prop("threads", PropValue::U32(2)),
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
                min: 100,
                max: 10_000,
                default: 2000,
                // Native unit is kbps already.
                multiplier: 1,
                format_template: None,
            },
        );
        props
    }
}
