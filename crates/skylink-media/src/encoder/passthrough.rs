//! H.264 passthrough — re-packetizes a source that already emits
//! compressed H.264 (UVC cameras with onboard encoders, HDMI bridges).
//! No decode, no re-encode, near-zero CPU; the trade-off is that nothing
//! is live-adjustable because there is no encoder to talk to.

use std::collections::HashMap;

use skylink_common::config::VideoConfig;
use skylink_common::profiles::VideoProfile;

use crate::error::MediaError;

use super::{
    element_available, CostClass, ElementSpec, EncoderCaps, EncoderChain, EncoderClass,
    LiveProperty, PropValue, VideoEncoderProvider,
};

pub struct H264PassthroughEncoder;

impl H264PassthroughEncoder {
    pub fn new() -> Self {
        H264PassthroughEncoder
    }
}

impl Default for H264PassthroughEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoderProvider for H264PassthroughEncoder {
    fn codec_id(&self) -> &str {
        "h264_passthrough"
    }

    fn display_name(&self) -> &str {
        "H.264 Passthrough"
    }

    fn codec_family(&self) -> &str {
        "h264"
    }

    fn class(&self) -> EncoderClass {
        EncoderClass::Passthrough
    }

    fn priority(&self) -> i32 {
        90
    }

    fn is_available(&self) -> bool {
        element_available("h264parse")
    }

    fn capabilities(&self) -> EncoderCaps {
        EncoderCaps {
            codec_id: self.codec_id().into(),
            display_name: self.display_name().into(),
            codec_family: self.codec_family().into(),
            class: EncoderClass::Passthrough,
            available: self.is_available(),
            supported_resolutions: vec![(1280, 720), (1920, 1080), (3840, 2160)],
            supported_framerates: vec![24, 25, 30, 60],
            // The camera's own encoder decides; these bound what we accept.
            bitrate: VideoProfile {
                min_kbps: 500,
                default_kbps: 4000,
                max_kbps: 40_000,
            },
            quality_control: false,
            live_adjust: false,
            latency: CostClass::UltraLow,
            cpu_usage: CostClass::UltraLow,
            priority: self.priority(),
        }
    }

    fn build_chain(
        &self,
        _config: &VideoConfig,
        source_format: &str,
    ) -> Result<EncoderChain, MediaError> {
        if !source_format.contains("video/x-h264") {
            return Err(MediaError::InvalidConfig {
                field: "source_format".into(),
                value: source_format.into(),
                allowed: "video/x-h264 (passthrough needs a pre-compressed source)".into(),
            });
        }

        Ok(EncoderChain {
            elements: vec![
                ElementSpec::new("h264parse", "h264parse")
                    .prop("config-interval", PropValue::I32(-1)),
            ],
            payloader: "rtph264pay".into(),
            payloader_properties: vec![
                ("pt".into(), PropValue::U32(96)),
                ("config-interval".into(), PropValue::I32(-1)),
            ],
        })
    }

    fn live_properties(&self) -> HashMap<String, LiveProperty> {
        // Nothing to adjust: the encoder lives inside the camera.
        HashMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_h264_source() {
        let enc = H264PassthroughEncoder::new();
        let err = enc
            .build_chain(&VideoConfig::default(), "image/jpeg")
            .unwrap_err();
        assert!(matches!(err, MediaError::InvalidConfig { .. }));
    }

    #[test]
    fn h264_source_gets_parse_only() {
        let enc = H264PassthroughEncoder::new();
        let chain = enc
            .build_chain(&VideoConfig::default(), "video/x-h264")
            .unwrap();
        assert_eq!(chain.elements.len(), 1);
        assert_eq!(chain.elements[0].element, "h264parse");
    }

    #[test]
    fn nothing_is_live_adjustable() {
        let enc = H264PassthroughEncoder::new();
        assert!(enc.live_properties().is_empty());
    }
}
