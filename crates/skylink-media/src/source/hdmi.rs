//! HDMI capture bridges (MS2109/MS2130-class USB dongles).
//!
//! These look like UVC cameras but identify as capture bridges and always
//! deliver whatever the HDMI input feeds them, so discovery filters on the
//! card name and the defaults lean to 1080p.

use skylink_common::config::VideoConfig;

use crate::error::MediaError;

use super::v4l2::V4l2Source;
use super::{SourceCaps, SourceElements, VideoSourceProvider};

/// Card-name fragments that identify an HDMI bridge rather than a camera.
const HDMI_MARKERS: &[&str] = &["hdmi", "ms2109", "ms2130", "capture"];

pub struct HdmiCaptureSource {
    inner: V4l2Source,
}

impl HdmiCaptureSource {
    pub fn new() -> Self {
        HdmiCaptureSource {
            inner: V4l2Source::new(),
        }
    }

    fn is_hdmi(caps: &SourceCaps) -> bool {
        let name = caps.identity.card_name.to_lowercase();
        HDMI_MARKERS.iter().any(|m| name.contains(m))
    }
}

impl Default for HdmiCaptureSource {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoSourceProvider for HdmiCaptureSource {
    fn id(&self) -> &str {
        "hdmi"
    }

    fn display_name(&self) -> &str {
        "HDMI Capture"
    }

    fn priority(&self) -> i32 {
        60
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    fn discover(&self) -> Vec<SourceCaps> {
        self.inner
            .discover()
            .into_iter()
            .filter(Self::is_hdmi)
            .collect()
    }

    fn build_source(
        &self,
        device: &str,
        config: &VideoConfig,
        format_hint: Option<&str>,
    ) -> Result<SourceElements, MediaError> {
        // An HDMI bridge can't scale; take its native geometry when the
        // caller kept the camera-ish default.
        let mut config = config.clone();
        if config.width < 1280 {
            config.width = 1920;
            config.height = 1080;
        }
        self.inner.build_source(device, &config, format_hint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceIdentity;
    use std::collections::BTreeMap;

    fn caps_named(name: &str) -> SourceCaps {
        SourceCaps {
            device: "/dev/video0".into(),
            identity: SourceIdentity {
                card_name: name.into(),
                driver: "uvcvideo".into(),
                bus_info: String::new(),
            },
            resolutions: vec![(1920, 1080)],
            framerates: BTreeMap::new(),
            formats: vec!["MJPG".into()],
            pre_compressed: false,
        }
    }

    #[test]
    fn recognises_hdmi_bridges() {
        assert!(HdmiCaptureSource::is_hdmi(&caps_named("USB3.0 HDMI Capture")));
        assert!(HdmiCaptureSource::is_hdmi(&caps_named("MS2130")));
        assert!(!HdmiCaptureSource::is_hdmi(&caps_named("HD USB Camera")));
    }

    #[test]
    fn small_geometry_is_upgraded() {
        let source = HdmiCaptureSource::new();
        let elements = source
            .build_source(
                "/dev/video0",
                &VideoConfig {
                    width: 960,
                    height: 720,
                    ..Default::default()
                },
                Some("image/jpeg"),
            )
            .unwrap();
        assert!(elements.caps_filter.unwrap().contains("width=1920"));
    }
}
