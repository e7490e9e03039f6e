//! Test pattern source — always available, no hardware required.
//! Used by `--simulate` mode and by the pipeline tests.

use std::collections::BTreeMap;

use skylink_common::config::VideoConfig;

use crate::encoder::{ElementSpec, PropValue};
use crate::error::MediaError;

use super::{SourceCaps, SourceElements, SourceIdentity, VideoSourceProvider};

pub struct TestPatternSource;

impl TestPatternSource {
    pub fn new() -> Self {
        TestPatternSource
    }
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoSourceProvider for TestPatternSource {
    fn id(&self) -> &str {
        "test"
    }

    fn display_name(&self) -> &str {
        "Test Pattern"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn is_available(&self) -> bool {
        true
    }

    fn discover(&self) -> Vec<SourceCaps> {
        let mut framerates = BTreeMap::new();
        framerates.insert("1920x1080".to_string(), vec![60, 30]);
        framerates.insert("1280x720".to_string(), vec![60, 30]);
        framerates.insert("640x480".to_string(), vec![60, 30]);

        vec![SourceCaps {
            device: "test".into(),
            identity: SourceIdentity {
                card_name: "Test Pattern".into(),
                driver: "videotestsrc".into(),
                bus_info: String::new(),
            },
            resolutions: vec![(1920, 1080), (1280, 720), (640, 480)],
            framerates,
            formats: vec!["RAW".into()],
            pre_compressed: false,
        }]
    }

    fn build_source(
        &self,
        _device: &str,
        config: &VideoConfig,
        _format_hint: Option<&str>,
    ) -> Result<SourceElements, MediaError> {
        Ok(SourceElements {
            element: ElementSpec::new("source", "videotestsrc")
                .prop("is-live", PropValue::Bool(true))
                .prop("pattern", PropValue::Enum("smpte".into())),
            caps_filter: Some(format!(
                "video/x-raw,width={},height={},framerate={}/1",
                config.width, config.height, config.framerate
            )),
            post_elements: vec![ElementSpec::new("source_queue", "queue")
                .prop("max-size-buffers", PropValue::U32(3))],
            output_format: "video/x-raw".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_available() {
        assert!(TestPatternSource::new().is_available());
    }

    #[test]
    fn emits_live_test_source() {
        let elements = TestPatternSource::new()
            .build_source("test", &VideoConfig::default(), None)
            .unwrap();
        assert_eq!(elements.element.element, "videotestsrc");
        assert_eq!(elements.output_format, "video/x-raw");
        assert!(elements
            .element
            .properties
            .iter()
            .any(|(k, v)| k == "is-live" && *v == PropValue::Bool(true)));
    }
}
