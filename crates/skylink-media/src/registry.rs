//! Provider registry — pluggable video sources and encoders, keyed by
//! family and identifier.
//!
//! Availability probing can shell out to codec tooling, so
//! [`ProviderRegistry::available_encoders`] runs it once off the async
//! scheduler and memoizes the result for the life of the process.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::encoder::{
    EncoderCaps, EncoderClass, H264PassthroughEncoder, HardwareH264Encoder, MjpegEncoder,
    OpenH264Encoder, VideoEncoderProvider, X264Encoder,
};
use crate::error::MediaError;
use crate::source::{HdmiCaptureSource, TestPatternSource, V4l2Source, VideoSourceProvider};

/// Outcome of codec adaptation: the id actually used, and the requested id
/// when a fallback happened (surfaced in pipeline status).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptedCodec {
    pub codec_id: String,
    pub adapted_from: Option<String>,
}

pub struct ProviderRegistry {
    sources: HashMap<String, Arc<dyn VideoSourceProvider>>,
    encoders: HashMap<String, Arc<dyn VideoEncoderProvider>>,
    available_cache: OnceCell<Vec<EncoderCaps>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        ProviderRegistry {
            sources: HashMap::new(),
            encoders: HashMap::new(),
            available_cache: OnceCell::new(),
        }
    }

    /// Registry pre-loaded with every built-in provider.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register_source(Arc::new(V4l2Source::new()))
            .expect("default source ids are unique");
        registry
            .register_source(Arc::new(HdmiCaptureSource::new()))
            .expect("default source ids are unique");
        registry
            .register_source(Arc::new(TestPatternSource::new()))
            .expect("default source ids are unique");

        registry
            .register_encoder(Arc::new(HardwareH264Encoder::new()))
            .expect("default encoder ids are unique");
        registry
            .register_encoder(Arc::new(H264PassthroughEncoder::new()))
            .expect("default encoder ids are unique");
        registry
            .register_encoder(Arc::new(X264Encoder::new()))
            .expect("default encoder ids are unique");
        registry
            .register_encoder(Arc::new(OpenH264Encoder::new()))
            .expect("default encoder ids are unique");
        registry
            .register_encoder(Arc::new(MjpegEncoder::new()))
            .expect("default encoder ids are unique");
        registry
    }

    // ─── Registration ───────────────────────────────────────────────

    pub fn register_source(
        &mut self,
        provider: Arc<dyn VideoSourceProvider>,
    ) -> Result<(), MediaError> {
        let id = provider.id().to_string();
        if self.sources.contains_key(&id) {
            return Err(MediaError::DuplicateProvider {
                family: "video_source",
                id,
            });
        }
        self.sources.insert(id, provider);
        Ok(())
    }

    pub fn register_encoder(
        &mut self,
        provider: Arc<dyn VideoEncoderProvider>,
    ) -> Result<(), MediaError> {
        let id = provider.codec_id().to_string();
        if self.encoders.contains_key(&id) {
            return Err(MediaError::DuplicateProvider {
                family: "video_encoder",
                id,
            });
        }
        self.encoders.insert(id, provider);
        Ok(())
    }

    // ─── Lookup ─────────────────────────────────────────────────────

    pub fn list_sources(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn list_encoders(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.encoders.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn source(&self, id: &str) -> Option<Arc<dyn VideoSourceProvider>> {
        self.sources.get(id).cloned()
    }

    pub fn encoder(&self, id: &str) -> Option<Arc<dyn VideoEncoderProvider>> {
        self.encoders.get(id).cloned()
    }

    /// The source provider that enumerates `device`, falling back to the
    /// plain v4l2 provider.
    pub fn source_for_device(&self, device: &str) -> Option<Arc<dyn VideoSourceProvider>> {
        let mut providers: Vec<&Arc<dyn VideoSourceProvider>> = self.sources.values().collect();
        providers.sort_by_key(|p| std::cmp::Reverse(p.priority()));

        for provider in providers {
            if !provider.is_available() {
                continue;
            }
            if provider.discover().iter().any(|s| s.device == device) {
                return Some(provider.clone());
            }
        }
        self.source("v4l2")
    }

    /// Capability records of every available encoder. The availability
    /// probe is expensive, so it runs once per process on a blocking
    /// thread and the answer is cached.
    pub async fn available_encoders(self: &Arc<Self>) -> Vec<EncoderCaps> {
        let registry = self.clone();
        self.available_cache
            .get_or_init(|| async move {
                tokio::task::spawn_blocking(move || {
                    let mut caps: Vec<EncoderCaps> = registry
                        .encoders
                        .values()
                        .filter(|p| p.is_available())
                        .map(|p| p.capabilities())
                        .collect();
                    caps.sort_by_key(|c| std::cmp::Reverse(c.priority));
                    caps
                })
                .await
                .unwrap_or_default()
            })
            .await
            .clone()
    }

    // ─── Codec adaptation ───────────────────────────────────────────

    /// Choose the encoder actually used for `requested`, given the board's
    /// declared encoder set (empty = no board knowledge, trust the
    /// request). Ordered policy: exact match → hardware variant within the
    /// family → software variant within the family → MJPEG.
    pub fn adapt_codec(&self, requested: &str, board_encoders: &[String]) -> AdaptedCodec {
        let supported =
            |id: &str| board_encoders.is_empty() || board_encoders.iter().any(|b| b == id);

        if let Some(provider) = self.encoders.get(requested) {
            if supported(requested) && provider.is_available() {
                return AdaptedCodec {
                    codec_id: requested.to_string(),
                    adapted_from: None,
                };
            }
        }

        let family = self
            .encoders
            .get(requested)
            .map(|p| p.codec_family().to_string())
            .unwrap_or_else(|| "h264".to_string());

        // Hardware variant in the same family, then software.
        for class in [EncoderClass::Hardware, EncoderClass::Software] {
            let mut candidates: Vec<&Arc<dyn VideoEncoderProvider>> = self
                .encoders
                .values()
                .filter(|p| {
                    p.codec_family() == family
                        && p.class() == class
                        && p.codec_id() != requested
                        && supported(p.codec_id())
                        && p.is_available()
                })
                .collect();
            candidates.sort_by_key(|p| std::cmp::Reverse(p.priority()));

            if let Some(fallback) = candidates.first() {
                tracing::warn!(
                    requested,
                    fallback = fallback.codec_id(),
                    "requested codec unavailable, falling back"
                );
                return AdaptedCodec {
                    codec_id: fallback.codec_id().to_string(),
                    adapted_from: Some(requested.to_string()),
                };
            }
        }

        tracing::warn!(requested, "no codec in family available, falling back to mjpeg");
        AdaptedCodec {
            codec_id: "mjpeg".to_string(),
            adapted_from: Some(requested.to_string()),
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{ConfigReport, EncoderChain, LiveProperty};
    use skylink_common::config::VideoConfig;
    use std::collections::HashMap as StdHashMap;

    /// Scriptable encoder for registry tests.
    struct FakeEncoder {
        id: &'static str,
        family: &'static str,
        class: EncoderClass,
        available: bool,
        priority: i32,
    }

    impl VideoEncoderProvider for FakeEncoder {
        fn codec_id(&self) -> &str {
            self.id
        }
        fn display_name(&self) -> &str {
            self.id
        }
        fn codec_family(&self) -> &str {
            self.family
        }
        fn class(&self) -> EncoderClass {
            self.class
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn is_available(&self) -> bool {
            self.available
        }
        fn capabilities(&self) -> EncoderCaps {
            EncoderCaps {
                codec_id: self.id.into(),
                display_name: self.id.into(),
                codec_family: self.family.into(),
                class: self.class,
                available: self.available,
                supported_resolutions: vec![(1280, 720)],
                supported_framerates: vec![30],
                bitrate: skylink_common::profiles::VideoProfile {
                    min_kbps: 100,
                    default_kbps: 2000,
                    max_kbps: 10_000,
                },
                quality_control: false,
                live_adjust: false,
                latency: crate::encoder::CostClass::Low,
                cpu_usage: crate::encoder::CostClass::Low,
                priority: self.priority,
            }
        }
        fn build_chain(
            &self,
            _config: &VideoConfig,
            _source_format: &str,
        ) -> Result<EncoderChain, MediaError> {
            Ok(EncoderChain {
                elements: vec![],
                payloader: "rtph264pay".into(),
                payloader_properties: vec![],
            })
        }
        fn live_properties(&self) -> StdHashMap<String, LiveProperty> {
            StdHashMap::new()
        }
        fn validate(&self, _config: &VideoConfig) -> ConfigReport {
            ConfigReport::default()
        }
    }

    fn registry_with(encoders: Vec<FakeEncoder>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for enc in encoders {
            registry.register_encoder(Arc::new(enc)).unwrap();
        }
        registry
    }

    fn fake(id: &'static str, family: &'static str, class: EncoderClass, available: bool) -> FakeEncoder {
        FakeEncoder {
            id,
            family,
            class,
            available,
            priority: match class {
                EncoderClass::Hardware => 100,
                EncoderClass::Passthrough => 90,
                EncoderClass::Software => 50,
            },
        }
    }

    // ─── Registration ───────────────────────────────────────────────────

    #[test]
    fn duplicate_encoder_rejected() {
        let mut registry = registry_with(vec![fake("h264", "h264", EncoderClass::Software, true)]);
        let err = registry
            .register_encoder(Arc::new(fake("h264", "h264", EncoderClass::Software, true)))
            .unwrap_err();
        assert!(matches!(err, MediaError::DuplicateProvider { family: "video_encoder", .. }));
    }

    #[test]
    fn lookup_by_id() {
        let registry = registry_with(vec![fake("h264", "h264", EncoderClass::Software, true)]);
        assert!(registry.encoder("h264").is_some());
        assert!(registry.encoder("h265").is_none());
        assert_eq!(registry.list_encoders(), vec!["h264"]);
    }

    // ─── Codec adaptation ───────────────────────────────────────────────

    #[test]
    fn exact_match_wins() {
        let registry = registry_with(vec![
            fake("h264_hardware", "h264", EncoderClass::Hardware, true),
            fake("h264", "h264", EncoderClass::Software, true),
        ]);
        let adapted = registry.adapt_codec("h264_hardware", &[]);
        assert_eq!(adapted.codec_id, "h264_hardware");
        assert!(adapted.adapted_from.is_none());
    }

    #[test]
    fn unavailable_hardware_falls_to_software() {
        let registry = registry_with(vec![
            fake("h264_hardware", "h264", EncoderClass::Hardware, false),
            fake("h264", "h264", EncoderClass::Software, true),
        ]);
        let adapted = registry.adapt_codec("h264_hardware", &[]);
        assert_eq!(adapted.codec_id, "h264");
        assert_eq!(adapted.adapted_from.as_deref(), Some("h264_hardware"));
    }

    #[test]
    fn software_request_prefers_hardware_fallback() {
        // The requested software encoder is missing; the hardware variant
        // in the family outranks the other software one.
        let registry = registry_with(vec![
            fake("h264", "h264", EncoderClass::Software, false),
            fake("h264_hardware", "h264", EncoderClass::Hardware, true),
            fake("h264_openh264", "h264", EncoderClass::Software, true),
        ]);
        let adapted = registry.adapt_codec("h264", &[]);
        assert_eq!(adapted.codec_id, "h264_hardware");
    }

    #[test]
    fn nothing_in_family_falls_to_mjpeg() {
        let registry = registry_with(vec![
            fake("h264_hardware", "h264", EncoderClass::Hardware, false),
            fake("mjpeg", "mjpeg", EncoderClass::Software, true),
        ]);
        let adapted = registry.adapt_codec("h264_hardware", &[]);
        assert_eq!(adapted.codec_id, "mjpeg");
        assert_eq!(adapted.adapted_from.as_deref(), Some("h264_hardware"));
    }

    #[test]
    fn board_feature_set_constrains_choice() {
        let registry = registry_with(vec![
            fake("h264_hardware", "h264", EncoderClass::Hardware, true),
            fake("h264", "h264", EncoderClass::Software, true),
        ]);
        // Board declares only software H.264.
        let adapted = registry.adapt_codec("h264_hardware", &["h264".to_string()]);
        assert_eq!(adapted.codec_id, "h264");
        assert_eq!(adapted.adapted_from.as_deref(), Some("h264_hardware"));
    }

    // ─── Availability cache ─────────────────────────────────────────────

    #[tokio::test]
    async fn available_encoders_filters_and_sorts() {
        let registry = Arc::new(registry_with(vec![
            fake("h264_hardware", "h264", EncoderClass::Hardware, true),
            fake("h264", "h264", EncoderClass::Software, true),
            fake("h264_openh264", "h264", EncoderClass::Software, false),
        ]));

        let caps = registry.available_encoders().await;
        assert_eq!(caps.len(), 2);
        assert_eq!(caps[0].codec_id, "h264_hardware", "sorted by priority");
    }

    #[tokio::test]
    async fn available_encoders_is_memoized() {
        let registry = Arc::new(registry_with(vec![fake(
            "h264",
            "h264",
            EncoderClass::Software,
            true,
        )]));
        let first = registry.available_encoders().await;
        let second = registry.available_encoders().await;
        assert_eq!(first.len(), second.len());
    }
}
