//! Video source providers.
//!
//! A source provider enumerates capture devices, reports their capability
//! records (resolutions, per-resolution framerates, pixel formats, and an
//! identity triple that survives device-path renumbering), and emits the
//! head of the media graph for a chosen device.

use std::collections::BTreeMap;

use serde::Serialize;

use skylink_common::config::VideoConfig;

use crate::encoder::ElementSpec;
use crate::error::MediaError;

mod hdmi;
mod test;
mod v4l2;

pub use hdmi::HdmiCaptureSource;
pub use test::TestPatternSource;
pub use v4l2::V4l2Source;

/// Stable identity of a capture device: `{card_name, driver, bus_info}`.
/// Device paths renumber across boots; this triple does not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceIdentity {
    pub card_name: String,
    pub driver: String,
    pub bus_info: String,
}

/// Capability record for one discovered device.
#[derive(Debug, Clone, Serialize)]
pub struct SourceCaps {
    pub device: String,
    pub identity: SourceIdentity,
    /// Resolutions sorted by pixel count, largest first.
    pub resolutions: Vec<(u32, u32)>,
    /// Framerates per "WxH" resolution key, highest first.
    pub framerates: BTreeMap<String, Vec<u32>>,
    /// Pixel/stream formats as reported ("MJPG", "YUYV", "H264", ...).
    pub formats: Vec<String>,
    /// Whether the device emits pre-compressed output (native H.264).
    pub pre_compressed: bool,
}

/// Graph head emitted for a build: source element, its caps, and any
/// post-source elements the provider needs between source and encoder.
#[derive(Debug, Clone)]
pub struct SourceElements {
    pub element: ElementSpec,
    pub caps_filter: Option<String>,
    pub post_elements: Vec<ElementSpec>,
    /// Media type flowing out of this head ("image/jpeg", "video/x-raw",
    /// "video/x-h264") — drives the encoder's decoder selection.
    pub output_format: String,
}

pub trait VideoSourceProvider: Send + Sync {
    fn id(&self) -> &str;
    fn display_name(&self) -> &str;
    /// Higher wins for auto-selection.
    fn priority(&self) -> i32;

    fn is_available(&self) -> bool;

    /// Enumerate devices this provider can drive.
    fn discover(&self) -> Vec<SourceCaps>;

    /// Emit the graph head for `device` at the requested geometry.
    /// `format_hint` forces a specific source format when present.
    fn build_source(
        &self,
        device: &str,
        config: &VideoConfig,
        format_hint: Option<&str>,
    ) -> Result<SourceElements, MediaError>;
}
