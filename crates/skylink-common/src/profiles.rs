//! Video profile presets — maps resolution class + framerate + codec to a
//! bitrate envelope. Used to fill smart defaults when a pipeline spec omits
//! explicit bitrate values.

use serde::{Deserialize, Serialize};

/// A bitrate envelope for a given resolution/framerate/codec combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoProfile {
    pub min_kbps: u32,
    pub default_kbps: u32,
    pub max_kbps: u32,
}

/// Compute a bitrate envelope from the frame height (the resolution class:
/// 540p, 720p, 1080p, ...), framerate, and codec family.
///
/// The base table is tuned for low-latency H.264 over a cellular uplink;
/// MJPEG needs roughly 2.5× the bits for comparable quality and H.265
/// roughly two thirds.
pub fn lookup_profile(height: u32, framerate: u32, codec_family: &str) -> VideoProfile {
    let hfr = framerate > 30;

    let (min, default, max) = match (height, hfr) {
        (0..=540, false) => (500, 1500, 3000),
        (0..=540, true) => (800, 2000, 4000),
        (541..=720, false) => (1000, 2500, 4000),
        (541..=720, true) => (1500, 3500, 6000),
        (721..=1080, false) => (2000, 4000, 8000),
        (721..=1080, true) => (3000, 6000, 12000),
        (1081..=1440, false) => (4000, 8000, 14000),
        (1081..=1440, true) => (6000, 12000, 20000),
        (_, false) => (8000, 16000, 30000),
        (_, true) => (10000, 20000, 40000),
    };

    let scale = match codec_family {
        "mjpeg" => 2.5,
        "h265" => 0.67,
        _ => 1.0,
    };

    VideoProfile {
        min_kbps: (min as f64 * scale) as u32,
        default_kbps: (default as f64 * scale) as u32,
        max_kbps: (max as f64 * scale) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_720p30_h264() {
        let p = lookup_profile(720, 30, "h264");
        assert_eq!(p.default_kbps, 2500);
        assert_eq!(p.max_kbps, 4000);
    }

    #[test]
    fn profile_hfr_higher_than_sfr() {
        let sfr = lookup_profile(1080, 30, "h264");
        let hfr = lookup_profile(1080, 60, "h264");
        assert!(hfr.default_kbps > sfr.default_kbps);
        assert!(hfr.min_kbps > sfr.min_kbps);
        assert!(hfr.max_kbps > sfr.max_kbps);
    }

    #[test]
    fn mjpeg_costs_more_than_h264() {
        let h264 = lookup_profile(720, 30, "h264");
        let mjpeg = lookup_profile(720, 30, "mjpeg");
        assert!(mjpeg.default_kbps > h264.default_kbps);
    }

    #[test]
    fn h265_costs_less_than_h264() {
        let h264 = lookup_profile(1080, 30, "h264");
        let h265 = lookup_profile(1080, 30, "h265");
        assert!(h265.default_kbps < h264.default_kbps);
    }
}
