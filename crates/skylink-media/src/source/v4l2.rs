//! V4L2 capture devices, probed with `v4l2-ctl`.
//!
//! Discovery shells `v4l2-ctl --info` / `--list-formats-ext` per
//! /dev/video* node; the parsers are pure so they can be pinned against
//! captured output. Identity matching lets a camera keep working when the
//! kernel hands it a different /dev/videoN after a reboot.

use std::collections::BTreeMap;
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;

use skylink_common::config::VideoConfig;

use crate::encoder::{ElementSpec, PropValue};
use crate::error::MediaError;

use super::{SourceCaps, SourceElements, SourceIdentity, VideoSourceProvider};

static FPS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(([0-9.]+)\s*fps\)").unwrap());
static SIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)x(\d+)").unwrap());
static FORMAT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"'(\w+)'").unwrap());

pub struct V4l2Source;

impl V4l2Source {
    pub fn new() -> Self {
        V4l2Source
    }

    /// Find a device path by identity. Exact name+bus match wins; a
    /// name-only match is the fallback.
    pub fn find_device_by_identity(&self, card_name: &str, bus_info: &str) -> Option<String> {
        let mut name_match = None;
        for device in video_nodes() {
            let Some((identity, is_capture)) = probe_identity(&device) else {
                continue;
            };
            if !is_capture || identity.card_name != card_name {
                continue;
            }
            if !bus_info.is_empty() && identity.bus_info == bus_info {
                return Some(device);
            }
            if name_match.is_none() {
                name_match = Some(device);
            }
        }
        name_match
    }
}

impl Default for V4l2Source {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoSourceProvider for V4l2Source {
    fn id(&self) -> &str {
        "v4l2"
    }

    fn display_name(&self) -> &str {
        "V4L2 Camera"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn is_available(&self) -> bool {
        Command::new("v4l2-ctl")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn discover(&self) -> Vec<SourceCaps> {
        let mut sources = Vec::new();
        for device in video_nodes() {
            let Some((identity, is_capture)) = probe_identity(&device) else {
                continue;
            };
            if !is_capture {
                continue;
            }

            let Some(formats_out) = run_v4l2(&device, "--list-formats-ext") else {
                continue;
            };
            let (formats, framerates) = parse_formats_ext(&formats_out);
            if framerates.is_empty() {
                continue;
            }

            let mut resolutions: Vec<(u32, u32)> = framerates
                .keys()
                .filter_map(parse_resolution_key)
                .collect();
            resolutions.sort_by_key(|(w, h)| std::cmp::Reverse(w * h));

            let pre_compressed = formats.iter().any(|f| f == "H264");

            sources.push(SourceCaps {
                device,
                identity,
                resolutions,
                framerates,
                formats,
                pre_compressed,
            });
        }
        sources
    }

    fn build_source(
        &self,
        device: &str,
        config: &VideoConfig,
        format_hint: Option<&str>,
    ) -> Result<SourceElements, MediaError> {
        // Format preference: the hint wins; otherwise pre-compressed H.264,
        // then MJPEG (cheap to move off the sensor at high resolution),
        // then raw.
        let formats: Vec<String> = run_v4l2(device, "--list-formats-ext")
            .map(|out| parse_formats_ext(&out).0)
            .unwrap_or_default();

        let chosen = match format_hint {
            Some(hint) => hint.to_string(),
            None => {
                if formats.iter().any(|f| f == "H264") {
                    "video/x-h264".into()
                } else if formats.iter().any(|f| f == "MJPG") {
                    "image/jpeg".into()
                } else {
                    "video/x-raw".into()
                }
            }
        };

        let caps_filter = match chosen.as_str() {
            "video/x-h264" => format!(
                "video/x-h264,width={},height={},framerate={}/1",
                config.width, config.height, config.framerate
            ),
            "image/jpeg" => format!(
                "image/jpeg,width={},height={},framerate={}/1",
                config.width, config.height, config.framerate
            ),
            _ => format!(
                "video/x-raw,width={},height={},framerate={}/1",
                config.width, config.height, config.framerate
            ),
        };

        let element = ElementSpec::new("source", "v4l2src")
            .prop("device", PropValue::Str(device.to_string()))
            // Never let a slow consumer back-pressure the sensor.
            .prop("io-mode", PropValue::Enum("mmap".into()));

        Ok(SourceElements {
            element,
            caps_filter: Some(caps_filter),
            post_elements: vec![ElementSpec::new("source_queue", "queue")
                .prop("max-size-buffers", PropValue::U32(3))
                .prop("leaky", PropValue::Enum("downstream".into()))],
            output_format: chosen,
        })
    }
}

// ── Probing helpers ─────────────────────────────────────────────────

fn video_nodes() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/dev") else {
        return Vec::new();
    };
    let mut nodes: Vec<String> = entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.starts_with("video").then(|| format!("/dev/{name}"))
        })
        .collect();
    nodes.sort();
    nodes
}

fn run_v4l2(device: &str, flag: &str) -> Option<String> {
    let out = Command::new("v4l2-ctl")
        .args(["--device", device, flag])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&out.stdout).to_string())
}

fn probe_identity(device: &str) -> Option<(SourceIdentity, bool)> {
    let out = run_v4l2(device, "--info")?;
    Some(parse_device_info(&out))
}

/// Parse `v4l2-ctl --info` output into an identity plus whether the node
/// is a capture device at all (encoders and ISPs also appear as video
/// nodes).
pub(crate) fn parse_device_info(output: &str) -> (SourceIdentity, bool) {
    let mut identity = SourceIdentity::default();
    let mut is_capture = false;

    for line in output.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let value = value.trim();
            match key.trim() {
                "Card type" => identity.card_name = value.to_string(),
                "Driver name" => identity.driver = value.to_string(),
                "Bus info" => identity.bus_info = value.to_string(),
                _ => {}
            }
        }
        if line.contains("Video Capture") {
            is_capture = true;
        }
    }

    (identity, is_capture)
}

/// Parse `v4l2-ctl --list-formats-ext` into format names plus a
/// per-resolution framerate map.
pub(crate) fn parse_formats_ext(output: &str) -> (Vec<String>, BTreeMap<String, Vec<u32>>) {
    let mut formats = Vec::new();
    let mut framerates: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    let mut current_resolution: Option<String> = None;

    for line in output.lines() {
        if line.contains('\'') {
            if let Some(c) = FORMAT_RE.captures(line) {
                let fmt = c[1].to_string();
                if !formats.contains(&fmt) {
                    formats.push(fmt);
                }
            }
        }

        if line.contains("Size: Discrete") {
            if let Some(c) = SIZE_RE.captures(line) {
                let key = format!("{}x{}", &c[1], &c[2]);
                framerates.entry(key.clone()).or_default();
                current_resolution = Some(key);
            }
        }

        if line.contains("Interval: Discrete") {
            if let (Some(res), Some(c)) = (&current_resolution, FPS_RE.captures(line)) {
                if let Ok(fps) = c[1].parse::<f64>() {
                    let fps = fps as u32;
                    let list = framerates.entry(res.clone()).or_default();
                    if !list.contains(&fps) {
                        list.push(fps);
                    }
                }
            }
        }
    }

    for list in framerates.values_mut() {
        list.sort_by_key(|f| std::cmp::Reverse(*f));
    }

    (formats, framerates)
}

pub(crate) fn parse_resolution_key(key: &String) -> Option<(u32, u32)> {
    let (w, h) = key.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}
