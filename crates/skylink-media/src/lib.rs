//! Video pipeline orchestration for the Skylink companion computer.
//!
//! A [`registry::ProviderRegistry`] holds pluggable video sources and
//! encoders; the [`pipeline::StreamingPipeline`] composes a
//! source → decode → encode → payload → sink graph from them, drives its
//! lifecycle, and mutates whitelisted encoder parameters live. The media
//! graph runs on GStreamer's own threads; this crate's async surface talks
//! to it only through thread-safe handles and atomic counters.

pub mod encoder;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod sink;
pub mod source;
pub mod stats;

pub use error::MediaError;
