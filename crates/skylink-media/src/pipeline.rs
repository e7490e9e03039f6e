//! Streaming pipeline — the finite state machine that owns the media graph.
//!
//! ```text
//! Idle ──build()──► Building ──ok──► Playing ⇄ Paused
//!   ▲                  │             │
//!   └──────stop()──────┴─err─► Failed ─stop()─► Idle
//! ```
//!
//! The graph itself runs on GStreamer's streaming threads plus a dedicated
//! bus thread; the async surface here only ever touches it through
//! thread-safe element handles and atomic counters. All build/stop/live
//! operations are serialized by one mutex, so concurrent callers see a
//! strict ordering of transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gst::prelude::*;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};

use skylink_common::config::{SinkMode, StreamingConfig, VideoConfig};

use crate::encoder::{ElementSpec, PropValue, VideoEncoderProvider};
use crate::error::MediaError;
use crate::registry::ProviderRegistry;
use crate::sink;
use crate::source::SourceElements;
use crate::stats::{classify_health, RateTracker, StreamCounters, StreamStats};

// ── Spec & state ────────────────────────────────────────────────────

/// Immutable description of one stream attempt.
///
/// A spec that passes [`StreamingPipeline::validate`] must, if the
/// underlying OS state is unchanged, produce a graph that reaches Playing.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSpec {
    /// Device path or source provider id ("test").
    pub source_id: String,
    pub codec_id: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate_kbps: u32,
    pub quality: u32,
    pub gop_size: u32,
    /// Forces the source media type when set ("image/jpeg", ...).
    pub source_format_hint: Option<String>,
    pub sink: StreamingConfig,
}

impl PipelineSpec {
    pub fn from_configs(video: &VideoConfig, streaming: &StreamingConfig) -> Self {
        let video = video.clone().sanitized();
        PipelineSpec {
            source_id: if video.device.is_empty() {
                "test".into()
            } else {
                video.device.clone()
            },
            codec_id: video.codec.clone(),
            width: video.width,
            height: video.height,
            framerate: video.framerate,
            bitrate_kbps: video.bitrate_kbps,
            quality: video.quality,
            gop_size: video.gop_size,
            source_format_hint: None,
            sink: streaming.clone(),
        }
    }

    fn video_config(&self) -> VideoConfig {
        VideoConfig {
            device: self.source_id.clone(),
            width: self.width,
            height: self.height,
            framerate: self.framerate,
            codec: self.codec_id.clone(),
            quality: self.quality,
            bitrate_kbps: self.bitrate_kbps,
            gop_size: self.gop_size,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Building,
    Playing,
    Paused,
    Terminating,
    Failed,
}

/// Status snapshot for broadcast. A pure read: no side effects beyond
/// folding a pending bus failure into the visible state.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub state: PipelineState,
    pub streaming: bool,
    pub spec: Option<PipelineSpec>,
    pub encoder_provider: Option<String>,
    pub source_provider: Option<String>,
    /// Set when codec adaptation replaced the requested encoder.
    pub codec_adapted_from: Option<String>,
    pub stats: StreamStats,
    pub last_error: Option<String>,
    pub rtsp_clients: Option<usize>,
}

// ── Internals ───────────────────────────────────────────────────────

struct Graph {
    pipeline: gst::Pipeline,
    bus_stop: Arc<AtomicBool>,
    bus_thread: Option<std::thread::JoinHandle<()>>,
}

struct RateTask {
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

struct Inner {
    state: PipelineState,
    spec: Option<PipelineSpec>,
    graph: Option<Graph>,
    rtsp: Option<sink::RtspStream>,
    encoder_provider: Option<Arc<dyn VideoEncoderProvider>>,
    encoder_name: Option<String>,
    source_name: Option<String>,
    adapted_from: Option<String>,
    started_at: Option<Instant>,
    rate_task: Option<RateTask>,
}

/// The pipeline orchestrator (C6).
pub struct StreamingPipeline {
    registry: Arc<ProviderRegistry>,
    /// Encoder ids the detected board declares; empty = no board filter.
    board_encoders: Vec<String>,
    inner: Mutex<Inner>,
    counters: Arc<StreamCounters>,
    rates: Arc<StdMutex<RateTracker>>,
    /// Set by the bus thread on a fatal element error.
    failed: Arc<AtomicBool>,
    last_error: Arc<StdMutex<Option<String>>>,
    webrtc_rx: StdMutex<Option<mpsc::Receiver<Bytes>>>,
}

impl StreamingPipeline {
    pub fn new(registry: Arc<ProviderRegistry>) -> Arc<Self> {
        Self::with_board_encoders(registry, Vec::new())
    }

    /// Constrain codec adaptation to the board's declared encoder set.
    pub fn with_board_encoders(registry: Arc<ProviderRegistry>, board_encoders: Vec<String>) -> Arc<Self> {
        Arc::new(StreamingPipeline {
            registry,
            board_encoders,
            inner: Mutex::new(Inner {
                state: PipelineState::Idle,
                spec: None,
                graph: None,
                rtsp: None,
                encoder_provider: None,
                encoder_name: None,
                source_name: None,
                adapted_from: None,
                started_at: None,
                rate_task: None,
            }),
            counters: Arc::new(StreamCounters::default()),
            rates: Arc::new(StdMutex::new(RateTracker::default())),
            failed: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(StdMutex::new(None)),
            webrtc_rx: StdMutex::new(None),
        })
    }

    // ─── Validation ─────────────────────────────────────────────────

    /// Check a spec against provider capabilities without touching the
    /// graph. Warnings are logged; errors reject.
    pub async fn validate(&self, spec: &PipelineSpec) -> Result<(), MediaError> {
        let adapted = self.registry.adapt_codec(&spec.codec_id, &self.board_encoders);
        let encoder = self.registry.encoder(&adapted.codec_id).ok_or_else(|| {
            MediaError::NoProviderAvailable {
                family: "video_encoder",
                id: adapted.codec_id.clone(),
            }
        })?;

        let report = encoder.validate(&spec.video_config());
        for warning in &report.warnings {
            tracing::warn!(codec = %adapted.codec_id, "{warning}");
        }
        if let Some(err) = report.into_error() {
            return Err(err);
        }
        Ok(())
    }

    // ─── Build ──────────────────────────────────────────────────────

    /// Assemble and start the graph for `spec`.
    pub async fn build(self: &Arc<Self>, spec: PipelineSpec) -> Result<(), MediaError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            PipelineState::Idle | PipelineState::Failed => {}
            other => {
                return Err(MediaError::InvalidTransition(format!(
                    "cannot build from {other:?}"
                )))
            }
        }
        inner.state = PipelineState::Building;
        self.failed.store(false, Ordering::SeqCst);
        *self.last_error.lock().unwrap() = None;

        match self.build_locked(&mut inner, spec).await {
            Ok(()) => {
                inner.state = PipelineState::Playing;
                inner.started_at = Some(Instant::now());
                self.counters.reset();
                self.rates.lock().unwrap().reset();
                self.spawn_rate_task(&mut inner);
                tracing::info!("pipeline playing");
                Ok(())
            }
            Err(e) => {
                *self.last_error.lock().unwrap() = Some(e.to_string());
                self.teardown_locked(&mut inner).await;
                inner.state = PipelineState::Failed;
                tracing::error!(error = %e, "pipeline build failed");
                Err(e)
            }
        }
    }

    async fn build_locked(&self, inner: &mut Inner, spec: PipelineSpec) -> Result<(), MediaError> {
        gst::init().map_err(|e| MediaError::Unavailable(format!("gstreamer init: {e}")))?;

        let video_cfg = spec.video_config();

        // 1. Resolve the source provider: provider id match first, then
        //    whoever enumerates the device, then plain v4l2.
        let source_provider = self
            .registry
            .source(&spec.source_id)
            .or_else(|| self.registry.source_for_device(&spec.source_id))
            .ok_or_else(|| MediaError::NoProviderAvailable {
                family: "video_source",
                id: spec.source_id.clone(),
            })?;

        // 2. Source head elements.
        let source_elements = source_provider.build_source(
            &spec.source_id,
            &video_cfg,
            spec.source_format_hint.as_deref(),
        )?;

        // 3. Codec adaptation, then the encoder provider.
        let adapted = self.registry.adapt_codec(&spec.codec_id, &self.board_encoders);
        let encoder_provider = self.registry.encoder(&adapted.codec_id).ok_or_else(|| {
            MediaError::NoProviderAvailable {
                family: "video_encoder",
                id: adapted.codec_id.clone(),
            }
        })?;

        let report = encoder_provider.validate(&video_cfg);
        for warning in &report.warnings {
            tracing::warn!(codec = %adapted.codec_id, "{warning}");
        }
        if let Some(err) = report.into_error() {
            return Err(err);
        }

        // 4. Encoder chain + payloader description.
        let chain = encoder_provider.build_chain(&video_cfg, &source_elements.output_format)?;

        inner.spec = Some(spec.clone());
        inner.encoder_provider = Some(encoder_provider.clone());
        inner.encoder_name = Some(encoder_provider.display_name().to_string());
        inner.source_name = Some(source_provider.display_name().to_string());
        inner.adapted_from = adapted.adapted_from.clone();

        // 5–8. Materialize. RTSP serves the same description through a
        // media factory instead of a live graph.
        if spec.sink.mode == SinkMode::Rtsp {
            let launch = launch_description(&source_elements, &chain);
            tracing::info!(launch = %launch, "starting RTSP pipeline");
            let rtsp = sink::RtspStream::start(&launch, &spec.sink)?;
            inner.rtsp = Some(rtsp);
            return Ok(());
        }

        let pipeline = gst::Pipeline::builder()
            .name(format!("skylink-{}", adapted.codec_id))
            .build();

        // Main path: source → caps → post → chain → payloader → sink.
        let mut elements: Vec<gst::Element> = Vec::new();
        elements.push(materialize(&source_elements.element)?);

        if let Some(caps) = &source_elements.caps_filter {
            let filter = gst::ElementFactory::make("capsfilter")
                .name("source_caps")
                .build()
                .map_err(|_| MediaError::ElementCreate("capsfilter".into()))?;
            let caps = caps
                .parse::<gst::Caps>()
                .map_err(|_| MediaError::Unavailable(format!("bad caps: {caps}")))?;
            filter.set_property("caps", &caps);
            elements.push(filter);
        }

        for spec_el in &source_elements.post_elements {
            elements.push(materialize(spec_el)?);
        }
        for spec_el in &chain.elements {
            elements.push(materialize(spec_el)?);
        }

        // WebRTC inserts its tee between encoder chain and payloader.
        let webrtc = if spec.sink.mode == SinkMode::Webrtc {
            let (branch, rx) = sink::build_webrtc_branch()?;
            *self.webrtc_rx.lock().unwrap() = Some(rx);
            elements.push(branch.tee.clone());
            elements.push(branch.stream_queue.clone());
            Some(branch)
        } else {
            None
        };

        let payloader = {
            let spec_el = ElementSpec {
                name: "rtppay".into(),
                element: chain.payloader.clone(),
                properties: chain.payloader_properties.clone(),
            };
            materialize(&spec_el)?
        };
        elements.push(payloader);

        let leaf: gst::Element = match spec.sink.mode {
            SinkMode::Udp => sink::build_udp_sink(&spec.sink)?,
            SinkMode::Multicast => sink::build_multicast_sink(&spec.sink)?,
            SinkMode::Webrtc => webrtc.as_ref().unwrap().fakesink.clone(),
            SinkMode::Rtsp => unreachable!("rtsp handled above"),
        };
        elements.push(leaf);

        pipeline
            .add_many(&elements)
            .map_err(|_| MediaError::Unavailable("failed to add elements".into()))?;

        // 6. Link in order; a failure fails the build.
        for pair in elements.windows(2) {
            pair[0].link(&pair[1]).map_err(|_| MediaError::Link {
                from: pair[0].name().to_string(),
                to: pair[1].name().to_string(),
            })?;
        }

        // The appsink leg of the WebRTC tee.
        if let Some(branch) = &webrtc {
            pipeline
                .add_many([&branch.sample_queue, branch.appsink.upcast_ref()])
                .map_err(|_| MediaError::Unavailable("failed to add webrtc branch".into()))?;
            branch
                .tee
                .link(&branch.sample_queue)
                .and_then(|_| branch.sample_queue.link(branch.appsink.upcast_ref::<gst::Element>()))
                .map_err(|_| MediaError::Link {
                    from: "webrtc_tee".into(),
                    to: "webrtc_appsink".into(),
                })?;
        }

        // 7. Stage probes: access units at the encoder output, bytes at
        // the sink input (payloader output when the sink is opaque).
        self.attach_probes(&pipeline, &chain.elements);

        // 8. Bus watch on its own OS thread.
        let bus_stop = Arc::new(AtomicBool::new(false));
        let bus_thread = self.spawn_bus_thread(&pipeline, bus_stop.clone());

        pipeline.set_state(gst::State::Playing).map_err(|e| {
            bus_stop.store(true, Ordering::SeqCst);
            MediaError::StateChange(format!("refused to reach Playing: {e}"))
        })?;

        inner.graph = Some(Graph {
            pipeline,
            bus_stop,
            bus_thread: Some(bus_thread),
        });
        Ok(())
    }

    fn attach_probes(&self, pipeline: &gst::Pipeline, chain: &[ElementSpec]) {
        // Frame probe: the encoder's src pad, or the last chain element
        // for passthrough chains without an "encoder" node.
        let frame_element = if pipeline.by_name("encoder").is_some() {
            "encoder".to_string()
        } else {
            chain.last().map(|e| e.name.clone()).unwrap_or_default()
        };

        if let Some(pad) = pipeline
            .by_name(&frame_element)
            .and_then(|e| e.static_pad("src"))
        {
            let counters = self.counters.clone();
            pad.add_probe(
                gst::PadProbeType::BUFFER | gst::PadProbeType::BUFFER_LIST,
                move |_pad, info| {
                    match &info.data {
                        Some(gst::PadProbeData::Buffer(_)) => counters.add_frames(1),
                        Some(gst::PadProbeData::BufferList(list)) => {
                            counters.add_frames(list.len() as u64)
                        }
                        _ => {}
                    }
                    gst::PadProbeReturn::Ok
                },
            );
        }

        let byte_pad = pipeline
            .by_name("sink")
            .and_then(|e| e.static_pad("sink"))
            .or_else(|| pipeline.by_name("rtppay").and_then(|e| e.static_pad("src")));

        if let Some(pad) = byte_pad {
            let counters = self.counters.clone();
            pad.add_probe(
                gst::PadProbeType::BUFFER | gst::PadProbeType::BUFFER_LIST,
                move |_pad, info| {
                    match &info.data {
                        Some(gst::PadProbeData::Buffer(buffer)) => {
                            counters.add_bytes(buffer.size() as u64)
                        }
                        Some(gst::PadProbeData::BufferList(list)) => {
                            let total: usize = list.iter().map(|b| b.size()).sum();
                            counters.add_bytes(total as u64);
                        }
                        _ => {}
                    }
                    gst::PadProbeReturn::Ok
                },
            );
        }
    }

    fn spawn_bus_thread(
        &self,
        pipeline: &gst::Pipeline,
        stop: Arc<AtomicBool>,
    ) -> std::thread::JoinHandle<()> {
        let bus = pipeline.bus().expect("pipeline always has a bus");
        let pipeline = pipeline.clone();
        let counters = self.counters.clone();
        let failed = self.failed.clone();
        let last_error = self.last_error.clone();

        std::thread::Builder::new()
            .name("gst-bus".into())
            .spawn(move || {
                use gst::MessageView;
                while !stop.load(Ordering::SeqCst) {
                    let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) else {
                        continue;
                    };
                    match msg.view() {
                        MessageView::Error(err) => {
                            let text = err.error().to_string();
                            tracing::error!(
                                source = ?err.src().map(|s| s.path_string()),
                                debug = ?err.debug(),
                                "gstreamer error: {text}"
                            );
                            counters.add_error();
                            *last_error.lock().unwrap() = Some(text);
                            failed.store(true, Ordering::SeqCst);
                            // Tear the graph down so a broken encoder
                            // cannot leak device handles.
                            let _ = pipeline.set_state(gst::State::Null);
                            break;
                        }
                        MessageView::Warning(warn) => {
                            tracing::warn!(
                                source = ?warn.src().map(|s| s.path_string()),
                                "gstreamer warning: {}",
                                warn.error()
                            );
                        }
                        MessageView::Eos(_) => {
                            tracing::info!("end of stream");
                            failed.store(true, Ordering::SeqCst);
                            let _ = pipeline.set_state(gst::State::Null);
                            break;
                        }
                        _ => {}
                    }
                }
            })
            .expect("bus thread spawn")
    }

    fn spawn_rate_task(self: &Arc<Self>, inner: &mut Inner) {
        let (tx, mut rx) = watch::channel(false);
        let pipeline = self.clone();
        let rtsp_clients = inner.rtsp.as_ref().map(|r| r.client_counter());
        let (framerate, bitrate_kbps) = inner
            .spec
            .as_ref()
            .map(|s| (s.framerate, s.bitrate_kbps))
            .unwrap_or((30, 3000));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            let mut had_clients = false;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = rx.changed() => break,
                }

                match &rtsp_clients {
                    Some(clients) => {
                        // RTSP only emits bytes while a client is
                        // connected: estimate from configured rates, and
                        // zero everything when the last client leaves.
                        let connected = clients.load(Ordering::SeqCst) > 0;
                        if connected {
                            pipeline.counters.add_frames(framerate as u64);
                            pipeline.counters.add_bytes(bitrate_kbps as u64 * 1000 / 8);
                            let mut rates = pipeline.rates.lock().unwrap();
                            rates.fps = framerate as f64;
                            rates.kbps = bitrate_kbps as f64;
                        } else if had_clients {
                            pipeline.counters.reset();
                            pipeline.rates.lock().unwrap().reset();
                        }
                        had_clients = connected;
                    }
                    None => {
                        let (frames, bytes, _) = pipeline.counters.snapshot();
                        pipeline
                            .rates
                            .lock()
                            .unwrap()
                            .sample(Instant::now(), frames, bytes);
                    }
                }
            }
        });

        inner.rate_task = Some(RateTask {
            shutdown: tx,
            handle,
        });
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Tear the graph down. The unique release point for every media
    /// resource; runs on all exit paths including Failed.
    pub async fn stop(&self) -> Result<(), MediaError> {
        let mut inner = self.inner.lock().await;
        if inner.state == PipelineState::Idle {
            return Ok(());
        }
        inner.state = PipelineState::Terminating;
        self.teardown_locked(&mut inner).await;
        inner.state = PipelineState::Idle;
        inner.started_at = None;
        tracing::info!("pipeline stopped");
        Ok(())
    }

    async fn teardown_locked(&self, inner: &mut Inner) {
        if let Some(task) = inner.rate_task.take() {
            let _ = task.shutdown.send(true);
            let _ = task.handle.await;
        }

        if let Some(rtsp) = inner.rtsp.take() {
            rtsp.shutdown();
        }

        if let Some(mut graph) = inner.graph.take() {
            graph.bus_stop.store(true, Ordering::SeqCst);
            let _ = graph.pipeline.set_state(gst::State::Null);
            if let Some(thread) = graph.bus_thread.take() {
                let _ = tokio::task::spawn_blocking(move || {
                    let _ = thread.join();
                })
                .await;
            }
        }

        *self.webrtc_rx.lock().unwrap() = None;
    }

    pub async fn pause(&self) -> Result<(), MediaError> {
        let mut inner = self.inner.lock().await;
        if inner.state != PipelineState::Playing {
            return Err(MediaError::InvalidTransition(format!(
                "cannot pause from {:?}",
                inner.state
            )));
        }
        if let Some(graph) = &inner.graph {
            graph
                .pipeline
                .set_state(gst::State::Paused)
                .map_err(|e| MediaError::StateChange(e.to_string()))?;
        }
        inner.state = PipelineState::Paused;
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), MediaError> {
        let mut inner = self.inner.lock().await;
        if inner.state != PipelineState::Paused {
            return Err(MediaError::InvalidTransition(format!(
                "cannot resume from {:?}",
                inner.state
            )));
        }
        if let Some(graph) = &inner.graph {
            graph
                .pipeline
                .set_state(gst::State::Playing)
                .map_err(|e| MediaError::StateChange(e.to_string()))?;
        }
        inner.state = PipelineState::Playing;
        Ok(())
    }

    // ─── Live mutation ──────────────────────────────────────────────

    /// Change a whitelisted encoder property on the live graph. The value
    /// arrives in canonical units (kbps, frames), is clamped to the
    /// provider's declared range, converted, and applied. Returns the
    /// clamped canonical value.
    pub async fn update_live_property(&self, name: &str, value: i64) -> Result<i64, MediaError> {
        let inner = self.inner.lock().await;
        if inner.state != PipelineState::Playing {
            return Err(MediaError::NotStreaming);
        }
        let provider = inner
            .encoder_provider
            .as_ref()
            .ok_or(MediaError::NotStreaming)?;

        let properties = provider.live_properties();
        let Some(prop) = properties.get(name) else {
            let mut allowed: Vec<String> = properties.keys().cloned().collect();
            allowed.sort();
            return Err(MediaError::NotLiveAdjustable {
                name: name.to_string(),
                allowed,
            });
        };

        let graph = inner.graph.as_ref().ok_or(MediaError::NotStreaming)?;
        let element = graph
            .pipeline
            .by_name(prop.element)
            .ok_or_else(|| MediaError::ElementCreate(prop.element.to_string()))?;

        let clamped = prop.clamp(value);

        match prop.rendered(clamped) {
            Some(rendered) => {
                // Composite structure write (V4L2 M2M extra-controls).
                let structure = rendered
                    .parse::<gst::Structure>()
                    .map_err(|_| MediaError::Unavailable(format!("bad structure: {rendered}")))?;
                element.set_property(prop.property, &structure);
            }
            None => {
                // String conversion handles u32/i32/i64 properties alike.
                element.set_property_from_str(prop.property, &prop.scaled(clamped).to_string());
            }
        }

        tracing::info!(
            property = name,
            value = clamped,
            element = prop.element,
            "live property updated"
        );
        Ok(clamped)
    }

    /// Ask the encoder for an IDR as soon as possible.
    pub async fn force_keyframe(&self) -> Result<(), MediaError> {
        let inner = self.inner.lock().await;
        let graph = inner.graph.as_ref().ok_or(MediaError::NotStreaming)?;

        let event = gst::event::CustomUpstream::builder(
            gst::Structure::builder("GstForceKeyUnit")
                .field("all-headers", true)
                .build(),
        )
        .build();

        let sent = graph
            .pipeline
            .by_name("sink")
            .map(|sink| sink.send_event(event))
            .unwrap_or(false);
        if !sent {
            tracing::warn!("force-keyunit event not handled");
        }
        Ok(())
    }

    /// Access-unit stream for the WebRTC bridge. Yielded once per build.
    pub fn take_webrtc_samples(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.webrtc_rx.lock().unwrap().take()
    }

    // ─── Introspection ──────────────────────────────────────────────

    pub async fn get_status(&self) -> StreamStatus {
        let mut inner = self.inner.lock().await;

        // Fold a bus-thread failure into the FSM.
        if self.failed.load(Ordering::SeqCst)
            && matches!(inner.state, PipelineState::Playing | PipelineState::Paused)
        {
            inner.state = PipelineState::Failed;
        }

        let (frames, bytes, errors) = self.counters.snapshot();
        let (fps, kbps) = {
            let rates = self.rates.lock().unwrap();
            (rates.fps, rates.kbps)
        };
        let target_fps = inner.spec.as_ref().map(|s| s.framerate).unwrap_or(0);
        let streaming = inner.state == PipelineState::Playing;

        StreamStatus {
            state: inner.state,
            streaming,
            spec: inner.spec.clone(),
            encoder_provider: inner.encoder_name.clone(),
            source_provider: inner.source_name.clone(),
            codec_adapted_from: inner.adapted_from.clone(),
            stats: StreamStats {
                frames_sent: frames,
                bytes_sent: bytes,
                errors,
                current_fps: fps,
                current_kbps: kbps,
                uptime_s: inner
                    .started_at
                    .filter(|_| streaming)
                    .map(|t| t.elapsed().as_secs()),
                health: classify_health(errors, fps, target_fps),
            },
            last_error: self.last_error.lock().unwrap().clone(),
            rtsp_clients: inner.rtsp.as_ref().map(|r| r.clients()),
        }
    }

    pub async fn state(&self) -> PipelineState {
        self.inner.lock().await.state
    }
}

// ── Element materialization ─────────────────────────────────────────

fn materialize(spec: &ElementSpec) -> Result<gst::Element, MediaError> {
    let element = gst::ElementFactory::make(&spec.element)
        .name(spec.name.as_str())
        .build()
        .map_err(|_| MediaError::ElementCreate(spec.element.clone()))?;

    for (key, value) in &spec.properties {
        match value {
            PropValue::Str(v) => element.set_property(key, v),
            PropValue::I32(v) => element.set_property(key, v),
            PropValue::U32(v) => element.set_property(key, v),
            PropValue::I64(v) => element.set_property(key, v),
            PropValue::U64(v) => element.set_property(key, v),
            PropValue::Bool(v) => element.set_property(key, v),
            PropValue::Caps(v) => {
                let caps = v
                    .parse::<gst::Caps>()
                    .map_err(|_| MediaError::Unavailable(format!("bad caps: {v}")))?;
                element.set_property(key, &caps);
            }
            PropValue::Structure(v) => {
                let structure = v
                    .parse::<gst::Structure>()
                    .map_err(|_| MediaError::Unavailable(format!("bad structure: {v}")))?;
                element.set_property(key, &structure);
            }
            PropValue::Enum(v) => element.set_property_from_str(key, v),
        }
    }
    Ok(element)
}

/// Serialize the source head + encoder chain into a gst-launch description
/// for the RTSP media factory.
fn launch_description(source: &SourceElements, chain: &crate::encoder::EncoderChain) -> String {
    let mut fragments = vec![source.element.launch_fragment()];
    if let Some(caps) = &source.caps_filter {
        fragments.push(caps.clone());
    }
    for el in &source.post_elements {
        fragments.push(el.launch_fragment());
    }
    for el in &chain.elements {
        fragments.push(el.launch_fragment());
    }
    let payloader = ElementSpec {
        // The RTSP server convention: payloader named pay0 is stream 0.
        name: "pay0".into(),
        element: chain.payloader.clone(),
        properties: chain.payloader_properties.clone(),
    };
    fragments.push(payloader.launch_fragment());
    fragments.join(" ! ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncoderChain;

    fn spec() -> PipelineSpec {
        PipelineSpec::from_configs(
            &VideoConfig {
                device: String::new(),
                codec: "h264".into(),
                ..Default::default()
            },
            &StreamingConfig::default(),
        )
    }

    // ─── Spec construction ──────────────────────────────────────────────

    #[test]
    fn empty_device_means_test_source() {
        let s = spec();
        assert_eq!(s.source_id, "test");
        assert_eq!(s.codec_id, "h264");
    }

    #[test]
    fn spec_is_sanitized() {
        let s = PipelineSpec::from_configs(
            &VideoConfig {
                framerate: 10_000,
                ..Default::default()
            },
            &StreamingConfig::default(),
        );
        assert_eq!(s.framerate, 120);
    }

    // ─── Launch description ─────────────────────────────────────────────

    #[test]
    fn launch_description_orders_stages() {
        let source = SourceElements {
            element: crate::encoder::ElementSpec::new("source", "videotestsrc"),
            caps_filter: Some("video/x-raw,width=1280,height=720,framerate=30/1".into()),
            post_elements: vec![crate::encoder::ElementSpec::new("source_queue", "queue")],
            output_format: "video/x-raw".into(),
        };
        let chain = EncoderChain {
            elements: vec![crate::encoder::ElementSpec::new("encoder", "x264enc")
                .prop("bitrate", PropValue::U32(3000))],
            payloader: "rtph264pay".into(),
            payloader_properties: vec![("pt".into(), PropValue::U32(96))],
        };

        let launch = launch_description(&source, &chain);
        assert_eq!(
            launch,
            "videotestsrc name=source ! video/x-raw,width=1280,height=720,framerate=30/1 ! \
             queue name=source_queue ! x264enc name=encoder bitrate=3000 ! \
             rtph264pay name=pay0 pt=96"
        );
    }

    // ─── FSM guards (no GStreamer needed) ───────────────────────────────

    #[tokio::test]
    async fn initial_state_is_idle() {
        let registry = Arc::new(ProviderRegistry::new());
        let pipeline = StreamingPipeline::new(registry);
        assert_eq!(pipeline.state().await, PipelineState::Idle);
    }

    #[tokio::test]
    async fn stop_from_idle_is_noop() {
        let registry = Arc::new(ProviderRegistry::new());
        let pipeline = StreamingPipeline::new(registry);
        assert!(pipeline.stop().await.is_ok());
        assert_eq!(pipeline.state().await, PipelineState::Idle);
    }

    #[tokio::test]
    async fn pause_from_idle_is_rejected() {
        let registry = Arc::new(ProviderRegistry::new());
        let pipeline = StreamingPipeline::new(registry);
        assert!(matches!(
            pipeline.pause().await,
            Err(MediaError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn live_update_without_graph_is_not_streaming() {
        let registry = Arc::new(ProviderRegistry::new());
        let pipeline = StreamingPipeline::new(registry);
        assert!(matches!(
            pipeline.update_live_property("bitrate", 4000).await,
            Err(MediaError::NotStreaming)
        ));
    }

    #[tokio::test]
    async fn validate_unknown_codec_fails_typed() {
        let registry = Arc::new(ProviderRegistry::new());
        let pipeline = StreamingPipeline::new(registry);
        // Empty registry: adaptation lands on mjpeg, which is missing too.
        let err = pipeline.validate(&spec()).await.unwrap_err();
        assert!(matches!(err, MediaError::NoProviderAvailable { .. }));
    }

    #[tokio::test]
    async fn status_snapshot_shape() {
        let registry = Arc::new(ProviderRegistry::new());
        let pipeline = StreamingPipeline::new(registry);
        let status = pipeline.get_status().await;
        assert_eq!(status.state, PipelineState::Idle);
        assert!(!status.streaming);
        assert!(status.spec.is_none());
        assert_eq!(status.stats.frames_sent, 0);
        assert!(status.last_error.is_none());
    }
}
