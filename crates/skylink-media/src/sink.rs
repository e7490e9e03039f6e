//! Sink construction per streaming mode.
//!
//! UDP and multicast are plain leaf elements. WebRTC terminates the graph
//! in a fakesink while a tee hands encoded access units to an in-process
//! queue for the (out-of-core) WebRTC bridge. RTSP wraps a
//! `gst_rtsp_server` instance serving the provider-derived launch
//! description on a mount point, with client counting for the stats
//! estimator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use gst::prelude::*;
use gst_rtsp_server::prelude::*;
use tokio::sync::mpsc;

use skylink_common::config::StreamingConfig;

use crate::error::MediaError;

/// Queue depth for encoded access units headed to the WebRTC bridge.
/// Late consumers lose frames, they never stall the encoder.
const WEBRTC_QUEUE_DEPTH: usize = 32;

fn make(element: &str, name: &str) -> Result<gst::Element, MediaError> {
    gst::ElementFactory::make(element)
        .name(name)
        .build()
        .map_err(|_| MediaError::ElementCreate(element.to_string()))
}

/// UDP unicast leaf.
pub fn build_udp_sink(cfg: &StreamingConfig) -> Result<gst::Element, MediaError> {
    let sink = make("udpsink", "sink")?;
    sink.set_property("host", &cfg.udp_host);
    sink.set_property("port", cfg.udp_port as i32);
    sink.set_property("sync", false);
    sink.set_property("async", false);
    Ok(sink)
}

/// UDP multicast leaf.
pub fn build_multicast_sink(cfg: &StreamingConfig) -> Result<gst::Element, MediaError> {
    let sink = make("udpsink", "sink")?;
    sink.set_property("host", &cfg.multicast_group);
    sink.set_property("port", cfg.multicast_port as i32);
    sink.set_property("auto-multicast", true);
    sink.set_property("ttl", cfg.multicast_ttl as i32);
    sink.set_property("sync", false);
    sink.set_property("async", false);
    Ok(sink)
}

/// WebRTC branch: `tee` fan-out, one leg to the payloader/fakesink path,
/// one leg into an appsink that forwards access units to the bridge.
pub struct WebRtcBranch {
    pub tee: gst::Element,
    pub stream_queue: gst::Element,
    pub sample_queue: gst::Element,
    pub appsink: gst_app::AppSink,
    pub fakesink: gst::Element,
}

/// Build the WebRTC elements and the channel the bridge consumes.
pub fn build_webrtc_branch() -> Result<(WebRtcBranch, mpsc::Receiver<Bytes>), MediaError> {
    let (tx, rx) = mpsc::channel::<Bytes>(WEBRTC_QUEUE_DEPTH);

    let tee = make("tee", "webrtc_tee")?;
    tee.set_property("allow-not-linked", true);

    let stream_queue = make("queue", "webrtc_stream_queue")?;
    let sample_queue = make("queue", "webrtc_sample_queue")?;
    sample_queue.set_property("max-size-buffers", 4u32);
    sample_queue.set_property_from_str("leaky", "downstream");

    let fakesink = make("fakesink", "sink")?;
    fakesink.set_property("sync", false);
    fakesink.set_property("async", false);

    let appsink = gst_app::AppSink::builder()
        .name("webrtc_appsink")
        .sync(false)
        .max_buffers(4)
        .drop(true)
        .build();

    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                // try_send: a slow bridge drops frames, it never blocks
                // the streaming thread.
                let _ = tx.try_send(Bytes::copy_from_slice(map.as_slice()));
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );

    Ok((
        WebRtcBranch {
            tee,
            stream_queue,
            sample_queue,
            appsink,
            fakesink,
        },
        rx,
    ))
}

// ── RTSP ────────────────────────────────────────────────────────────

/// RTSP server serving one mount point from a launch description.
///
/// The media only flows while a client is connected; `clients()` feeds the
/// pipeline's estimation-mode statistics.
pub struct RtspStream {
    server: gst_rtsp_server::RTSPServer,
    source_id: Option<gst::glib::SourceId>,
    main_loop: gst::glib::MainLoop,
    thread: Option<std::thread::JoinHandle<()>>,
    clients: Arc<AtomicUsize>,
    mount: String,
    port: u16,
}

impl RtspStream {
    /// Start serving `launch` (a gst-launch description without the outer
    /// parentheses) on the configured port and mount point.
    pub fn start(launch: &str, cfg: &StreamingConfig) -> Result<Self, MediaError> {
        let clients = Arc::new(AtomicUsize::new(0));

        let server = gst_rtsp_server::RTSPServer::new();
        server.set_service(&cfg.rtsp_port.to_string());

        let factory = gst_rtsp_server::RTSPMediaFactory::new();
        factory.set_launch(&format!("( {launch} )"));
        factory.set_shared(true);

        let counter = clients.clone();
        factory.connect_media_configure(move |_, media| {
            let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::info!(clients = count, "RTSP client connected");
            let counter = counter.clone();
            media.connect_unprepared(move |_| {
                let count = counter.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                tracing::info!(clients = count, "RTSP client disconnected");
            });
        });

        let mounts = server
            .mount_points()
            .ok_or_else(|| MediaError::Unavailable("RTSP server has no mount points".into()))?;
        mounts.add_factory(&cfg.rtsp_mount, factory);

        let source_id = server
            .attach(None)
            .map_err(|e| MediaError::Unavailable(format!("RTSP server attach failed: {e}")))?;

        // The server is serviced by a GLib main loop on its own OS thread.
        let main_loop = gst::glib::MainLoop::new(None, false);
        let loop_clone = main_loop.clone();
        let thread = std::thread::Builder::new()
            .name("rtsp-server".into())
            .spawn(move || loop_clone.run())
            .map_err(|e| MediaError::Unavailable(format!("RTSP thread spawn failed: {e}")))?;

        tracing::info!(port = cfg.rtsp_port, mount = %cfg.rtsp_mount, "RTSP server started");

        Ok(RtspStream {
            server,
            source_id: Some(source_id),
            main_loop,
            thread: Some(thread),
            clients,
            mount: cfg.rtsp_mount.clone(),
            port: cfg.rtsp_port,
        })
    }

    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Shared handle for the stats estimator.
    pub fn client_counter(&self) -> Arc<AtomicUsize> {
        self.clients.clone()
    }

    pub fn url(&self, host: &str) -> String {
        format!("rtsp://{host}:{}{}", self.port, self.mount)
    }

    /// Stop serving and join the server thread.
    pub fn shutdown(mut self) {
        if let Some(id) = self.source_id.take() {
            id.remove();
        }
        // Drop the mount so prepared medias unprepare.
        if let Some(mounts) = self.server.mount_points() {
            mounts.remove_factory(&self.mount);
        }
        self.main_loop.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        tracing::info!("RTSP server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webrtc_queue_is_bounded() {
        // Guard against someone "fixing" the drop behavior into an
        // unbounded queue: depth must stay small.
        assert!(WEBRTC_QUEUE_DEPTH <= 64);
    }
}
