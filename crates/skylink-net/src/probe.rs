//! Latency probe engine — continuous reachability probes to a target set.
//!
//! Each tick pings every target in parallel, appends the results to bounded
//! per-target ring buffers, and derives rolling statistics (mean, jitter,
//! P95, loss) on demand. A probe timeout or parse failure produces a
//! failure sample, not an error — connectivity loss is a first-class
//! observation here.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{watch, Mutex, OnceCell};

use skylink_common::config::ProbeConfig;
use skylink_common::models::{LatencySample, LatencySummary};

use crate::command::{BoxFuture, SystemCommand};
use crate::task::ServiceTask;

/// RTT extractor over ping stdout. Exit status alone is not trusted.
static RTT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"time[=:](\d+(?:\.\d+)?)\s*ms").unwrap());

/// Cached elevation prefix for the ping binary, detected once per process.
///
/// Some boards ship ping without cap_net_raw; there the probe must go
/// through sudo (sudoers entry: NOPASSWD for ping). Empty vec = plain ping.
static PING_PREFIX: OnceCell<Vec<String>> = OnceCell::const_new();

/// Parse an RTT in milliseconds out of ping stdout.
pub fn parse_rtt_ms(output: &str) -> Option<f64> {
    RTT_RE
        .captures(output)
        .and_then(|c| c.get(1).unwrap().as_str().parse().ok())
}

async fn detect_ping_prefix(runner: &dyn SystemCommand) -> Vec<String> {
    let out = runner
        .run("ping", &["-c", "1", "-W", "1", "127.0.0.1"], Duration::from_secs(3))
        .await;
    if out.ok() {
        return Vec::new();
    }
    let stderr = out.stderr.to_lowercase();
    if stderr.contains("permitted") || stderr.contains("capability") || stderr.contains("setuid") {
        tracing::warn!(
            "ping lacks cap_net_raw — using 'sudo ping'; fix permanently with \
             `setcap cap_net_raw+ep /usr/bin/ping`"
        );
        return vec!["sudo".to_string()];
    }
    Vec::new()
}

/// Cross-component view of the probe output, injected into the failover
/// controller so tests can stub it.
pub trait LatencySource: Send + Sync {
    /// Average RTT across targets with at least one successful sample.
    /// `None` means no probes succeeded at all (connectivity loss).
    fn average_rtt_ms<'a>(&'a self) -> BoxFuture<'a, Option<f64>>;
}

// ── Engine ──────────────────────────────────────────────────────────

struct ProbeState {
    history: HashMap<String, VecDeque<LatencySample>>,
}

/// Continuous latency monitor over a configured target set.
pub struct LatencyMonitor {
    config: Mutex<ProbeConfig>,
    state: Mutex<ProbeState>,
    runner: Arc<dyn SystemCommand>,
    task: Mutex<Option<ServiceTask>>,
}

impl LatencyMonitor {
    pub fn new(config: ProbeConfig, runner: Arc<dyn SystemCommand>) -> Arc<Self> {
        let history = config
            .targets
            .iter()
            .map(|t| (t.clone(), VecDeque::with_capacity(config.history_size)))
            .collect();

        Arc::new(LatencyMonitor {
            config: Mutex::new(config),
            state: Mutex::new(ProbeState { history }),
            runner,
            task: Mutex::new(None),
        })
    }

    /// Start the probe loop. A second start while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            tracing::warn!("latency monitor already running");
            return;
        }

        let interval = self.config.lock().await.interval();
        let (tx, mut rx) = watch::channel(false);
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.tick().await,
                    _ = rx.changed() => break,
                }
            }
        });

        *task = Some(ServiceTask::new(tx, handle));
        tracing::info!("latency monitor started");
    }

    /// Stop the probe loop and await its termination. In-flight probe
    /// futures are cancelled and their output discarded.
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.stop().await;
            tracing::info!("latency monitor stopped");
        }
    }

    async fn tick(&self) {
        let (targets, timeout) = {
            let cfg = self.config.lock().await;
            (cfg.targets.clone(), cfg.timeout())
        };

        // One probe per target, in parallel, bounded by |targets|.
        let probes = targets
            .iter()
            .map(|target| self.probe_target(target, None, timeout));
        let results = futures::future::join_all(probes).await;

        let history_size = self.config.lock().await.history_size;
        let mut state = self.state.lock().await;
        for sample in results {
            let buf = state
                .history
                .entry(sample.target.clone())
                .or_insert_with(|| VecDeque::with_capacity(history_size));
            if buf.len() >= history_size {
                buf.pop_front();
            }
            buf.push_back(sample);
        }
    }

    /// Issue one probe. `interface` binds the probe's egress; when absent
    /// the probe follows the main routing table.
    async fn probe_target(
        &self,
        target: &str,
        interface: Option<&str>,
        timeout: Duration,
    ) -> LatencySample {
        let prefix = PING_PREFIX
            .get_or_init(|| detect_ping_prefix(self.runner.as_ref()))
            .await;

        let timeout_s = timeout.as_secs().max(1).to_string();
        let mut args: Vec<&str> = Vec::new();
        let (program, rest): (&str, &[&str]) = if prefix.is_empty() {
            ("ping", &[])
        } else {
            ("sudo", &["ping"])
        };
        args.extend_from_slice(rest);
        args.extend_from_slice(&["-c", "1", "-W", &timeout_s]);
        if let Some(iface) = interface {
            args.extend_from_slice(&["-I", iface]);
        }
        args.push(target);

        // Half a second of grace over ping's own -W deadline.
        let out = self
            .runner
            .run(program, &args, timeout + Duration::from_millis(500))
            .await;

        let rtt_ms = if out.ok() { parse_rtt_ms(&out.stdout) } else { None };

        LatencySample {
            target: target.to_string(),
            interface: interface.map(|s| s.to_string()),
            rtt_ms,
            timestamp: Utc::now(),
            success: rtt_ms.is_some(),
        }
    }

    // ─── Statistics ─────────────────────────────────────────────────

    /// Rolling statistics for one target's ring buffer.
    pub async fn summary(&self, target: &str) -> Option<LatencySummary> {
        let state = self.state.lock().await;
        state.history.get(target).map(|buf| summarize(target, buf))
    }

    /// Rolling statistics for every target with at least one sample.
    pub async fn summaries(&self) -> Vec<LatencySummary> {
        let state = self.state.lock().await;
        state
            .history
            .iter()
            .filter(|(_, buf)| !buf.is_empty())
            .map(|(target, buf)| summarize(target, buf))
            .collect()
    }

    /// Aggregate view for an interface: average of per-target means and
    /// losses. Returns `None` until any samples exist.
    pub async fn interface_summary(&self, interface: &str) -> Option<LatencySummary> {
        let summaries = self.summaries().await;
        aggregate(&summaries, interface)
    }

    /// One-shot interface test: `count` sequential probes per target,
    /// aggregated without touching the long-running history.
    pub async fn test_interface_latency(&self, interface: &str, count: u32) -> LatencySummary {
        let (targets, timeout) = {
            let cfg = self.config.lock().await;
            (cfg.targets.clone(), cfg.timeout())
        };

        let mut samples = Vec::new();
        for target in &targets {
            for _ in 0..count {
                samples.push(self.probe_target(target, Some(interface), timeout).await);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        let buf: VecDeque<LatencySample> = samples.into();
        let mut summary = summarize(&format!("test ({} targets)", targets.len()), &buf);
        summary.interface = Some(interface.to_string());
        summary
    }

    /// Drop history for one target, or all targets.
    pub async fn clear_history(&self, target: Option<&str>) {
        let mut state = self.state.lock().await;
        match target {
            Some(t) => {
                if let Some(buf) = state.history.get_mut(t) {
                    buf.clear();
                }
            }
            None => {
                for buf in state.history.values_mut() {
                    buf.clear();
                }
            }
        }
    }

    /// Recent samples, for dashboards.
    pub async fn history(&self, target: &str, last_n: Option<usize>) -> Vec<LatencySample> {
        let state = self.state.lock().await;
        let Some(buf) = state.history.get(target) else {
            return Vec::new();
        };
        let skip = last_n.map_or(0, |n| buf.len().saturating_sub(n));
        buf.iter().skip(skip).cloned().collect()
    }

    /// Replace the probe configuration. Takes effect for statistics
    /// immediately; the loop cadence changes on the next start.
    pub async fn update_config(&self, config: ProbeConfig) {
        *self.config.lock().await = config;
    }

    #[cfg(test)]
    pub(crate) async fn push_sample(&self, sample: LatencySample) {
        let history_size = self.config.lock().await.history_size;
        let mut state = self.state.lock().await;
        let buf = state
            .history
            .entry(sample.target.clone())
            .or_insert_with(VecDeque::new);
        if buf.len() >= history_size {
            buf.pop_front();
        }
        buf.push_back(sample);
    }
}

impl LatencySource for LatencyMonitor {
    fn average_rtt_ms<'a>(&'a self) -> BoxFuture<'a, Option<f64>> {
        Box::pin(async move {
            let summaries = self.summaries().await;
            let successful: Vec<f64> = summaries
                .iter()
                .filter(|s| s.avg_ms > 0.0)
                .map(|s| s.avg_ms)
                .collect();
            if successful.is_empty() {
                return None;
            }
            Some(successful.iter().sum::<f64>() / successful.len() as f64)
        })
    }
}

// ── Derivation ──────────────────────────────────────────────────────

fn summarize(target: &str, buf: &VecDeque<LatencySample>) -> LatencySummary {
    let total = buf.len();
    let rtts: Vec<f64> = buf.iter().filter_map(|s| s.rtt_ms).collect();

    if rtts.is_empty() {
        return LatencySummary {
            target: target.to_string(),
            interface: None,
            loss_pct: if total > 0 { 100.0 } else { 0.0 },
            sample_count: total,
            last_update: buf.back().map(|s| s.timestamp),
            ..Default::default()
        };
    }

    let n = rtts.len() as f64;
    let mean = rtts.iter().sum::<f64>() / n;
    let variance = rtts.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let jitter = variance.sqrt();

    let mut sorted = rtts.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let p95_idx = ((sorted.len() as f64 * 0.95) as usize).min(sorted.len() - 1);

    LatencySummary {
        target: target.to_string(),
        interface: buf.iter().rev().find(|s| s.success).and_then(|s| s.interface.clone()),
        avg_ms: mean,
        min_ms: sorted[0],
        max_ms: sorted[sorted.len() - 1],
        jitter_ms: jitter,
        variance_ms: variance,
        p95_ms: sorted[p95_idx],
        loss_pct: (1.0 - rtts.len() as f64 / total as f64) * 100.0,
        sample_count: total,
        last_update: buf.iter().rev().find(|s| s.success).map(|s| s.timestamp),
    }
}

fn aggregate(summaries: &[LatencySummary], interface: &str) -> Option<LatencySummary> {
    // Include zero-mean entries so 100% loss still shows up when the
    // monitor is running but the uplink is dead.
    let with_samples: Vec<&LatencySummary> =
        summaries.iter().filter(|s| s.sample_count > 0).collect();
    if with_samples.is_empty() {
        return None;
    }

    let means: Vec<f64> = with_samples
        .iter()
        .filter(|s| s.avg_ms > 0.0)
        .map(|s| s.avg_ms)
        .collect();
    let losses: Vec<f64> = with_samples.iter().map(|s| s.loss_pct).collect();

    let (avg, min, max) = if means.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        (
            means.iter().sum::<f64>() / means.len() as f64,
            means.iter().cloned().fold(f64::INFINITY, f64::min),
            means.iter().cloned().fold(0.0, f64::max),
        )
    };

    Some(LatencySummary {
        target: format!("aggregate ({} targets)", summaries.len()),
        interface: Some(interface.to_string()),
        avg_ms: avg,
        min_ms: min,
        max_ms: max,
        loss_pct: losses.iter().sum::<f64>() / losses.len() as f64,
        sample_count: with_samples.iter().map(|s| s.sample_count).sum(),
        last_update: Some(Utc::now()),
        ..Default::default()
    })
}
