//! Auto-failover — the hysteresis state machine over probe output.
//!
//! Each tick samples the cross-target average RTT and decides whether to
//! switch uplinks. Sustained degradation (a full window of consecutive bad
//! samples, outside the cooldown) triggers a switch to the alternate mode;
//! total connectivity loss switches immediately; and once latency has been
//! good for long enough, the preferred mode is restored — but only when RTT
//! sits comfortably under the threshold, so the machine cannot oscillate at
//! the line.
//!
//! Switch execution is delegated to an injected [`SwitchCallback`]; a false
//! return leaves `current_mode` unchanged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};

use skylink_common::config::{FailoverConfig, FailoverConfigPatch};
use skylink_common::models::{FailoverStatus, NetworkMode};

use crate::command::BoxFuture;
use crate::probe::LatencySource;
use crate::task::ServiceTask;

/// Executes an uplink switch. In production this wraps the modem pool's
/// `select_modem` (or the Wi-Fi-side routine); tests inject stubs.
pub trait SwitchCallback: Send + Sync {
    fn switch_to<'a>(&'a self, mode: NetworkMode) -> BoxFuture<'a, bool>;
}

struct FailoverState {
    active: bool,
    current_mode: NetworkMode,
    last_switch: Option<Instant>,
    consecutive_bad_samples: u32,
    last_reason: Option<String>,
}

/// The failover controller singleton.
pub struct AutoFailover {
    config: Mutex<FailoverConfig>,
    state: Mutex<FailoverState>,
    latency: Arc<dyn LatencySource>,
    callback: Arc<dyn SwitchCallback>,
    task: Mutex<Option<ServiceTask>>,
}

impl AutoFailover {
    pub fn new(
        config: FailoverConfig,
        latency: Arc<dyn LatencySource>,
        callback: Arc<dyn SwitchCallback>,
    ) -> Arc<Self> {
        Arc::new(AutoFailover {
            config: Mutex::new(config),
            state: Mutex::new(FailoverState {
                active: false,
                current_mode: NetworkMode::Unknown,
                last_switch: None,
                consecutive_bad_samples: 0,
                last_reason: None,
            }),
            latency,
            callback,
            task: Mutex::new(None),
        })
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Start the tick loop. `initial_mode` is the caller's belief about the
    /// current uplink.
    pub async fn start(self: &Arc<Self>, initial_mode: NetworkMode) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            tracing::warn!("auto-failover already running");
            return;
        }

        {
            let mut state = self.state.lock().await;
            state.active = true;
            state.current_mode = initial_mode;
        }

        let interval = Duration::from_secs_f64(self.config.lock().await.check_interval_s.max(0.1));
        let (tx, mut rx) = watch::channel(false);
        let failover = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                // Ticks are strictly serial: a tick that begins a switch is
                // awaited before the next tick begins.
                tokio::select! {
                    _ = ticker.tick() => failover.tick().await,
                    _ = rx.changed() => break,
                }
            }
        });

        *task = Some(ServiceTask::new(tx, handle));
        tracing::info!(initial_mode = %initial_mode, "auto-failover started");
    }

    /// Stop the loop. Any in-progress switch callback is awaited to
    /// completion, so routing is never left half-applied.
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.stop().await;
        }
        self.state.lock().await.active = false;
        tracing::info!("auto-failover stopped");
    }

    // ─── Tick ───────────────────────────────────────────────────────

    /// One state-machine evaluation. Public so the agent can drive the
    /// machine manually during tests and diagnostics.
    pub async fn tick(&self) {
        let Some(avg_rtt) = self.latency.average_rtt_ms().await else {
            // Connectivity-loss branch: no probe succeeded anywhere.
            // Switch immediately, no hysteresis.
            tracing::warn!("no successful probes to any target");
            let target = self.state.lock().await.current_mode.alternate();
            self.execute_switch(target, "complete connectivity loss".into())
                .await;
            return;
        };

        let config = self.config.lock().await.clone();

        if avg_rtt > config.latency_threshold_ms {
            let should_switch = {
                let mut state = self.state.lock().await;
                state.consecutive_bad_samples += 1;
                tracing::debug!(
                    avg_rtt_ms = avg_rtt,
                    threshold_ms = config.latency_threshold_ms,
                    consecutive = state.consecutive_bad_samples,
                    "high latency"
                );
                state.consecutive_bad_samples >= config.latency_check_window
                    && state.cooldown_elapsed(config.switch_cooldown_s)
            };

            if should_switch {
                let target = self.state.lock().await.current_mode.alternate();
                let reason = format!(
                    "high latency: {avg_rtt:.1}ms > {:.0}ms",
                    config.latency_threshold_ms
                );
                if self.execute_switch(target, reason).await {
                    let mut state = self.state.lock().await;
                    state.last_switch = Some(Instant::now());
                    state.consecutive_bad_samples = 0;
                }
            }
        } else {
            // Latency acceptable: reset hysteresis, consider restoration.
            {
                let mut state = self.state.lock().await;
                state.consecutive_bad_samples = 0;
            }
            self.maybe_restore_preferred(avg_rtt, &config).await;
        }
    }

    async fn maybe_restore_preferred(&self, avg_rtt: f64, config: &FailoverConfig) {
        {
            let state = self.state.lock().await;
            if state.current_mode == config.preferred_mode {
                return;
            }
            if !state.restore_delay_elapsed(config.restore_delay_s) {
                return;
            }
        }

        // The 30% margin below the threshold prevents oscillation.
        if avg_rtt >= config.restore_threshold_ms() {
            return;
        }

        let reason = format!("restoring preferred mode (latency {avg_rtt:.1}ms)");
        if self.execute_switch(config.preferred_mode, reason).await {
            let mut state = self.state.lock().await;
            state.last_switch = Some(Instant::now());
        }
    }

    async fn execute_switch(&self, target: NetworkMode, reason: String) -> bool {
        tracing::info!(target = %target, reason = %reason, "switching uplink");

        let success = self.callback.switch_to(target).await;
        if success {
            let mut state = self.state.lock().await;
            state.current_mode = target;
            state.last_reason = Some(reason);
        } else {
            tracing::error!(target = %target, "switch callback returned false");
        }
        success
    }

    /// Manual override: switch now, regardless of hysteresis.
    pub async fn force_switch(&self, target: NetworkMode, reason: &str) -> bool {
        let switched = self.execute_switch(target, reason.to_string()).await;
        if switched {
            let mut state = self.state.lock().await;
            state.last_switch = Some(Instant::now());
            state.consecutive_bad_samples = 0;
        }
        switched
    }

    // ─── Introspection ──────────────────────────────────────────────

    pub async fn get_status(&self) -> FailoverStatus {
        let config = self.config.lock().await;
        let state = self.state.lock().await;
        FailoverStatus {
            active: state.active,
            current_mode: state.current_mode,
            preferred_mode: config.preferred_mode,
            consecutive_bad_samples: state.consecutive_bad_samples,
            seconds_since_switch: state.last_switch.map(|t| t.elapsed().as_secs_f64()),
            last_reason: state.last_reason.clone(),
        }
    }

    pub async fn update_config(&self, patch: FailoverConfigPatch) {
        self.config.lock().await.apply_update(patch);
    }

    #[cfg(test)]
    pub(crate) async fn set_last_switch(&self, ago: Duration) {
        self.state.lock().await.last_switch = Some(Instant::now() - ago);
    }
}

impl FailoverState {
    fn cooldown_elapsed(&self, cooldown_s: f64) -> bool {
        self.last_switch
            .map_or(true, |t| t.elapsed() >= Duration::from_secs_f64(cooldown_s))
    }

    fn restore_delay_elapsed(&self, delay_s: f64) -> bool {
        self.last_switch
            .map_or(true, |t| t.elapsed() >= Duration::from_secs_f64(delay_s))
    }
}
