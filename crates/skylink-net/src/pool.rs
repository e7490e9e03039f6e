//! Multi-modem pool — enumeration, scoring, and atomic path switching.
//!
//! The pool keeps an `interface → ModemRecord` map refreshed on a fixed
//! cadence and selects one modem as the default egress. A path switch is
//! gated by the VPN health collaborator: routing is mutated, then the
//! tunnel must recover within a bounded window or the switch is rolled
//! back. VPN packets are steered by fwmark (see the optimizer), so the
//! default-route change itself cannot sever the control plane.
//!
//! Locking: `state` is held only for map reads/writes, never across an
//! await of external I/O; `switch_lock` serializes whole switch operations
//! so concurrent selects cannot interleave their routing mutations.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex};

use skylink_common::config::PoolConfig;
use skylink_common::models::{ModemRecord, PoolStatus, SelectionMode, SwitchAuditEntry};

use crate::command::SystemCommand;
use crate::iface;
use crate::modem_ctl::ModemControl;
use crate::probe::LatencyMonitor;
use crate::score::quality_score;
use crate::task::ServiceTask;
use crate::vpn::VpnHealthProbe;

const AUDIT_CAPACITY: usize = 50;

/// Route metric for the active egress; demoted paths get the high metric
/// so the kernel prefers the active one without us deleting their routes.
const METRIC_ACTIVE: u32 = 100;
const METRIC_STANDBY: u32 = 600;

struct PoolState {
    modems: HashMap<String, ModemRecord>,
    active: Option<String>,
    rr_cursor: usize,
    audit: VecDeque<SwitchAuditEntry>,
}

/// The modem pool singleton.
pub struct ModemPool {
    config: Mutex<PoolConfig>,
    state: Mutex<PoolState>,
    /// Serializes select/rollback operations end to end.
    switch_lock: Mutex<()>,
    runner: Arc<dyn SystemCommand>,
    monitor: Option<Arc<LatencyMonitor>>,
    vpn_health: Option<Arc<dyn VpnHealthProbe>>,
    modem_ctl: Option<Arc<dyn ModemControl>>,
    task: Mutex<Option<ServiceTask>>,
}

impl ModemPool {
    pub fn new(config: PoolConfig, runner: Arc<dyn SystemCommand>) -> Self {
        ModemPool {
            config: Mutex::new(config),
            state: Mutex::new(PoolState {
                modems: HashMap::new(),
                active: None,
                rr_cursor: 0,
                audit: VecDeque::with_capacity(AUDIT_CAPACITY),
            }),
            switch_lock: Mutex::new(()),
            runner,
            monitor: None,
            vpn_health: None,
            modem_ctl: None,
            task: Mutex::new(None),
        }
    }

    /// Attach the latency monitor used for per-modem probe snapshots.
    pub fn with_monitor(mut self, monitor: Arc<LatencyMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Attach the VPN health collaborator that gates switches.
    pub fn with_vpn_health(mut self, probe: Arc<dyn VpnHealthProbe>) -> Self {
        self.vpn_health = Some(probe);
        self
    }

    /// Attach a modem-control provider for RF metrics.
    pub fn with_modem_control(mut self, ctl: Arc<dyn ModemControl>) -> Self {
        self.modem_ctl = Some(ctl);
        self
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Start the periodic refresh loop.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            tracing::warn!("modem pool already running");
            return;
        }

        let interval = self.config.lock().await.refresh_interval();
        let (tx, mut rx) = watch::channel(false);
        let pool = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.refresh().await;
                        pool.auto_select().await;
                    }
                    _ = rx.changed() => break,
                }
            }
        });

        *task = Some(ServiceTask::new(tx, handle));
        tracing::info!("modem pool started");
    }

    /// Stop the refresh loop; a barrier like the other services.
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.stop().await;
            tracing::info!("modem pool stopped");
        }
    }

    // ─── Refresh ────────────────────────────────────────────────────

    /// Rebuild the modem map from live interface state.
    pub async fn refresh(&self) {
        let subnet_hint = self.config.lock().await.subnet_hint.clone();

        let addrs = iface::list_addresses(self.runner.as_ref()).await;
        let candidates = iface::modem_interfaces(&addrs, &subnet_hint);

        let mut fresh: HashMap<String, ModemRecord> = HashMap::new();
        for cand in candidates {
            let gateway = iface::gateway_for(self.runner.as_ref(), &cand.interface).await;
            let oper_down = iface::operstate(&cand.interface).as_deref() == Some("down");
            let is_connected = gateway.is_some() && !oper_down;

            let signal = match &self.modem_ctl {
                Some(ctl) => ctl.signal_metrics(&cand.interface).await,
                None => None,
            };

            let latency = match (&self.monitor, is_connected) {
                (Some(monitor), true) => {
                    Some(monitor.test_interface_latency(&cand.interface, 1).await)
                }
                _ => None,
            };

            let score = quality_score(signal.as_ref(), latency.as_ref());

            let mut record = ModemRecord::new(&cand.interface);
            record.ip_address = Some(cand.ip.clone());
            record.gateway = gateway;
            record.is_connected = is_connected;
            record.is_healthy = is_connected && score > 50.0;
            record.quality_score = score;
            record.signal = signal;
            record.latency = latency;
            record.last_update = Utc::now();
            fresh.insert(cand.interface.clone(), record);
        }

        let mut state = self.state.lock().await;

        // The active flag survives refresh while the modem stays connected.
        if let Some(active) = state.active.clone() {
            match fresh.get_mut(&active) {
                Some(record) if record.is_connected => record.is_active = true,
                _ => {
                    tracing::warn!(modem = %active, "active modem vanished or disconnected");
                    state.active = None;
                }
            }
        }

        state.modems = fresh;
    }

    /// Evaluate the auto-selection policy once. Called after each refresh.
    pub async fn auto_select(&self) {
        let (mode, margin) = {
            let cfg = self.config.lock().await;
            (cfg.selection_mode, cfg.switch_margin)
        };

        match mode {
            SelectionMode::Manual => {}
            SelectionMode::RoundRobin => {
                let next = {
                    let mut state = self.state.lock().await;
                    let mut names: Vec<String> = state
                        .modems
                        .values()
                        .filter(|m| m.is_connected)
                        .map(|m| m.interface.clone())
                        .collect();
                    if names.is_empty() {
                        return;
                    }
                    // Deterministic rotation: lexicographic order with a
                    // cursor that persists across refreshes.
                    names.sort();
                    let idx = state.rr_cursor % names.len();
                    state.rr_cursor = state.rr_cursor.wrapping_add(1);
                    let next = names[idx].clone();
                    if state.active.as_deref() == Some(next.as_str()) {
                        return;
                    }
                    next
                };
                self.select_modem(&next, "round_robin").await;
            }
            SelectionMode::BestScore | SelectionMode::BestSinr | SelectionMode::BestLatency => {
                let target = {
                    let state = self.state.lock().await;
                    let metric = |m: &ModemRecord| -> Option<f64> {
                        match mode {
                            SelectionMode::BestScore => Some(m.quality_score),
                            SelectionMode::BestSinr => m.signal.map(|s| s.sinr_db),
                            SelectionMode::BestLatency => m
                                .latency
                                .as_ref()
                                .filter(|l| l.avg_ms > 0.0)
                                .map(|l| -l.avg_ms),
                            _ => None,
                        }
                    };

                    let best = state
                        .modems
                        .values()
                        .filter(|m| m.is_connected)
                        .filter_map(|m| metric(m).map(|v| (m.interface.clone(), v)))
                        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

                    let Some((best_iface, best_metric)) = best else {
                        return;
                    };

                    match state.active.as_deref() {
                        Some(active) if active == best_iface => return,
                        Some(active) => {
                            // Anti-flap: the candidate must beat the active
                            // modem by the configured margin (in the metric's
                            // own units: score points, dB, or milliseconds).
                            let active_metric =
                                state.modems.get(active).and_then(&metric).unwrap_or(f64::MIN);
                            if best_metric < active_metric + margin {
                                return;
                            }
                            best_iface
                        }
                        None => best_iface,
                    }
                };
                self.select_modem(&target, "auto").await;
            }
        }
    }

    // ─── Selection ──────────────────────────────────────────────────

    /// Make `target` the active egress.
    ///
    /// Postconditions on every successful return: `target` is the only
    /// active modem. On VPN recovery failure the previous routing is
    /// restored and the call returns `false`.
    pub async fn select_modem(&self, target: &str, reason: &str) -> bool {
        let _guard = self.switch_lock.lock().await;
        self.select_modem_serialized(target, reason).await
    }

    async fn select_modem_serialized(&self, target: &str, reason: &str) -> bool {
        // Step 1–2: validate target and short-circuit no-ops.
        let previous = {
            let state = self.state.lock().await;
            let Some(record) = state.modems.get(target) else {
                tracing::warn!(target, "select_modem: unknown modem");
                return false;
            };
            if !record.is_connected {
                tracing::warn!(target, "select_modem: modem not connected");
                return false;
            }
            if state.active.as_deref() == Some(target) {
                return true;
            }
            state.active.clone()
        };

        let (vpn_enabled, recovery_timeout) = {
            let cfg = self.config.lock().await;
            (cfg.vpn_check_enabled, cfg.vpn_recovery_timeout())
        };
        let vpn = self.vpn_health.as_ref().filter(|_| vpn_enabled && reason != "rollback");

        // Step 3: advisory pre-check. An unhealthy tunnel before the switch
        // is logged but does not block it.
        if let Some(vpn) = vpn {
            let health = vpn.check_vpn_health().await;
            if !health.healthy {
                tracing::warn!(target, "VPN unhealthy before switch, proceeding anyway");
            }
        }

        tracing::info!(target, previous = ?previous, reason, "switching modem path");

        // Step 4: mutate routing. fwmark rules are untouched, so VPN
        // control traffic keeps flowing during the metric dance.
        if !self.apply_modem_priority(target, previous.as_deref()).await {
            tracing::error!(target, "routing change failed");
            self.push_audit(previous, target, reason, false).await;
            return false;
        }

        // Step 5: the tunnel must come back within the bounded window.
        if let Some(vpn) = vpn {
            if !vpn.wait_for_vpn_recovery(recovery_timeout).await {
                tracing::error!(
                    target,
                    timeout_s = recovery_timeout.as_secs(),
                    "VPN did not recover after switch, rolling back"
                );
                self.push_audit(previous.clone(), target, reason, false).await;
                if let Some(prev) = previous {
                    self.rollback_to_modem(&prev, target).await;
                }
                return false;
            }
        }

        // Step 6: commit.
        {
            let mut state = self.state.lock().await;
            for record in state.modems.values_mut() {
                record.is_active = record.interface == target;
            }
            state.active = Some(target.to_string());
        }
        self.push_audit(previous, target, reason, true).await;
        tracing::info!(target, "modem path switch complete");
        true
    }

    /// Restore `previous` as the active modem after a failed switch to
    /// `failed`. Runs with `reason="rollback"` semantics: no VPN checks,
    /// so it always terminates.
    async fn rollback_to_modem(&self, previous: &str, failed: &str) {
        let prev_connected = {
            let state = self.state.lock().await;
            state.modems.get(previous).is_some_and(|m| m.is_connected)
        };

        self.apply_modem_priority(previous, Some(failed)).await;

        {
            let mut state = self.state.lock().await;
            for record in state.modems.values_mut() {
                record.is_active = prev_connected && record.interface == previous;
            }
            state.active = if prev_connected {
                Some(previous.to_string())
            } else {
                None
            };
        }

        self.push_audit(Some(failed.to_string()), previous, "rollback", prev_connected)
            .await;
        tracing::info!(previous, failed, "rollback applied");
    }

    /// Default-route metric dance: promote `new` to the low metric, demote
    /// `old` to the standby metric. Delete-then-add so repeated application
    /// is idempotent.
    async fn apply_modem_priority(&self, new: &str, old: Option<&str>) -> bool {
        let (new_gw, old_gw) = {
            let state = self.state.lock().await;
            (
                state.modems.get(new).and_then(|m| m.gateway.clone()),
                old.and_then(|o| state.modems.get(o).and_then(|m| m.gateway.clone())),
            )
        };

        let Some(new_gw) = new_gw else {
            tracing::error!(modem = new, "no gateway known for target modem");
            return false;
        };

        let metric = METRIC_ACTIVE.to_string();
        self.runner
            .run(
                "ip",
                &["route", "del", "default", "via", &new_gw, "dev", new],
                crate::command::TIMEOUT_APPLY,
            )
            .await;
        let added = self
            .runner
            .run(
                "ip",
                &["route", "add", "default", "via", &new_gw, "dev", new, "metric", &metric],
                crate::command::TIMEOUT_APPLY,
            )
            .await;
        if !added.ok() {
            return false;
        }

        if let (Some(old), Some(old_gw)) = (old, old_gw) {
            let standby = METRIC_STANDBY.to_string();
            self.runner
                .run(
                    "ip",
                    &["route", "del", "default", "via", &old_gw, "dev", old],
                    crate::command::TIMEOUT_APPLY,
                )
                .await;
            self.runner
                .run(
                    "ip",
                    &["route", "add", "default", "via", &old_gw, "dev", old, "metric", &standby],
                    crate::command::TIMEOUT_APPLY,
                )
                .await;
        }

        true
    }

    async fn push_audit(&self, from: Option<String>, to: &str, reason: &str, success: bool) {
        let mut state = self.state.lock().await;
        if state.audit.len() >= AUDIT_CAPACITY {
            state.audit.pop_front();
        }
        state.audit.push_back(SwitchAuditEntry {
            from,
            to: to.to_string(),
            reason: reason.to_string(),
            success,
            timestamp: Utc::now(),
        });
    }

    // ─── Queries ────────────────────────────────────────────────────

    pub async fn get_all_modems(&self) -> Vec<ModemRecord> {
        let state = self.state.lock().await;
        let mut modems: Vec<ModemRecord> = state.modems.values().cloned().collect();
        modems.sort_by(|a, b| a.interface.cmp(&b.interface));
        modems
    }

    pub async fn get_connected_modems(&self) -> Vec<ModemRecord> {
        self.get_all_modems()
            .await
            .into_iter()
            .filter(|m| m.is_connected)
            .collect()
    }

    pub async fn get_modem(&self, interface: &str) -> Option<ModemRecord> {
        self.state.lock().await.modems.get(interface).cloned()
    }

    pub async fn get_active_modem(&self) -> Option<ModemRecord> {
        let state = self.state.lock().await;
        state.active.as_ref().and_then(|a| state.modems.get(a)).cloned()
    }

    /// Highest quality score among connected modems.
    pub async fn get_best_modem(&self) -> Option<ModemRecord> {
        self.get_connected_modems()
            .await
            .into_iter()
            .max_by(|a, b| a.quality_score.partial_cmp(&b.quality_score).unwrap())
    }

    pub async fn set_selection_mode(&self, mode: &str) -> bool {
        match mode.parse::<SelectionMode>() {
            Ok(parsed) => {
                self.config.lock().await.selection_mode = parsed;
                tracing::info!(mode, "selection mode changed");
                true
            }
            Err(_) => {
                tracing::warn!(mode, "rejected unknown selection mode");
                false
            }
        }
    }

    pub async fn audit_log(&self) -> Vec<SwitchAuditEntry> {
        self.state.lock().await.audit.iter().cloned().collect()
    }

    pub async fn get_status(&self) -> PoolStatus {
        let mode = self.config.lock().await.selection_mode;
        let state = self.state.lock().await;
        let mut modems: Vec<ModemRecord> = state.modems.values().cloned().collect();
        modems.sort_by(|a, b| a.interface.cmp(&b.interface));

        PoolStatus {
            total_modems: modems.len(),
            connected_modems: modems.iter().filter(|m| m.is_connected).count(),
            healthy_modems: modems.iter().filter(|m| m.is_healthy).count(),
            active_modem: state.active.clone(),
            selection_mode: mode,
            modems,
        }
    }

    pub async fn update_config(&self, config: PoolConfig) {
        *self.config.lock().await = config;
    }

    // ─── Test hooks ─────────────────────────────────────────────────

    #[cfg(test)]
    pub(crate) async fn insert_modem(&self, record: ModemRecord) {
        let mut state = self.state.lock().await;
        if record.is_active {
            state.active = Some(record.interface.clone());
        }
        state.modems.insert(record.interface.clone(), record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{BoxFuture, MockRunner};
    use crate::vpn::{VpnHealth, VpnHealthProbe};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn record(interface: &str, connected: bool, active: bool, quality: f64) -> ModemRecord {
        let mut m = ModemRecord::new(interface);
        m.ip_address = Some("10.0.0.2".into());
        m.gateway = Some(format!("10.0.{}.1", interface.len()));
        m.is_connected = connected;
        m.is_active = active;
        m.is_healthy = connected;
        m.quality_score = quality;
        m
    }

    async fn pool_with_modems(entries: &[(&str, bool, bool)]) -> (Arc<ModemPool>, Arc<MockRunner>) {
        let runner = Arc::new(MockRunner::new());
        let pool = Arc::new(ModemPool::new(
            PoolConfig {
                vpn_check_enabled: false,
                ..Default::default()
            },
            runner.clone(),
        ));
        for (iface, connected, active) in entries {
            pool.insert_modem(record(iface, *connected, *active, 80.0)).await;
        }
        (pool, runner)
    }

    /// Asserts the §8 invariant: at most one active modem, and active ⇒ connected.
    async fn assert_single_active(pool: &ModemPool) {
        let modems = pool.get_all_modems().await;
        let active: Vec<&ModemRecord> = modems.iter().filter(|m| m.is_active).collect();
        assert!(active.len() <= 1, "more than one active modem");
        for m in active {
            assert!(m.is_connected, "active modem must be connected");
        }
    }

    // ─── select_modem basics ────────────────────────────────────────────

    #[tokio::test]
    async fn select_unknown_modem_fails() {
        let (pool, _) = pool_with_modems(&[("wwan0", true, false)]).await;
        assert!(!pool.select_modem("wwan9", "manual").await);
        assert_single_active(&pool).await;
    }

    #[tokio::test]
    async fn select_disconnected_modem_fails() {
        let (pool, runner) = pool_with_modems(&[("wwan0", false, false)]).await;
        assert!(!pool.select_modem("wwan0", "manual").await);
        assert!(runner.calls().is_empty(), "no routing commands for a refused switch");
    }

    #[tokio::test]
    async fn select_already_active_is_noop() {
        let (pool, runner) = pool_with_modems(&[("wwan0", true, true)]).await;
        assert!(pool.select_modem("wwan0", "manual").await);
        assert!(runner.calls().is_empty(), "no side effects when already active");
    }

    #[tokio::test]
    async fn select_switches_active_flags() {
        let (pool, runner) = pool_with_modems(&[("wwan0", true, true), ("wwan1", true, false)]).await;

        assert!(pool.select_modem("wwan1", "manual").await);

        assert_eq!(pool.get_active_modem().await.unwrap().interface, "wwan1");
        assert!(!pool.get_modem("wwan0").await.unwrap().is_active);
        assert_single_active(&pool).await;

        // Promote new, demote old
        assert!(runner.saw("metric 100"));
        assert!(runner.saw("metric 600"));
    }

    #[tokio::test]
    async fn select_sequence_ends_where_it_started() {
        let (pool, _) = pool_with_modems(&[("wwan0", true, true), ("wwan1", true, false)]).await;

        assert!(pool.select_modem("wwan1", "manual").await);
        assert!(pool.select_modem("wwan0", "manual").await);
        assert!(pool.select_modem("wwan0", "manual").await);

        assert_eq!(pool.get_active_modem().await.unwrap().interface, "wwan0");
        assert_single_active(&pool).await;
    }

    // ─── VPN gating ─────────────────────────────────────────────────────

    struct ScriptedVpn {
        pre_healthy: bool,
        recovers: AtomicBool,
        checks: AtomicUsize,
    }

    impl ScriptedVpn {
        fn new(pre_healthy: bool, recovers: bool) -> Arc<Self> {
            Arc::new(ScriptedVpn {
                pre_healthy,
                recovers: AtomicBool::new(recovers),
                checks: AtomicUsize::new(0),
            })
        }
    }

    impl VpnHealthProbe for ScriptedVpn {
        fn check_vpn_health<'a>(&'a self) -> BoxFuture<'a, VpnHealth> {
            Box::pin(async move {
                self.checks.fetch_add(1, Ordering::SeqCst);
                VpnHealth {
                    healthy: self.pre_healthy,
                    ..Default::default()
                }
            })
        }

        fn wait_for_vpn_recovery<'a>(&'a self, _timeout: std::time::Duration) -> BoxFuture<'a, bool> {
            Box::pin(async move { self.recovers.load(Ordering::SeqCst) })
        }
    }

    async fn pool_with_vpn(vpn: Arc<ScriptedVpn>) -> Arc<ModemPool> {
        let runner = Arc::new(MockRunner::new());
        let pool = Arc::new(
            ModemPool::new(PoolConfig::default(), runner).with_vpn_health(vpn),
        );
        pool.insert_modem(record("wwan0", true, true, 70.0)).await;
        pool.insert_modem(record("wwan1", true, false, 90.0)).await;
        pool
    }

    #[tokio::test]
    async fn vpn_recovery_success_completes_switch() {
        let vpn = ScriptedVpn::new(true, true);
        let pool = pool_with_vpn(vpn).await;

        assert!(pool.select_modem("wwan1", "auto").await);
        assert_eq!(pool.get_active_modem().await.unwrap().interface, "wwan1");
    }

    #[tokio::test]
    async fn vpn_unhealthy_precheck_is_warning_only() {
        let vpn = ScriptedVpn::new(false, true);
        let pool = pool_with_vpn(vpn).await;

        assert!(pool.select_modem("wwan1", "manual").await);
        assert_eq!(pool.get_active_modem().await.unwrap().interface, "wwan1");
    }

    #[tokio::test]
    async fn vpn_recovery_failure_rolls_back() {
        let vpn = ScriptedVpn::new(true, false);
        let pool = pool_with_vpn(vpn).await;

        assert!(!pool.select_modem("wwan1", "auto").await);

        // Previous modem restored as active
        assert_eq!(pool.get_active_modem().await.unwrap().interface, "wwan0");
        assert!(!pool.get_modem("wwan1").await.unwrap().is_active);
        assert_single_active(&pool).await;

        // An audit entry documents the rollback
        let audit = pool.audit_log().await;
        assert!(
            audit.iter().any(|e| e.reason == "rollback" && e.to == "wwan0"),
            "expected a rollback audit entry, got {audit:?}"
        );
        // And the failed attempt itself is recorded
        assert!(audit.iter().any(|e| e.to == "wwan1" && !e.success));
    }

    #[tokio::test]
    async fn rollback_reason_skips_vpn_checks() {
        let vpn = ScriptedVpn::new(true, true);
        let pool = pool_with_vpn(vpn.clone()).await;

        assert!(pool.select_modem("wwan1", "rollback").await);
        assert_eq!(vpn.checks.load(Ordering::SeqCst), 0, "rollback must not consult VPN");
    }

    #[tokio::test]
    async fn vpn_check_disabled_by_preference() {
        let vpn = ScriptedVpn::new(true, true);
        let runner = Arc::new(MockRunner::new());
        let pool = Arc::new(
            ModemPool::new(
                PoolConfig {
                    vpn_check_enabled: false,
                    ..Default::default()
                },
                runner,
            )
            .with_vpn_health(vpn.clone()),
        );
        pool.insert_modem(record("wwan0", true, true, 70.0)).await;
        pool.insert_modem(record("wwan1", true, false, 90.0)).await;

        assert!(pool.select_modem("wwan1", "manual").await);
        assert_eq!(vpn.checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rollback_to_disconnected_previous_clears_active() {
        let vpn = ScriptedVpn::new(true, false);
        let runner = Arc::new(MockRunner::new());
        let pool = Arc::new(ModemPool::new(PoolConfig::default(), runner).with_vpn_health(vpn));
        let mut prev = record("wwan0", true, true, 70.0);
        prev.is_connected = false;
        prev.is_active = true; // stale flag from before the link dropped
        pool.insert_modem(prev).await;
        pool.insert_modem(record("wwan1", true, false, 90.0)).await;

        assert!(!pool.select_modem("wwan1", "auto").await);
        assert!(pool.get_active_modem().await.is_none());
        assert_single_active(&pool).await;
    }

    // ─── Queries ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn best_modem_by_quality() {
        let (pool, _) = pool_with_modems(&[("wwan0", true, false), ("wwan1", true, false)]).await;
        {
            let mut state = pool.state.lock().await;
            state.modems.get_mut("wwan0").unwrap().quality_score = 60.0;
            state.modems.get_mut("wwan1").unwrap().quality_score = 90.0;
        }
        assert_eq!(pool.get_best_modem().await.unwrap().interface, "wwan1");
    }

    #[tokio::test]
    async fn status_counts() {
        let (pool, _) = pool_with_modems(&[("wwan0", true, true), ("wwan1", false, false)]).await;
        let status = pool.get_status().await;
        assert_eq!(status.total_modems, 2);
        assert_eq!(status.connected_modems, 1);
        assert_eq!(status.active_modem.as_deref(), Some("wwan0"));
        assert_eq!(status.modems.len(), 2);
    }

    #[tokio::test]
    async fn selection_mode_validation() {
        let (pool, _) = pool_with_modems(&[]).await;
        assert!(pool.set_selection_mode("manual").await);
        assert!(!pool.set_selection_mode("nonexistent_mode").await);
    }

    // ─── Round robin ────────────────────────────────────────────────────

    #[tokio::test]
    async fn round_robin_rotates_deterministically() {
        let (pool, _) = pool_with_modems(&[
            ("wwan0", true, false),
            ("wwan1", true, false),
            ("wwan2", true, false),
        ])
        .await;
        pool.set_selection_mode("round_robin").await;

        let mut seen = Vec::new();
        for _ in 0..6 {
            pool.auto_select().await;
            seen.push(pool.get_active_modem().await.unwrap().interface);
        }
        // Lexicographic rotation, cursor persists across evaluations
        assert_eq!(seen, vec!["wwan0", "wwan1", "wwan2", "wwan0", "wwan1", "wwan2"]);
        assert_single_active(&pool).await;
    }

    // ─── Auto selection margin ──────────────────────────────────────────

    #[tokio::test]
    async fn auto_select_respects_margin() {
        let (pool, _) = pool_with_modems(&[("wwan0", true, true), ("wwan1", true, false)]).await;
        {
            let mut state = pool.state.lock().await;
            state.modems.get_mut("wwan0").unwrap().quality_score = 80.0;
            // Better, but within the 10-point margin
            state.modems.get_mut("wwan1").unwrap().quality_score = 85.0;
        }

        pool.auto_select().await;
        assert_eq!(pool.get_active_modem().await.unwrap().interface, "wwan0");

        {
            let mut state = pool.state.lock().await;
            state.modems.get_mut("wwan1").unwrap().quality_score = 95.0;
        }
        pool.auto_select().await;
        assert_eq!(pool.get_active_modem().await.unwrap().interface, "wwan1");
    }

    #[tokio::test]
    async fn auto_select_picks_first_when_none_active() {
        let (pool, _) = pool_with_modems(&[("wwan0", true, false)]).await;
        pool.auto_select().await;
        assert_eq!(pool.get_active_modem().await.unwrap().interface, "wwan0");
    }

    // ─── Refresh ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn refresh_discovers_modem_interfaces() {
        let runner = Arc::new(MockRunner::new());
        runner.stub(
            "ip -o addr show",
            "4: eth1    inet 192.168.8.100/24 scope global eth1\n5: wwan0    inet 10.64.12.7/30 scope global wwan0",
        );
        runner.stub("ip route show dev eth1", "default via 192.168.8.1");
        runner.stub("ip route show dev wwan0", "10.64.12.4/30 proto kernel");

        let pool = ModemPool::new(PoolConfig::default(), runner);
        pool.refresh().await;

        let modems = pool.get_all_modems().await;
        assert_eq!(modems.len(), 2);
        let eth1 = pool.get_modem("eth1").await.unwrap();
        assert!(eth1.is_connected, "gateway present means connected");
        let wwan0 = pool.get_modem("wwan0").await.unwrap();
        assert!(!wwan0.is_connected, "no gateway means disconnected");
    }

    #[tokio::test]
    async fn refresh_drops_vanished_active() {
        let runner = Arc::new(MockRunner::new());
        runner.stub("ip -o addr show", "");
        let pool = ModemPool::new(PoolConfig::default(), runner);
        pool.insert_modem(record("wwan0", true, true, 80.0)).await;

        pool.refresh().await;
        assert!(pool.get_active_modem().await.is_none());
        assert!(pool.get_all_modems().await.is_empty());
    }
}
