//! Modem quality scoring.
//!
//! Composite score (0–100) from RF and probe metrics:
//!
//! score = 0.35·norm(SINR) + 0.20·norm(RSRQ) + 0.30·(1 − loss) + 0.15·(1 − norm(jitter))
//!
//! Every term is clamped to [0, 1], so the score is monotone in each input:
//! a better input never lowers the score. Missing RF data contributes its
//! neutral midpoint; missing probe data is treated as lossless, so a modem
//! is never penalised for metrics nobody collected yet.

use skylink_common::models::{LatencySummary, SignalMetrics};

/// Weights for the composite score.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub sinr: f64,
    pub rsrq: f64,
    pub loss: f64,
    pub jitter: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        ScoreWeights {
            sinr: 0.35,
            rsrq: 0.20,
            loss: 0.30,
            jitter: 0.15,
        }
    }
}

/// Compute the composite quality score for one modem.
pub fn quality_score(signal: Option<&SignalMetrics>, latency: Option<&LatencySummary>) -> f64 {
    quality_score_weighted(signal, latency, ScoreWeights::default())
}

pub fn quality_score_weighted(
    signal: Option<&SignalMetrics>,
    latency: Option<&LatencySummary>,
    weights: ScoreWeights,
) -> f64 {
    // SINR: -20 dB → 0, +30 dB → 1
    let sinr_norm = signal
        .map(|s| ((s.sinr_db + 20.0) / 50.0).clamp(0.0, 1.0))
        .unwrap_or(0.5);

    // RSRQ: -20 dB → 0, -3 dB → 1
    let rsrq_norm = signal
        .map(|s| ((s.rsrq_db + 20.0) / 17.0).clamp(0.0, 1.0))
        .unwrap_or(0.5);

    // Loss: 0% → 1, 100% → 0
    let loss_score = latency
        .map(|l| (1.0 - l.loss_pct / 100.0).clamp(0.0, 1.0))
        .unwrap_or(1.0);

    // Jitter: 0 ms → 1, 100 ms → 0
    let jitter_norm = latency
        .map(|l| (1.0 - l.jitter_ms / 100.0).clamp(0.0, 1.0))
        .unwrap_or(0.5);

    let raw = weights.sinr * sinr_norm
        + weights.rsrq * rsrq_norm
        + weights.loss * loss_score
        + weights.jitter * jitter_norm;

    (raw * 100.0).clamp(0.0, 100.0)
}

// ── Signal watermark ────────────────────────────────────────────────

/// Read the wireless signal level for `iface` from `/proc/net/wireless`.
///
/// Returns `None` if the interface is not wireless or the file is
/// unavailable (cellular interfaces usually are not listed there).
pub fn read_signal_dbm(iface: &str) -> Option<f64> {
    let contents = std::fs::read_to_string("/proc/net/wireless").ok()?;
    parse_wireless_signal(&contents, iface)
}

fn parse_wireless_signal(contents: &str, iface: &str) -> Option<f64> {
    // Two header lines, then: "wlan0: 0000   -42.  -95.  0  ..."
    for line in contents.lines().skip(2) {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix(iface).and_then(|r| r.strip_prefix(':')) else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() >= 2 {
            // The signal level field may carry a trailing period.
            return fields[1].trim_end_matches('.').parse().ok();
        }
    }
    None
}

/// Whether a link should be treated as unreliable given its signal level.
/// Wired links (no signal data) are never below the watermark.
pub fn is_below_watermark(signal_dbm: Option<f64>, threshold_dbm: f64) -> bool {
    matches!(signal_dbm, Some(dbm) if dbm < threshold_dbm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_signal() -> SignalMetrics {
        SignalMetrics {
            rsrp_dbm: -75.0,
            rsrq_db: -6.0,
            sinr_db: 20.0,
        }
    }

    fn poor_signal() -> SignalMetrics {
        SignalMetrics {
            rsrp_dbm: -130.0,
            rsrq_db: -18.0,
            sinr_db: -10.0,
        }
    }

    fn latency(jitter_ms: f64, loss_pct: f64) -> LatencySummary {
        LatencySummary {
            jitter_ms,
            loss_pct,
            avg_ms: 30.0,
            sample_count: 10,
            ..Default::default()
        }
    }

    // ─── Score levels ───────────────────────────────────────────────────

    #[test]
    fn good_inputs_score_high() {
        let score = quality_score(Some(&good_signal()), Some(&latency(5.0, 0.0)));
        assert!(score > 70.0, "expected high score, got {score}");
    }

    #[test]
    fn poor_inputs_score_low() {
        let score = quality_score(Some(&poor_signal()), Some(&latency(90.0, 40.0)));
        assert!(score < 40.0, "expected low score, got {score}");
    }

    #[test]
    fn missing_data_is_neutral() {
        let score = quality_score(None, None);
        // 0.35·0.5 + 0.20·0.5 + 0.30·1.0 + 0.15·0.5 = 0.65
        assert!((score - 65.0).abs() < 1e-9);
    }

    // ─── Monotonicity ───────────────────────────────────────────────────

    #[test]
    fn monotone_in_sinr() {
        let mut prev = -1.0;
        for sinr in [-25.0, -10.0, 0.0, 10.0, 20.0, 30.0, 40.0] {
            let s = SignalMetrics {
                sinr_db: sinr,
                ..good_signal()
            };
            let score = quality_score(Some(&s), None);
            assert!(score >= prev, "score regressed at sinr={sinr}");
            prev = score;
        }
    }

    #[test]
    fn monotone_in_loss() {
        let mut prev = 101.0;
        for loss in [0.0, 10.0, 30.0, 60.0, 100.0] {
            let score = quality_score(Some(&good_signal()), Some(&latency(5.0, loss)));
            assert!(score <= prev, "score rose with loss={loss}");
            prev = score;
        }
    }

    #[test]
    fn monotone_in_jitter() {
        let mut prev = 101.0;
        for jitter in [0.0, 20.0, 50.0, 100.0, 200.0] {
            let score = quality_score(Some(&good_signal()), Some(&latency(jitter, 0.0)));
            assert!(score <= prev, "score rose with jitter={jitter}");
            prev = score;
        }
    }

    #[test]
    fn score_stays_in_bounds() {
        let extreme = SignalMetrics {
            rsrp_dbm: 0.0,
            rsrq_db: 50.0,
            sinr_db: 500.0,
        };
        assert!(quality_score(Some(&extreme), Some(&latency(0.0, 0.0))) <= 100.0);
        assert!(quality_score(Some(&poor_signal()), Some(&latency(1000.0, 100.0))) >= 0.0);
    }

    // ─── Wireless watermark ─────────────────────────────────────────────

    #[test]
    fn parses_proc_net_wireless() {
        let contents = "\
Inter-| sta-|   Quality        |   Discarded packets               | Missed | WE
 face | tus | link level noise |  nwid  crypt   frag  retry   misc | beacon | 22
 wlan0: 0000   -42.  -95.  0        0      0      0       0       0
 wlan1: 0000   -75.  -100.  0        0      0      0       0       0";

        assert_eq!(parse_wireless_signal(contents, "wlan0"), Some(-42.0));
        assert_eq!(parse_wireless_signal(contents, "wlan1"), Some(-75.0));
        assert_eq!(parse_wireless_signal(contents, "wwan0"), None);
    }

    #[test]
    fn watermark_thresholds() {
        assert!(is_below_watermark(Some(-90.0), -80.0));
        assert!(!is_below_watermark(Some(-60.0), -80.0));
        assert!(!is_below_watermark(Some(-80.0), -80.0));
        assert!(!is_below_watermark(None, -80.0));
    }
}
