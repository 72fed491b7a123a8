//! Anomaly radar and SLO error budget.
//!
//! A rolling window of metric snapshots feeds derived signals (error rate,
//! P95 latency, backlog growth) that are compared against two-tier
//! thresholds, and an SLO burn-rate evaluation over fast and slow windows.
//! Alerts carry stable ids so repeated emissions update instead of
//! duplicating, with dwell-time hysteresis on the way up and a cooldown on
//! the way down.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{info, warn};

use hoist_core::SloConfig;

/// One sample of queue health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub at: DateTime<Utc>,
    pub backlog: u64,
    pub request_count: u64,
    pub error_count: u64,
    pub latency_p50: Duration,
    pub latency_p95: Duration,
    pub latency_p99: Duration,
}

/// Signals the radar derives and judges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    ErrorRate,
    LatencyP95,
    BacklogGrowth,
    FastBurn,
    SlowBurn,
}

impl Signal {
    pub fn name(self) -> &'static str {
        match self {
            Self::ErrorRate => "error_rate",
            Self::LatencyP95 => "latency_p95",
            Self::BacklogGrowth => "backlog_growth",
            Self::FastBurn => "fast_burn",
            Self::SlowBurn => "slow_burn",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// An active alert. `id` is stable per signal, so re-emission updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub signal: Signal,
    pub severity: AlertSeverity,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SLO budget accounting, recomputed each tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetRecord {
    /// Allowed error fraction for the window
    pub total: f64,
    /// Fraction of the budget consumed so far
    pub consumed: f64,
    pub window: Duration,
    /// Burn over the fast window, as a multiple of sustainable burn
    pub fast_burn_rate: f64,
    /// Burn over the slow window
    pub slow_burn_rate: f64,
    /// Projected time until the budget is gone at the current fast burn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_exhaustion: Option<Duration>,
}

/// Alert state machine: clear -> warning -> critical with dwell on the way
/// up and cooldown on the way down.
#[derive(Debug, Default)]
struct AlertTracker {
    active: Option<Alert>,
    above_warning_since: Option<DateTime<Utc>>,
    above_critical_since: Option<DateTime<Utc>>,
    below_since: Option<DateTime<Utc>>,
}

struct Thresholds {
    warning: f64,
    critical: f64,
}

/// Rolling-window radar over one queue (or the whole deployment)
pub struct AnomalyRadar {
    config: SloConfig,
    window: Mutex<VecDeque<MetricSnapshot>>,
    trackers: Mutex<HashMap<Signal, AlertTracker>>,
}

impl AnomalyRadar {
    pub fn new(config: SloConfig) -> Self {
        Self {
            config,
            window: Mutex::new(VecDeque::new()),
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Append a snapshot, evicting beyond retention and the sample cap
    pub fn record(&self, snapshot: MetricSnapshot) {
        let mut window = self.window.lock();
        let cutoff = snapshot.at
            - chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        window.push_back(snapshot);
        while window
            .front()
            .map(|s| s.at < cutoff)
            .unwrap_or(false)
        {
            window.pop_front();
        }
        while window.len() > self.config.max_samples {
            window.pop_front();
        }
    }

    pub fn sample_count(&self) -> usize {
        self.window.lock().len()
    }

    fn thresholds(&self, signal: Signal) -> Thresholds {
        let budget = (1.0 - self.config.availability_target).max(1e-9);
        match signal {
            Signal::ErrorRate => Thresholds {
                warning: budget,
                critical: budget * 2.0,
            },
            Signal::LatencyP95 => Thresholds {
                warning: self.config.latency_threshold.as_secs_f64(),
                critical: self.config.latency_threshold.as_secs_f64() * 2.0,
            },
            // Jobs per second of sustained backlog growth
            Signal::BacklogGrowth => Thresholds {
                warning: 10.0,
                critical: 100.0,
            },
            Signal::FastBurn => Thresholds {
                warning: self.config.fast_burn_threshold / 2.0,
                critical: self.config.fast_burn_threshold,
            },
            Signal::SlowBurn => Thresholds {
                warning: self.config.slow_burn_threshold / 2.0,
                critical: self.config.slow_burn_threshold,
            },
        }
    }

    fn rate_over(&self, window: &VecDeque<MetricSnapshot>, span: Duration, now: DateTime<Utc>) -> f64 {
        let cutoff = now - chrono::Duration::from_std(span).unwrap_or_else(|_| chrono::Duration::hours(1));
        let (mut requests, mut errors) = (0u64, 0u64);
        for snapshot in window.iter().filter(|s| s.at >= cutoff) {
            requests += snapshot.request_count;
            errors += snapshot.error_count;
        }
        if requests == 0 {
            0.0
        } else {
            errors as f64 / requests as f64
        }
    }

    /// Current budget accounting
    pub fn budget(&self, now: DateTime<Utc>) -> BudgetRecord {
        let window = self.window.lock();
        let budget_rate = (1.0 - self.config.availability_target).max(1e-9);

        let overall = self.rate_over(&window, self.config.window, now);
        let fast = self.rate_over(&window, self.config.fast_burn_window, now);
        let slow = self.rate_over(&window, self.config.slow_burn_window, now);

        let consumed = (overall / budget_rate).min(1.0);
        let fast_burn_rate = fast / budget_rate;
        let slow_burn_rate = slow / budget_rate;

        let time_to_exhaustion = if fast_burn_rate > 1.0 {
            let remaining = (1.0 - consumed).max(0.0);
            let window_secs = self.config.window.as_secs_f64();
            Some(Duration::from_secs_f64(
                remaining * window_secs / fast_burn_rate,
            ))
        } else {
            None
        };

        BudgetRecord {
            total: budget_rate,
            consumed,
            window: self.config.window,
            fast_burn_rate,
            slow_burn_rate,
            time_to_exhaustion,
        }
    }

    fn signal_values(&self, now: DateTime<Utc>) -> HashMap<Signal, f64> {
        let window = self.window.lock();
        let mut values = HashMap::new();

        let tick = self.config.tick_interval;
        values.insert(Signal::ErrorRate, self.rate_over(&window, tick * 6, now));

        let recent_p95 = window
            .back()
            .map(|s| s.latency_p95.as_secs_f64())
            .unwrap_or(0.0);
        values.insert(Signal::LatencyP95, recent_p95);

        // Backlog growth: slope between the oldest and newest sample of the
        // last few ticks
        let cutoff = now - chrono::Duration::from_std(tick * 6).unwrap_or_else(|_| chrono::Duration::minutes(1));
        let recent: Vec<&MetricSnapshot> = window.iter().filter(|s| s.at >= cutoff).collect();
        let growth = match (recent.first(), recent.last()) {
            (Some(first), Some(last)) if last.at > first.at => {
                let secs = (last.at - first.at).num_milliseconds() as f64 / 1000.0;
                (last.backlog as f64 - first.backlog as f64) / secs.max(0.001)
            }
            _ => 0.0,
        };
        values.insert(Signal::BacklogGrowth, growth);
        drop(window);

        let budget = self.budget(now);
        values.insert(Signal::FastBurn, budget.fast_burn_rate);
        values.insert(Signal::SlowBurn, budget.slow_burn_rate);
        values
    }

    /// One evaluation pass: judge every signal, apply hysteresis, return
    /// the active alerts.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let values = self.signal_values(now);
        let dwell = chrono::Duration::from_std(self.config.dwell)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let cooldown = chrono::Duration::from_std(self.config.cooldown)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));

        let mut trackers = self.trackers.lock();
        for (signal, value) in &values {
            let thresholds = self.thresholds(*signal);
            let tracker = trackers.entry(*signal).or_default();

            let above_warning = *value >= thresholds.warning;
            let above_critical = *value >= thresholds.critical;

            if above_warning {
                tracker.below_since = None;
                tracker.above_warning_since.get_or_insert(now);
            } else {
                tracker.above_warning_since = None;
            }
            if above_critical {
                tracker.above_critical_since.get_or_insert(now);
            } else {
                tracker.above_critical_since = None;
            }

            let target_severity = if above_critical
                && tracker
                    .above_critical_since
                    .map(|t| now - t >= dwell)
                    .unwrap_or(false)
            {
                Some(AlertSeverity::Critical)
            } else if above_warning
                && tracker
                    .above_warning_since
                    .map(|t| now - t >= dwell)
                    .unwrap_or(false)
            {
                Some(AlertSeverity::Warning)
            } else {
                None
            };

            match (&mut tracker.active, target_severity) {
                (Some(alert), Some(severity)) => {
                    // Update in place; severity may escalate or de-escalate
                    if alert.severity != severity {
                        info!(signal = signal.name(), ?severity, "alert severity changed");
                    }
                    alert.severity = severity;
                    alert.value = *value;
                    alert.threshold = match severity {
                        AlertSeverity::Warning => thresholds.warning,
                        AlertSeverity::Critical => thresholds.critical,
                    };
                    alert.updated_at = now;
                }
                (None, Some(severity)) => {
                    warn!(signal = signal.name(), value, ?severity, "alert raised");
                    tracker.active = Some(Alert {
                        id: format!("radar:{}", signal.name()),
                        signal: *signal,
                        severity,
                        value: *value,
                        threshold: match severity {
                            AlertSeverity::Warning => thresholds.warning,
                            AlertSeverity::Critical => thresholds.critical,
                        },
                        message: format!(
                            "{} at {:.4} (threshold {:.4})",
                            signal.name(),
                            value,
                            thresholds.warning
                        ),
                        raised_at: now,
                        updated_at: now,
                    });
                }
                (Some(_), None) => {
                    // Below threshold: clear only after the cooldown
                    let since = *tracker.below_since.get_or_insert(now);
                    if now - since >= cooldown {
                        info!(signal = signal.name(), "alert cleared");
                        tracker.active = None;
                        tracker.below_since = None;
                    }
                }
                (None, None) => {}
            }
        }

        trackers
            .values()
            .filter_map(|t| t.active.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SloConfig {
        SloConfig {
            availability_target: 0.99,
            latency_threshold: Duration::from_millis(500),
            tick_interval: Duration::from_secs(10),
            dwell: Duration::ZERO,
            cooldown: Duration::from_secs(60),
            fast_burn_window: Duration::from_secs(3600),
            slow_burn_window: Duration::from_secs(6 * 3600),
            ..SloConfig::default()
        }
    }

    fn snapshot(at: DateTime<Utc>, requests: u64, errors: u64, p95_ms: u64) -> MetricSnapshot {
        MetricSnapshot {
            at,
            backlog: 0,
            request_count: requests,
            error_count: errors,
            latency_p50: Duration::from_millis(p95_ms / 2),
            latency_p95: Duration::from_millis(p95_ms),
            latency_p99: Duration::from_millis(p95_ms * 2),
        }
    }

    #[test]
    fn healthy_traffic_raises_nothing() {
        let radar = AnomalyRadar::new(config());
        let now = Utc::now();
        for i in 0..6 {
            radar.record(snapshot(
                now - chrono::Duration::seconds(60 - i * 10),
                1000,
                1,
                100,
            ));
        }
        assert!(radar.tick(now).is_empty());
    }

    #[test]
    fn elevated_error_rate_raises_and_updates_stable_id() {
        let radar = AnomalyRadar::new(config());
        let now = Utc::now();
        for i in 0..6 {
            radar.record(snapshot(
                now - chrono::Duration::seconds(60 - i * 10),
                1000,
                100,
                100,
            ));
        }

        let alerts = radar.tick(now);
        let error_alert = alerts
            .iter()
            .find(|a| a.signal == Signal::ErrorRate)
            .expect("error alert");
        assert_eq!(error_alert.id, "radar:error_rate");
        assert_eq!(error_alert.severity, AlertSeverity::Critical);

        // A second tick updates rather than duplicating
        let again = radar.tick(now + chrono::Duration::seconds(10));
        let ids: Vec<&str> = again
            .iter()
            .filter(|a| a.signal == Signal::ErrorRate)
            .map(|a| a.id.as_str())
            .collect();
        assert_eq!(ids, vec!["radar:error_rate"]);
    }

    #[test]
    fn alert_clears_only_after_cooldown() {
        let radar = AnomalyRadar::new(config());
        let now = Utc::now();
        for i in 0..6 {
            radar.record(snapshot(
                now - chrono::Duration::seconds(60 - i * 10),
                1000,
                100,
                100,
            ));
        }
        assert!(!radar.tick(now).is_empty());

        // Healthy samples replace the window
        let later = now + chrono::Duration::seconds(120);
        for i in 0..6 {
            radar.record(snapshot(
                later - chrono::Duration::seconds(60 - i * 10),
                1000,
                0,
                100,
            ));
        }
        // Below threshold but cooldown not elapsed: still active
        let active = radar.tick(later);
        assert!(active.iter().any(|a| a.signal == Signal::ErrorRate));

        // After the cooldown it clears
        let cleared = radar.tick(later + chrono::Duration::seconds(61));
        assert!(!cleared.iter().any(|a| a.signal == Signal::ErrorRate));
    }

    #[test]
    fn dwell_defers_raising() {
        let mut cfg = config();
        cfg.dwell = Duration::from_secs(30);
        let radar = AnomalyRadar::new(cfg);
        let now = Utc::now();
        for i in 0..6 {
            radar.record(snapshot(
                now - chrono::Duration::seconds(60 - i * 10),
                1000,
                100,
                100,
            ));
        }
        // First sighting starts the dwell clock; nothing raised yet
        assert!(radar.tick(now).is_empty());
        // Still above after the dwell: raised
        assert!(!radar.tick(now + chrono::Duration::seconds(31)).is_empty());
    }

    #[test]
    fn burn_rate_and_exhaustion_projection() {
        let mut cfg = config();
        cfg.window = Duration::from_secs(30 * 86_400);
        let radar = AnomalyRadar::new(cfg);
        let now = Utc::now();
        // 10% errors against a 1% budget: burn rate 10x
        for i in 0..6 {
            radar.record(snapshot(
                now - chrono::Duration::seconds(60 - i * 10),
                1000,
                100,
                100,
            ));
        }
        let budget = radar.budget(now);
        assert!((budget.fast_burn_rate - 10.0).abs() < 0.5);
        assert!(budget.time_to_exhaustion.is_some());
        assert!(budget.consumed > 0.0);
    }

    #[test]
    fn retention_and_cap_evict_old_samples() {
        let mut cfg = config();
        cfg.max_samples = 10;
        let radar = AnomalyRadar::new(cfg);
        let now = Utc::now();
        for i in 0..50 {
            radar.record(snapshot(now + chrono::Duration::seconds(i), 10, 0, 10));
        }
        assert_eq!(radar.sample_count(), 10);
    }
}
