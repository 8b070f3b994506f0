use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// How far back the history reaches.
pub const HISTORY_HORIZON_MINUTES: i64 = 30;
/// Window a verdict is computed over.
pub const EVALUATION_WINDOW_MINUTES: i64 = 10;

const MIN_HISTORY: usize = 10;
/// About five minutes at the usual two-second cadence.
const BASELINE_SAMPLES: usize = 150;
/// About ten minutes at the usual two-second cadence.
const MIN_EVALUATION_SAMPLES: usize = 300;
const MAJORITY: f64 = 0.8;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub speed: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Transition {
    Throttled {
        baseline: f64,
        recent_avg: f64,
        fraction_below: f64,
    },
    Recovered {
        recent_avg: f64,
    },
}

/// Two-state (normal/throttled) detector over a 30-minute speed history.
#[derive(Clone, Debug)]
pub struct ThrottleDetector {
    threshold_percent: f64,
    history: VecDeque<HistoryEntry>,
    baseline: Option<f64>,
    throttled: bool,
}

impl ThrottleDetector {
    pub fn new(threshold_percent: f64) -> Self {
        Self {
            threshold_percent,
            history: VecDeque::new(),
            baseline: None,
            throttled: false,
        }
    }

    /// Resume from persisted state; the horizon is applied against `now` at once.
    pub fn restore(
        threshold_percent: f64,
        history: Vec<HistoryEntry>,
        baseline: Option<f64>,
        throttled: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let mut detector = Self {
            threshold_percent,
            history: history.into(),
            baseline: baseline.filter(|b| *b > 0.0),
            throttled,
        };
        detector.prune(now);
        detector
    }

    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    pub fn history(&self) -> &VecDeque<HistoryEntry> {
        &self.history
    }

    pub fn threshold_speed(&self) -> Option<f64> {
        self.baseline.map(|b| b * (1.0 - self.threshold_percent / 100.0))
    }

    /// Feed one sample. Returns a transition only when the verdict flips.
    pub fn observe(&mut self, speed: f64, now: DateTime<Utc>) -> Option<Transition> {
        self.history.push_back(HistoryEntry { speed, timestamp: now });
        self.prune(now);

        if self.history.len() < MIN_HISTORY {
            return None;
        }

        if self.baseline.is_none() && self.history.len() >= BASELINE_SAMPLES {
            let sum: f64 = self.history.iter().take(BASELINE_SAMPLES).map(|e| e.speed).sum();
            let baseline = sum / BASELINE_SAMPLES as f64;
            info!(baseline_mbps = baseline, "Baseline speed established");
            self.baseline = Some(baseline);
        }

        let baseline = self.baseline.filter(|b| *b > 0.0)?;
        let threshold_speed = baseline * (1.0 - self.threshold_percent / 100.0);

        let window_start = now - Duration::minutes(EVALUATION_WINDOW_MINUTES);
        let recent: Vec<f64> = self
            .history
            .iter()
            .filter(|e| e.timestamp > window_start)
            .map(|e| e.speed)
            .collect();
        if recent.len() < MIN_EVALUATION_SAMPLES {
            return None;
        }

        let recent_avg = recent.iter().sum::<f64>() / recent.len() as f64;
        let below = recent.iter().filter(|s| **s < threshold_speed).count();
        let fraction_below = below as f64 / recent.len() as f64;

        let throttled = recent_avg < threshold_speed && fraction_below >= MAJORITY;
        let was = std::mem::replace(&mut self.throttled, throttled);
        match (was, throttled) {
            (false, true) => {
                info!(
                    baseline_mbps = baseline,
                    recent_avg_mbps = recent_avg,
                    below_pct = fraction_below * 100.0,
                    "Throttling detected"
                );
                Some(Transition::Throttled { baseline, recent_avg, fraction_below })
            }
            (true, false) => {
                info!(recent_avg_mbps = recent_avg, "Throttling appears to have ended");
                Some(Transition::Recovered { recent_avg })
            }
            _ => None,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::minutes(HISTORY_HORIZON_MINUTES);
        self.history.retain(|e| e.timestamp > cutoff);
    }
}
