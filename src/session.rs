use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::ring::Bounded;
use crate::snapshot::Snapshot;
use crate::stats::{Aggregator, PerformanceCategory, GIB};
use crate::throttle::{ThrottleDetector, Transition};

pub const ERROR_HISTORY: usize = 10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Stopped,
    Running,
    Paused,
}

impl Status {
    pub fn is_active(self) -> bool {
        matches!(self, Status::Running | Status::Paused)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "error")]
    pub message: String,
    #[serde(default, alias = "url")]
    pub target: String,
}

/// Live state of one measurement session, owned by the worker loop.
#[derive(Clone, Debug)]
pub struct SessionState {
    total_bytes: u64,
    session_start: DateTime<Utc>,
    aggregator: Aggregator,
    detector: ThrottleDetector,
    errors: Bounded<ErrorEvent>,
}

impl SessionState {
    pub fn fresh(config: &Config, now: DateTime<Utc>) -> Self {
        Self {
            total_bytes: 0,
            session_start: now,
            aggregator: Aggregator::new(config.expected_speed_mbps),
            detector: ThrottleDetector::new(config.throttle_threshold_percent),
            errors: Bounded::new(ERROR_HISTORY),
        }
    }

    /// Rebuild a session from its last snapshot.
    ///
    /// The start instant is back-dated by the persisted duration so elapsed time
    /// continues where it left off.
    pub fn resume(snapshot: &Snapshot, config: &Config, now: DateTime<Utc>) -> Self {
        let total_bytes = snapshot
            .total_bytes
            .unwrap_or_else(|| (snapshot.total_gb.max(0.0) * GIB).round() as u64);

        let aggregator = Aggregator::restore(
            config.expected_speed_mbps,
            snapshot.peak_speed,
            snapshot.data_points.clone(),
            snapshot.performance_window.clone(),
        );
        let detector = ThrottleDetector::restore(
            config.throttle_threshold_percent,
            snapshot.speed_history.clone(),
            snapshot.baseline_speed,
            snapshot.throttle_detected,
            now,
        );
        let mut errors = Bounded::new(ERROR_HISTORY);
        errors.extend(snapshot.errors.iter().cloned());

        let session_start = i64::try_from(snapshot.session_duration)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|elapsed| now.checked_sub_signed(elapsed))
            .unwrap_or_else(|| {
                warn!(
                    session_duration = snapshot.session_duration,
                    "Persisted session duration is out of range, restarting the session clock"
                );
                now
            });

        Self {
            total_bytes,
            session_start,
            aggregator,
            detector,
            errors,
        }
    }

    /// Account for one successful transfer and feed the statistics.
    pub fn record_transfer(
        &mut self,
        bytes: u64,
        speed_mbps: f64,
        now: DateTime<Utc>,
    ) -> (PerformanceCategory, Option<Transition>) {
        self.total_bytes = self.total_bytes.saturating_add(bytes);
        let category = self.aggregator.record(speed_mbps, self.total_bytes, now);
        let transition = self.detector.observe(speed_mbps, now);
        (category, transition)
    }

    pub fn record_error(&mut self, message: impl Into<String>, target: impl Into<String>, now: DateTime<Utc>) {
        self.errors.push(ErrorEvent {
            timestamp: now,
            message: message.into(),
            target: target.into(),
        });
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_gb(&self) -> f64 {
        self.total_bytes as f64 / GIB
    }

    pub fn session_start(&self) -> DateTime<Utc> {
        self.session_start
    }

    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.session_start).num_seconds().max(0) as u64
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn detector(&self) -> &ThrottleDetector {
        &self.detector
    }

    pub fn errors(&self) -> &Bounded<ErrorEvent> {
        &self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_starts_empty() {
        let now = Utc::now();
        let s = SessionState::fresh(&Config::default(), now);
        assert_eq!(s.total_bytes(), 0);
        assert_eq!(s.session_start(), now);
        assert!(s.detector().baseline().is_none());
    }

    #[test]
    fn total_bytes_only_grows() {
        let now = Utc::now();
        let mut s = SessionState::fresh(&Config::default(), now);
        let mut last = 0;
        for bytes in [10u64, 0, 5_000, 1] {
            s.record_transfer(bytes, 1.0, now);
            assert!(s.total_bytes() >= last);
            last = s.total_bytes();
        }
        assert_eq!(s.total_bytes(), 5_011);
    }

    #[test]
    fn errors_keep_last_ten() {
        let now = Utc::now();
        let mut s = SessionState::fresh(&Config::default(), now);
        for i in 0..25 {
            s.record_error(format!("boom {i}"), "http://x", now);
        }
        assert_eq!(s.errors().len(), ERROR_HISTORY);
        assert_eq!(s.errors().last().unwrap().message, "boom 24");
    }

    #[test]
    fn resume_restores_bytes_and_backdates_start() {
        let snapshot = Snapshot {
            status: Status::Running,
            total_gb: 10.0,
            session_duration: 3600,
            ..Snapshot::default()
        };
        let now = Utc::now();
        let s = SessionState::resume(&snapshot, &Config::default(), now);
        assert_eq!(s.total_bytes(), 10 * 1024 * 1024 * 1024);
        assert_eq!(s.session_start(), now - Duration::seconds(3600));
        assert_eq!(s.elapsed_secs(now), 3600);
    }

    #[test]
    fn resume_with_out_of_range_duration_restarts_clock() {
        let now = Utc::now();
        for session_duration in [10_000_000_000_000, u64::MAX] {
            let snapshot = Snapshot { total_gb: 2.0, session_duration, ..Snapshot::default() };
            let s = SessionState::resume(&snapshot, &Config::default(), now);
            assert_eq!(s.session_start(), now);
            assert_eq!(s.total_bytes(), 2 * 1024 * 1024 * 1024);
        }
    }

    #[test]
    fn resume_prefers_exact_byte_counter() {
        let snapshot = Snapshot {
            total_gb: 0.001,
            total_bytes: Some(1_234_567),
            ..Snapshot::default()
        };
        let s = SessionState::resume(&snapshot, &Config::default(), Utc::now());
        assert_eq!(s.total_bytes(), 1_234_567);
    }

    #[test]
    fn resume_keeps_baseline_and_verdict() {
        let snapshot = Snapshot {
            baseline_speed: Some(87.5),
            throttle_detected: true,
            ..Snapshot::default()
        };
        let s = SessionState::resume(&snapshot, &Config::default(), Utc::now());
        assert_eq!(s.detector().baseline(), Some(87.5));
        assert!(s.detector().is_throttled());
    }
}
