use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ring::Bounded;

pub const RECENT_SPEEDS: usize = 30;
pub const PERFORMANCE_WINDOW: usize = 1000;
pub const DATA_POINTS: usize = 1000;

const BAND_LOW: f64 = 0.8;
const BAND_HIGH: f64 = 1.2;

pub const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Where a sample falls relative to the expected speed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceCategory {
    CloseToExpected,
    FarBelowExpected,
    FarAboveExpected,
}

impl PerformanceCategory {
    /// Both band edges count as close to expected.
    pub fn classify(speed_mbps: f64, expected_mbps: f64) -> Self {
        let (low, high) = band(expected_mbps);
        if speed_mbps < low {
            Self::FarBelowExpected
        } else if speed_mbps > high {
            Self::FarAboveExpected
        } else {
            Self::CloseToExpected
        }
    }
}

/// `(low, high)` edges of the close-to-expected band.
pub fn band(expected_mbps: f64) -> (f64, f64) {
    (expected_mbps * BAND_LOW, expected_mbps * BAND_HIGH)
}

/// Percent of the retained window in each category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceStats {
    pub close_to_expected: f64,
    pub far_below_expected: f64,
    pub far_above_expected: f64,
}

impl PerformanceStats {
    pub fn from_window<'a>(window: impl Iterator<Item = &'a PerformanceCategory>) -> Self {
        let (mut close, mut below, mut above) = (0usize, 0usize, 0usize);
        for category in window {
            match category {
                PerformanceCategory::CloseToExpected => close += 1,
                PerformanceCategory::FarBelowExpected => below += 1,
                PerformanceCategory::FarAboveExpected => above += 1,
            }
        }
        let total = close + below + above;
        if total == 0 {
            return Self::default();
        }
        let pct = |n: usize| n as f64 / total as f64 * 100.0;
        Self {
            close_to_expected: pct(close),
            far_below_expected: pct(below),
            far_above_expected: pct(above),
        }
    }
}

/// One chartable sample. Older snapshots may lack the category and expectation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub speed_mbps: f64,
    #[serde(default)]
    pub total_gb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_category: Option<PerformanceCategory>,
    #[serde(default)]
    pub expected_speed: f64,
}

/// Bounded rolling views over the sample stream.
#[derive(Clone, Debug)]
pub struct Aggregator {
    expected_speed: f64,
    recent_speeds: Bounded<f64>,
    peak_speed: f64,
    performance: Bounded<PerformanceCategory>,
    stats: PerformanceStats,
    data_points: Bounded<DataPoint>,
}

impl Aggregator {
    pub fn new(expected_speed: f64) -> Self {
        Self {
            expected_speed,
            recent_speeds: Bounded::new(RECENT_SPEEDS),
            peak_speed: 0.0,
            performance: Bounded::new(PERFORMANCE_WINDOW),
            stats: PerformanceStats::default(),
            data_points: Bounded::new(DATA_POINTS),
        }
    }

    /// Rebuild from persisted pieces. An empty `performance` window is replayed
    /// from the categories carried by `data_points`; a point without one is
    /// classified against the expectation it was measured under.
    pub fn restore(
        expected_speed: f64,
        peak_speed: f64,
        data_points: Vec<DataPoint>,
        performance: Vec<PerformanceCategory>,
    ) -> Self {
        let data_points: Vec<DataPoint> = data_points
            .into_iter()
            .map(|mut p| {
                if !p.expected_speed.is_finite() || p.expected_speed <= 0.0 {
                    p.expected_speed = expected_speed;
                }
                if p.performance_category.is_none() {
                    p.performance_category = Some(PerformanceCategory::classify(p.speed_mbps, p.expected_speed));
                }
                p
            })
            .collect();
        let mut agg = Self::new(expected_speed);
        agg.peak_speed = peak_speed.max(0.0);
        if performance.is_empty() {
            agg.performance
                .extend(data_points.iter().filter_map(|p| p.performance_category));
        } else {
            agg.performance.extend(performance);
        }
        agg.recent_speeds
            .extend(data_points.iter().map(|p| p.speed_mbps).skip(data_points.len().saturating_sub(RECENT_SPEEDS)));
        agg.data_points.extend(data_points);
        agg.stats = PerformanceStats::from_window(agg.performance.iter());
        agg
    }

    pub fn record(&mut self, speed_mbps: f64, total_bytes: u64, now: DateTime<Utc>) -> PerformanceCategory {
        self.recent_speeds.push(speed_mbps);
        if speed_mbps > self.peak_speed {
            self.peak_speed = speed_mbps;
        }

        let category = PerformanceCategory::classify(speed_mbps, self.expected_speed);
        self.performance.push(category);
        self.stats = PerformanceStats::from_window(self.performance.iter());

        self.data_points.push(DataPoint {
            timestamp: now,
            speed_mbps,
            total_gb: total_bytes as f64 / GIB,
            performance_category: Some(category),
            expected_speed: self.expected_speed,
        });
        category
    }

    pub fn expected_speed(&self) -> f64 {
        self.expected_speed
    }

    pub fn current_speed(&self) -> f64 {
        self.recent_speeds.last().copied().unwrap_or(0.0)
    }

    pub fn average_speed(&self) -> f64 {
        if self.recent_speeds.is_empty() {
            return 0.0;
        }
        self.recent_speeds.iter().sum::<f64>() / self.recent_speeds.len() as f64
    }

    pub fn peak_speed(&self) -> f64 {
        self.peak_speed
    }

    pub fn stats(&self) -> PerformanceStats {
        self.stats
    }

    pub fn recent_speeds(&self) -> &Bounded<f64> {
        &self.recent_speeds
    }

    pub fn performance(&self) -> &Bounded<PerformanceCategory> {
        &self.performance
    }

    pub fn data_points(&self) -> &Bounded<DataPoint> {
        &self.data_points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_band_is_inclusive() {
        use PerformanceCategory::*;
        assert_eq!(PerformanceCategory::classify(45.0, 60.0), FarBelowExpected);
        assert_eq!(PerformanceCategory::classify(60.0, 60.0), CloseToExpected);
        assert_eq!(PerformanceCategory::classify(75.0, 60.0), FarAboveExpected);
        assert_eq!(PerformanceCategory::classify(48.0, 60.0), CloseToExpected);
        assert_eq!(PerformanceCategory::classify(72.0, 60.0), CloseToExpected);
        assert_eq!(PerformanceCategory::classify(72.01, 60.0), FarAboveExpected);
    }

    #[test]
    fn windows_stay_bounded() {
        let mut agg = Aggregator::new(60.0);
        let now = Utc::now();
        for i in 0..2_500u64 {
            agg.record((i % 120) as f64, i * 1_000_000, now);
        }
        assert_eq!(agg.recent_speeds().len(), RECENT_SPEEDS);
        assert_eq!(agg.performance().len(), PERFORMANCE_WINDOW);
        assert_eq!(agg.data_points().len(), DATA_POINTS);
    }

    #[test]
    fn tracks_peak_current_and_average() {
        let mut agg = Aggregator::new(60.0);
        let now = Utc::now();
        for speed in [10.0, 90.0, 20.0] {
            agg.record(speed, 0, now);
        }
        assert_eq!(agg.peak_speed(), 90.0);
        assert_eq!(agg.current_speed(), 20.0);
        assert_eq!(agg.average_speed(), 40.0);
    }

    #[test]
    fn percentages_cover_full_window() {
        let mut agg = Aggregator::new(100.0);
        let now = Utc::now();
        for speed in [50.0, 100.0, 100.0, 150.0] {
            agg.record(speed, 0, now);
        }
        let stats = agg.stats();
        assert_eq!(stats.far_below_expected, 25.0);
        assert_eq!(stats.close_to_expected, 50.0);
        assert_eq!(stats.far_above_expected, 25.0);
    }

    #[test]
    fn data_point_carries_cumulative_gb() {
        let mut agg = Aggregator::new(60.0);
        agg.record(60.0, 3 * 1024 * 1024 * 1024, Utc::now());
        let point = agg.data_points().last().unwrap();
        assert_eq!(point.total_gb, 3.0);
        assert_eq!(point.expected_speed, 60.0);
    }

    #[test]
    fn restore_replays_categories_from_data_points() {
        let now = Utc::now();
        let points: Vec<DataPoint> = [10.0, 60.0, 200.0, 61.0]
            .iter()
            .map(|&speed| DataPoint {
                timestamp: now,
                speed_mbps: speed,
                total_gb: 0.0,
                performance_category: Some(PerformanceCategory::classify(speed, 60.0)),
                expected_speed: 60.0,
            })
            .collect();
        let agg = Aggregator::restore(60.0, 200.0, points, Vec::new());
        assert_eq!(agg.performance().len(), 4);
        assert_eq!(agg.stats().close_to_expected, 50.0);
        assert_eq!(agg.current_speed(), 61.0);
        assert_eq!(agg.peak_speed(), 200.0);
    }

    #[test]
    fn restore_prefers_persisted_window() {
        let window = vec![PerformanceCategory::FarBelowExpected; 7];
        let agg = Aggregator::restore(60.0, 0.0, Vec::new(), window);
        assert_eq!(agg.performance().len(), 7);
        assert_eq!(agg.stats().far_below_expected, 100.0);
    }

    #[test]
    fn restore_classifies_points_without_a_category() {
        let now = Utc::now();
        let bare = |speed: f64, expected: f64| DataPoint {
            timestamp: now,
            speed_mbps: speed,
            total_gb: 0.0,
            performance_category: None,
            expected_speed: expected,
        };
        // the second point was measured under a 20 Mbps expectation
        let agg = Aggregator::restore(100.0, 0.0, vec![bare(10.0, 0.0), bare(20.0, 20.0), bare(100.0, 0.0)], Vec::new());
        assert_eq!(agg.performance().len(), 3);
        let points: Vec<_> = agg.data_points().iter().map(|p| (p.performance_category, p.expected_speed)).collect();
        assert_eq!(
            points,
            vec![
                (Some(PerformanceCategory::FarBelowExpected), 100.0),
                (Some(PerformanceCategory::CloseToExpected), 20.0),
                (Some(PerformanceCategory::CloseToExpected), 100.0),
            ]
        );
    }
}
