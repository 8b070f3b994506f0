use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::session::{ErrorEvent, SessionState, Status};
use crate::stats::{band, DataPoint, PerformanceCategory, PerformanceStats};
use crate::throttle::HistoryEntry;

/// Data points written per snapshot; memory keeps more.
pub const PERSISTED_DATA_POINTS: usize = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceThresholds {
    pub close_range_low: f64,
    pub close_range_high: f64,
}

/// On-disk report of a session. Every field defaults so older files still load.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub status: Status,
    pub speed_mbps: f64,
    pub avg_speed: f64,
    pub peak_speed: f64,
    pub total_gb: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    /// Seconds since the (possibly back-dated) session start.
    pub session_duration: u64,
    pub session_start: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub throttle_detected: bool,
    pub baseline_speed: Option<f64>,
    pub data_cap_gb: f64,
    pub cap_percentage: f64,
    pub expected_speed_mbps: f64,
    pub performance_stats: PerformanceStats,
    pub performance_thresholds: PerformanceThresholds,
    #[serde(deserialize_with = "lenient_list")]
    pub performance_window: Vec<PerformanceCategory>,
    #[serde(deserialize_with = "lenient_list")]
    pub data_points: Vec<DataPoint>,
    #[serde(deserialize_with = "lenient_list")]
    pub errors: Vec<ErrorEvent>,
    #[serde(deserialize_with = "lenient_list")]
    pub speed_history: Vec<HistoryEntry>,
    /// Filled in by the supervisor when reporting.
    pub worker_running: bool,
}

impl Snapshot {
    pub fn capture(state: &SessionState, config: &Config, status: Status, now: DateTime<Utc>) -> Self {
        let agg = state.aggregator();
        let detector = state.detector();
        let total_gb = state.total_gb();
        let stats = agg.stats();
        let (low, high) = band(agg.expected_speed());

        Self {
            status,
            speed_mbps: round_to(agg.current_speed(), 2),
            avg_speed: round_to(agg.average_speed(), 2),
            peak_speed: round_to(agg.peak_speed(), 2),
            total_gb: round_to(total_gb, 3),
            total_bytes: Some(state.total_bytes()),
            session_duration: state.elapsed_secs(now),
            session_start: Some(state.session_start()),
            last_update: Some(now),
            throttle_detected: detector.is_throttled(),
            baseline_speed: detector.baseline(),
            data_cap_gb: config.data_cap_gb,
            cap_percentage: round_to(total_gb / config.data_cap_gb * 100.0, 1),
            expected_speed_mbps: agg.expected_speed(),
            performance_stats: PerformanceStats {
                close_to_expected: round_to(stats.close_to_expected, 1),
                far_below_expected: round_to(stats.far_below_expected, 1),
                far_above_expected: round_to(stats.far_above_expected, 1),
            },
            performance_thresholds: PerformanceThresholds {
                close_range_low: low,
                close_range_high: high,
            },
            performance_window: agg.performance().iter().copied().collect(),
            data_points: agg.data_points().tail(PERSISTED_DATA_POINTS).cloned().collect(),
            errors: state.errors().iter().cloned().collect(),
            speed_history: detector.history().iter().copied().collect(),
            worker_running: false,
        }
    }

    /// Zeroed report that keeps the configured ceiling and expectation visible.
    pub fn empty(config: &Config) -> Self {
        let (low, high) = band(config.expected_speed_mbps);
        Self {
            data_cap_gb: config.data_cap_gb,
            expected_speed_mbps: config.expected_speed_mbps,
            performance_thresholds: PerformanceThresholds {
                close_range_low: low,
                close_range_high: high,
            },
            ..Self::default()
        }
    }

    /// A previous session left something worth continuing.
    pub fn has_progress(&self) -> bool {
        self.total_gb > 0.0 || self.session_duration > 0 || !self.data_points.is_empty()
    }
}

/// A list where unreadable entries are skipped instead of failing the whole file.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
    let total = raw.len();
    let kept: Vec<T> = raw
        .into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect();
    if kept.len() < total {
        warn!(skipped = total - kept.len(), "Dropped unreadable snapshot entries");
    }
    Ok(kept)
}

fn round_to(value: f64, places: i32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Replace `path` with `bytes` so readers never see a partial file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("snapshot");
    let temp_path = dir.join(format!(".{file_name}.{}.tmp", std::process::id()));

    let result = (|| {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// The snapshot file shared by worker and supervisor.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Failures are logged and reported as `false`; callers keep going.
    pub fn save(&self, snapshot: &Snapshot) -> bool {
        let body = match serde_json::to_vec_pretty(snapshot) {
            Ok(body) => body,
            Err(e) => {
                error!(?e, "Serializing snapshot failed");
                return false;
            }
        };
        match write_atomic(&self.path, &body) {
            Ok(()) => {
                debug!(path = %self.path.display(), status = ?snapshot.status, "Snapshot saved");
                true
            }
            Err(e) => {
                error!(?e, path = %self.path.display(), "Writing snapshot failed");
                false
            }
        }
    }

    /// `None` when there is nothing usable on disk.
    pub fn load(&self) -> Option<Snapshot> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(?e, path = %self.path.display(), "Reading snapshot failed");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                error!(?e, path = %self.path.display(), "Snapshot is corrupt, ignoring it");
                None
            }
        }
    }
}
